//! Turns a remote process listing into "which service scripts are running".
//!
//! Services are launched from `.bat` scripts on the remote desktop through
//! `cmd.exe /c`, so a running service shows up as a `cmd.exe` row whose command
//! line names the script. The listing comes from [`CENSUS_COMMAND`], whose rows
//! look like
//!
//! ```text
//! C:\Windows\system32\cmd.exe /c ""C:\Users\Administrator\Desktop\casnode.bat" "   4120
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Lists every `cmd.exe` process with its full command line and pid.
pub const CENSUS_COMMAND: &str = r#"wmic process where (name="cmd.exe") get CommandLine, ProcessID"#;

/// Compared case-insensitively.
const SHELL_PATH: &str = r"c:\windows\system32\cmd.exe";
const RUN_FLAG: &str = "/c";
/// Shell, flag, script and pid.
const MIN_TOKENS: usize = 4;

/// Name between the last `\Desktop\` segment and `.bat`.
static SCRIPT_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r".*\\Desktop\\(.*?)\.bat").expect("script name pattern is valid")
});

/// Observed script name -> process id.
pub type Census = HashMap<String, i32>;

/// Extracts the script base name from a launch path, or `None` when the path
/// is not a desktop `.bat` script.
pub fn parse_script_name(launch_path: &str) -> Option<&str> {
    SCRIPT_NAME_RE
        .captures(launch_path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Parses the output of [`CENSUS_COMMAND`]. Rows of any other shape are
/// ignored; an empty result is the normal "nothing running" answer.
pub fn parse_census(output: &str) -> Census {
    let mut census = Census::new();
    let normalized = output.replace('\r', "");

    for line in normalized.split('\n') {
        let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
        if tokens.len() < MIN_TOKENS
            || tokens[0].to_lowercase() != SHELL_PATH
            || tokens[1] != RUN_FLAG
        {
            continue;
        }

        let Some(name) = parse_script_name(tokens[2]) else {
            debug!(line = %line, "cmd.exe row does not run a desktop script.");
            continue;
        };

        let pid_token = tokens[tokens.len() - 1];
        match pid_token.parse::<i32>() {
            Ok(pid) => {
                census.insert(name.to_string(), pid);
            }
            Err(e) => {
                debug!(line = %line, error = %e, "Skipping row with unreadable pid.");
            }
        }
    }

    census
}

#[cfg(test)]
mod tests {
    use super::*;

    const WMIC_OUTPUT: &str = "CommandLine                                                                    ProcessId  \r\n\
C:\\Windows\\system32\\cmd.exe /c \"\"C:\\Users\\Administrator\\Desktop\\casnode.bat\" \"   4120       \r\n\
C:\\WINDOWS\\system32\\cmd.exe /c \"\"C:\\Users\\Administrator\\Desktop\\casdoor.bat\" \"   5236       \r\n\
\"C:\\Windows\\system32\\cmd.exe\"                                                  7012       \r\n\
C:\\Windows\\system32\\cmd.exe /c wmic process where (name=\"cmd.exe\") get CommandLine, ProcessID  8840 \r\n\
\r\n";

    #[test]
    fn single_row_with_bare_script_path() {
        let census = parse_census(r"C:\Windows\System32\cmd.exe /c C:\Users\X\Desktop\myservice.bat 1234");
        assert_eq!(census, HashMap::from([("myservice".to_string(), 1234)]));
    }

    #[test]
    fn wmic_listing_keeps_only_desktop_scripts() {
        let census = parse_census(WMIC_OUTPUT);
        assert_eq!(census.len(), 2);
        assert_eq!(census.get("casnode"), Some(&4120));
        assert_eq!(census.get("casdoor"), Some(&5236));
    }

    #[test]
    fn parsing_is_repeatable() {
        assert_eq!(parse_census(WMIC_OUTPUT), parse_census(WMIC_OUTPUT));
    }

    #[test]
    fn empty_and_unrelated_output_yield_nothing() {
        assert!(parse_census("").is_empty());
        assert!(parse_census("No Instance(s) Available.\r\n").is_empty());
        assert!(parse_census("/usr/bin/bash -c /home/x/Desktop/a.bat 12").is_empty());
        // Wrong flag.
        assert!(parse_census(r"C:\Windows\System32\cmd.exe /k C:\Users\X\Desktop\a.bat 12").is_empty());
        // Too few tokens.
        assert!(parse_census(r"C:\Windows\System32\cmd.exe /c 12").is_empty());
    }

    #[test]
    fn later_row_wins_for_duplicate_names() {
        let output = "C:\\Windows\\System32\\cmd.exe /c C:\\Users\\X\\Desktop\\svc.bat 10\n\
                      C:\\Windows\\System32\\cmd.exe /c C:\\Users\\X\\Desktop\\svc.bat 20\n";
        assert_eq!(parse_census(output).get("svc"), Some(&20));
    }

    #[test]
    fn bad_pid_skips_only_that_row() {
        let output = "C:\\Windows\\System32\\cmd.exe /c C:\\Users\\X\\Desktop\\broken.bat pid?\n\
                      C:\\Windows\\System32\\cmd.exe /c C:\\Users\\X\\Desktop\\fine.bat 77\n";
        let census = parse_census(output);
        assert_eq!(census.get("fine"), Some(&77));
        assert!(!census.contains_key("broken"));
    }

    #[test]
    fn script_name_uses_last_desktop_segment() {
        assert_eq!(
            parse_script_name(r#"""C:\Users\Administrator\Desktop\casnode.bat""#),
            Some("casnode")
        );
        assert_eq!(
            parse_script_name(r"D:\Desktop\backup\Users\me\Desktop\svc.bat"),
            Some("svc")
        );
        assert_eq!(parse_script_name(r"C:\Users\me\Documents\svc.bat"), None);
        assert_eq!(parse_script_name(r"C:\Users\me\Desktop\svc.cmd"), None);
    }
}
