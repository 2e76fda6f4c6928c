//! Per-phase command templates and the output patterns that decide whether a
//! phase succeeded.
//!
//! None of the remote tools report a structured result, so success is read
//! off their text output. The phrases below are matched verbatim, including
//! the localized (zh-CN) confirmations printed by `SCHTASKS`; changing the
//! remote locale or tool versions breaks detection.

use std::{fmt, str::FromStr};

use crate::model::ServiceStatus;

/// Substring predicate over a command's output.
///
/// Matches when no `none_of` phrase occurs, every `all_of` phrase occurs,
/// and (if `any_of` is non-empty) at least one `any_of` phrase occurs.
#[derive(Debug, Clone, Copy)]
pub struct OutputRule {
    pub all_of: &'static [&'static str],
    pub any_of: &'static [&'static str],
    pub none_of: &'static [&'static str],
}

impl OutputRule {
    pub fn matches(&self, output: &str) -> bool {
        self.none_of.iter().all(|p| !output.contains(p))
            && self.all_of.iter().all(|p| output.contains(p))
            && (self.any_of.is_empty() || self.any_of.iter().any(|p| output.contains(p)))
    }
}

/// `git pull --rebase --autostash` brought the checkout up to date without conflicts.
pub const PULL_SUCCEEDED: OutputRule = OutputRule {
    all_of: &[],
    any_of: &["rebased and updated", "branch master is up to date"],
    none_of: &["autostash resulted in conflicts"],
};

/// One `yarn` step finished.
pub const BUILD_STEP_SUCCEEDED: OutputRule = OutputRule {
    all_of: &["Done in "],
    any_of: &[],
    none_of: &[],
};

/// `go test` failed because the module graph is out of date.
pub const DEPLOY_NEEDS_TIDY: OutputRule = OutputRule {
    all_of: &["no required module provides package"],
    any_of: &[],
    none_of: &[],
};

/// `go mod tidy` failed.
pub const TIDY_FAILED: OutputRule = OutputRule {
    all_of: &["error"],
    any_of: &[],
    none_of: &[],
};

pub const DEPLOY_SUCCEEDED: OutputRule = OutputRule {
    all_of: &["PASS", "ok"],
    any_of: &[],
    none_of: &[],
};

/// Task created, triggered and deleted.
pub const START_SUCCEEDED: OutputRule = OutputRule {
    all_of: &["成功创建", "尝试运行", "被成功删除"],
    any_of: &[],
    none_of: &[],
};

/// An action that moves a service into one lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pull,
    Build,
    Deploy,
    Start,
    Stop,
}

impl Phase {
    /// Status a service carries while this phase runs and after it ends.
    pub fn status(&self) -> ServiceStatus {
        match self {
            Phase::Pull => ServiceStatus::Pull,
            Phase::Build => ServiceStatus::Build,
            Phase::Deploy => ServiceStatus::Deploy,
            Phase::Start => ServiceStatus::Running,
            Phase::Stop => ServiceStatus::Stopped,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pull => "pull",
            Phase::Build => "build",
            Phase::Deploy => "deploy",
            Phase::Start => "start",
            Phase::Stop => "stop",
        };
        f.write_str(name)
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pull" => Ok(Phase::Pull),
            "build" => Ok(Phase::Build),
            "deploy" => Ok(Phase::Deploy),
            "start" => Ok(Phase::Start),
            "stop" => Ok(Phase::Stop),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Remote directory conventions the action commands are built from.
///
/// Sources live in `<repo_root>/<service>`, the frontend in `.../web` and the
/// Go backend tests in `.../oss`. Services are started through the desktop
/// script's shortcut in the user's Startup folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLayout {
    pub repo_root: String,
    pub startup_dir: String,
    pub shortcut_suffix: String,
}

pub const DEFAULT_REPO_ROOT: &str = "C:/github_repos";
pub const DEFAULT_STARTUP_DIR: &str =
    r"C:\Users\Administrator\AppData\Roaming\Microsoft\Windows\Start Menu\Programs\Startup";
pub const DEFAULT_SHORTCUT_SUFFIX: &str = ".bat - 快捷方式.lnk";

impl Default for CommandLayout {
    fn default() -> Self {
        Self {
            repo_root: DEFAULT_REPO_ROOT.to_string(),
            startup_dir: DEFAULT_STARTUP_DIR.to_string(),
            shortcut_suffix: DEFAULT_SHORTCUT_SUFFIX.to_string(),
        }
    }
}

impl CommandLayout {
    fn service_dir(&self, service: &str) -> String {
        format!("{}/{}", self.repo_root.trim_end_matches('/'), service)
    }

    pub fn pull_command(&self, service: &str) -> String {
        format!("cd {} && git pull --rebase --autostash", self.service_dir(service))
    }

    pub fn install_command(&self, service: &str) -> String {
        format!("cd {}/web && yarn install", self.service_dir(service))
    }

    pub fn build_command(&self, service: &str) -> String {
        format!("cd {}/web && yarn build", self.service_dir(service))
    }

    pub fn test_command(&self, service: &str) -> String {
        format!("cd {}/oss && go test", self.service_dir(service))
    }

    pub fn tidy_command(&self, service: &str) -> String {
        format!("cd {} && go mod tidy", self.service_dir(service))
    }

    /// Creates a one-off scheduled task that opens the service's Startup
    /// shortcut, runs it, then deletes it. Going through the task scheduler
    /// puts the script in the interactive session instead of the ssh session.
    pub fn start_command(&self, service: &str) -> String {
        let create = format!(
            r#"SCHTASKS /Create /SC ONCE /ST "00:00" /TN "{service}" /TR "CMD /C START '' '{}\{service}{}' /K CD /D '%CD%'""#,
            self.startup_dir.trim_end_matches('\\'),
            self.shortcut_suffix,
        );
        let run = format!(r#"SCHTASKS /Run /TN "{service}""#);
        let delete = format!(r#"SCHTASKS /Delete /TN "{service}" /F"#);
        format!("{create} && {run} && {delete}")
    }

    /// Kills the process tree rooted at `pid`.
    pub fn stop_command(&self, pid: i32) -> String {
        format!("taskkill /T /F /PID {pid}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_conflict_overrides_success() {
        let output = "Successfully rebased and updated refs/heads/master.\n\
                      Applying autostash resulted in conflicts.\n";
        assert!(!PULL_SUCCEEDED.matches(output));
        assert!(PULL_SUCCEEDED.matches("Successfully rebased and updated refs/heads/master."));
        assert!(PULL_SUCCEEDED.matches("Current branch master is up to date."));
        assert!(!PULL_SUCCEEDED.matches("fatal: not a git repository"));
    }

    #[test]
    fn deploy_needs_both_markers() {
        assert!(DEPLOY_SUCCEEDED.matches("PASS\nok  \tgithub.com/casbin/oss\t0.412s"));
        assert!(!DEPLOY_SUCCEEDED.matches("PASS"));
        assert!(!DEPLOY_SUCCEEDED.matches("FAIL\tgithub.com/casbin/oss"));
    }

    #[test]
    fn start_needs_every_confirmation() {
        let full = "成功: 成功创建计划任务 \"casnode\"。\n成功: 尝试运行 \"casnode\"。\n成功: 计划的任务 \"casnode\" 被成功删除。";
        assert!(START_SUCCEEDED.matches(full));
        let missing_delete = "成功: 成功创建计划任务 \"casnode\"。\n成功: 尝试运行 \"casnode\"。";
        assert!(!START_SUCCEEDED.matches(missing_delete));
    }

    #[test]
    fn commands_follow_directory_layout() {
        let layout = CommandLayout::default();
        assert_eq!(
            layout.pull_command("casnode"),
            "cd C:/github_repos/casnode && git pull --rebase --autostash"
        );
        assert_eq!(layout.install_command("casnode"), "cd C:/github_repos/casnode/web && yarn install");
        assert_eq!(layout.build_command("casnode"), "cd C:/github_repos/casnode/web && yarn build");
        assert_eq!(layout.test_command("casnode"), "cd C:/github_repos/casnode/oss && go test");
        assert_eq!(layout.tidy_command("casnode"), "cd C:/github_repos/casnode && go mod tidy");
        assert_eq!(layout.stop_command(4120), "taskkill /T /F /PID 4120");
    }

    #[test]
    fn start_command_chains_three_task_steps() {
        let layout = CommandLayout {
            repo_root: "D:/src/".to_string(),
            startup_dir: r"C:\Startup\".to_string(),
            shortcut_suffix: ".bat.lnk".to_string(),
        };
        let command = layout.start_command("casnode");
        let parts: Vec<&str> = command.split(" && ").collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with(r#"SCHTASKS /Create /SC ONCE /ST "00:00" /TN "casnode""#));
        assert!(parts[0].contains(r"'C:\Startup\casnode.bat.lnk'"));
        assert!(parts[0].ends_with(r#"/K CD /D '%CD%'""#));
        assert_eq!(parts[1], r#"SCHTASKS /Run /TN "casnode""#);
        assert_eq!(parts[2], r#"SCHTASKS /Delete /TN "casnode" /F"#);
        assert_eq!(layout.pull_command("x"), "cd D:/src/x && git pull --rebase --autostash");
    }

    #[test]
    fn phases_map_to_statuses() {
        assert_eq!(Phase::Start.status(), ServiceStatus::Running);
        assert_eq!(Phase::Stop.status(), ServiceStatus::Stopped);
        assert_eq!("Deploy".parse::<Phase>(), Ok(Phase::Deploy));
        assert!("restart".parse::<Phase>().is_err());
    }
}
