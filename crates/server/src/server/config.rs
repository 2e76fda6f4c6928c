use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::server::phases::{
    CommandLayout, DEFAULT_REPO_ROOT, DEFAULT_SHORTCUT_SUFFIX, DEFAULT_STARTUP_DIR,
};

pub const ENV_PREFIX: &str = "MACHINE_SYNC_";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// 0 disables the timeout.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_repo_root")]
    pub repo_root: String,

    #[serde(default = "default_startup_dir")]
    pub startup_dir: String,

    #[serde(default = "default_shortcut_suffix")]
    pub shortcut_suffix: String,

    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    #[serde(default = "default_sshpass_program")]
    pub sshpass_program: String,

    /// Machine ids to reconcile. Empty means every stored machine.
    #[serde(default)]
    pub machines: Vec<String>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialSyncConfig {
    data_dir: Option<String>,
    log_dir: Option<String>,
    poll_interval_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    repo_root: Option<String>,
    startup_dir: Option<String>,
    shortcut_suffix: Option<String>,
    ssh_program: Option<String>,
    sshpass_program: Option<String>,
    machines: Option<Vec<String>>,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_repo_root() -> String {
    DEFAULT_REPO_ROOT.to_string()
}

fn default_startup_dir() -> String {
    DEFAULT_STARTUP_DIR.to_string()
}

fn default_shortcut_suffix() -> String {
    DEFAULT_SHORTCUT_SUFFIX.to_string()
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_sshpass_program() -> String {
    "sshpass".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::merge(PartialSyncConfig::default(), PartialSyncConfig::default())
    }
}

impl SyncConfig {
    /// Layers defaults, the optional TOML file and `MACHINE_SYNC_*`
    /// environment variables, in increasing priority.
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config = match config_path {
            Some(path_str) => Self::read_file(Path::new(path_str))?,
            None => PartialSyncConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialSyncConfig = envy::prefixed(ENV_PREFIX)
            .from_env::<PartialSyncConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        // 3. Merge: environment overrides file
        let config = Self::merge(env_config, file_config);
        if config.poll_interval_secs == 0 {
            return Err("poll_interval_secs must be greater than zero".to_string());
        }
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<PartialSyncConfig, String> {
        if !path.exists() {
            return Ok(PartialSyncConfig::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))
    }

    fn merge(high: PartialSyncConfig, low: PartialSyncConfig) -> Self {
        Self {
            data_dir: high.data_dir.or(low.data_dir).unwrap_or_else(default_data_dir),
            log_dir: high.log_dir.or(low.log_dir).unwrap_or_else(default_log_dir),
            poll_interval_secs: high
                .poll_interval_secs
                .or(low.poll_interval_secs)
                .unwrap_or_else(default_poll_interval_secs),
            command_timeout_secs: high
                .command_timeout_secs
                .or(low.command_timeout_secs)
                .unwrap_or_else(default_command_timeout_secs),
            repo_root: high.repo_root.or(low.repo_root).unwrap_or_else(default_repo_root),
            startup_dir: high
                .startup_dir
                .or(low.startup_dir)
                .unwrap_or_else(default_startup_dir),
            shortcut_suffix: high
                .shortcut_suffix
                .or(low.shortcut_suffix)
                .unwrap_or_else(default_shortcut_suffix),
            ssh_program: high
                .ssh_program
                .or(low.ssh_program)
                .unwrap_or_else(default_ssh_program),
            sshpass_program: high
                .sshpass_program
                .or(low.sshpass_program)
                .unwrap_or_else(default_sshpass_program),
            machines: high.machines.or(low.machines).unwrap_or_default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    pub fn command_layout(&self) -> CommandLayout {
        CommandLayout {
            repo_root: self.repo_root.clone(),
            startup_dir: self.startup_dir.clone(),
            shortcut_suffix: self.shortcut_suffix.clone(),
        }
    }
}
