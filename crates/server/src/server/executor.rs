//! Remote command execution over ssh.
//!
//! The reconciler only ever sees the combined text a command printed. Whether a
//! command "worked" is decided from that text elsewhere; this module only
//! reports whether the command could be run at all.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::model::Machine;
use crate::server::encoding::decode_output;

/// Exit code ssh uses for its own failures (connection refused, auth, ...).
const SSH_TRANSPORT_EXIT_CODE: i32 = 255;
/// sshpass: 5 = wrong password, 6 = unknown host key.
const SSHPASS_TRANSPORT_EXIT_CODES: [i32; 2] = [5, 6];

/// Lowercased stderr fragments printed by ssh or sshpass themselves. Remote
/// commands pass their exit code through, so the code alone is not enough.
const TRANSPORT_SIGNATURES: [&str; 9] = [
    "ssh: connect to host",
    "ssh: could not resolve hostname",
    "permission denied (",
    "host key verification failed",
    "connection closed by",
    "connection reset by",
    "kex_exchange_identification",
    "ssh_exchange_identification",
    "sshpass:",
];

fn has_transport_signature(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    TRANSPORT_SIGNATURES.iter().any(|sig| stderr.contains(sig))
}

/// Where and as whom a command runs.
#[derive(Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl From<&Machine> for Target {
    fn from(machine: &Machine) -> Self {
        Self {
            host: machine.ip.clone(),
            port: machine.port,
            username: machine.username.clone(),
            secret: machine.password.clone(),
        }
    }
}

/// The command could not be run. Never used for "ran, but printed the wrong thing".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to start {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("Could not reach {host} (exit code {code}): {stderr}")]
    Connection {
        host: String,
        code: i32,
        stderr: String,
    },
    #[error("Command on {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` on `target` and returns stdout followed by stderr.
    async fn execute(&self, target: &Target, command: &str) -> Result<String, ExecError>;
}

/// Runs commands through the local `ssh` client, wrapped in `sshpass` when the
/// machine has a password.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_program: String,
    sshpass_program: String,
    timeout: Option<Duration>,
}

impl SshExecutor {
    pub fn new(
        ssh_program: impl Into<String>,
        sshpass_program: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            sshpass_program: sshpass_program.into(),
            timeout,
        }
    }

    fn build_command(&self, target: &Target, remote_command: &str) -> Command {
        let mut command = if target.secret.is_empty() {
            let mut cmd = Command::new(&self.ssh_program);
            cmd.args(["-o", "BatchMode=yes"]);
            cmd
        } else {
            // -e reads the password from SSHPASS so it never shows up in `ps`.
            let mut cmd = Command::new(&self.sshpass_program);
            cmd.env("SSHPASS", &target.secret);
            cmd.arg("-e");
            cmd.arg(&self.ssh_program);
            cmd
        };
        command.args([
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            "ConnectTimeout=15",
            "-p",
        ]);
        command.arg(target.port.to_string());
        command.arg(format!("{}@{}", target.username, target.host));
        command.arg(remote_command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Whether ssh or sshpass failed, as opposed to the remote command exiting
    /// with the same code. sshpass reports a rejected password or host key
    /// without printing anything, so silence counts for its codes.
    fn is_transport_failure(
        &self,
        target: &Target,
        code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> bool {
        match code {
            Some(SSH_TRANSPORT_EXIT_CODE) => has_transport_signature(stderr),
            Some(code)
                if !target.secret.is_empty() && SSHPASS_TRANSPORT_EXIT_CODES.contains(&code) =>
            {
                has_transport_signature(stderr)
                    || (stdout.trim().is_empty() && stderr.trim().is_empty())
            }
            _ => false,
        }
    }
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new("ssh", "sshpass", None)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, target: &Target, command: &str) -> Result<String, ExecError> {
        debug!(host = %target.host, command = %command, "Running remote command.");
        let mut child = self.build_command(target, command);
        let program = if target.secret.is_empty() {
            self.ssh_program.clone()
        } else {
            self.sshpass_program.clone()
        };

        let output_future = child.output();
        let output = match self.timeout {
            // Dropping the future on timeout kills the child (kill_on_drop).
            Some(limit) => match tokio::time::timeout(limit, output_future).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(host = %target.host, secs = limit.as_secs(), "Remote command timed out.");
                    return Err(ExecError::Timeout {
                        host: target.host.clone(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => output_future.await,
        }
        .map_err(|e| ExecError::Spawn {
            program,
            message: e.to_string(),
        })?;

        let stdout = decode_output(&output.stdout);
        let stderr = decode_output(&output.stderr);

        if self.is_transport_failure(target, output.status.code(), &stdout, &stderr) {
            warn!(host = %target.host, status = ?output.status, "ssh could not run the command.");
            return Err(ExecError::Connection {
                host: target.host.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        debug!(host = %target.host, status = ?output.status, "Remote command finished.");
        Ok(format!("{stdout}{stderr}"))
    }
}
