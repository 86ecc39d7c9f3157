//! External process wrappers: local shell, ssh and scp.
//!
//! Every child runs under `tokio::process::Command` with `kill_on_drop`, so a
//! timed-out or cancelled step never leaves a process behind on this side.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::TransportError;

/// Exit code ssh uses for its own failures (as opposed to the remote command's).
const SSH_FAILURE: i32 = 255;

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, or the exit code when stderr is empty.
    pub fn reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.code.unwrap_or(-1))
        } else {
            stderr.to_string()
        }
    }
}

enum RunError {
    Spawn(std::io::Error),
    Timeout,
}

async fn run(mut cmd: Command, limit: Duration) -> Result<CommandOutput, RunError> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    let output = tokio::time::timeout(limit, cmd.output())
        .await
        .map_err(|_| RunError::Timeout)?
        .map_err(RunError::Spawn)?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quote a value for interpolation into a POSIX shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// ssh/scp access to one host.
#[derive(Debug, Clone)]
pub struct Ssh {
    host: String,
    options: Vec<String>,
    connect_timeout: Duration,
}

impl Ssh {
    pub fn new(host: impl Into<String>, options: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            options,
            connect_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = self.options.clone();
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        args
    }

    /// Run a shell script on the host. A non-zero exit of the script itself is
    /// returned as output; only ssh-level failures become errors.
    pub async fn run(&self, script: &str, limit: Duration) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.common_args()).arg(&self.host).arg("--").arg(script);

        tracing::debug!(host = %self.host, script, "ssh");
        let output = run(cmd, limit).await.map_err(|e| self.run_error(e, limit))?;
        if output.code == Some(SSH_FAILURE) {
            return Err(classify_ssh_failure(&self.host, &output.stderr));
        }
        Ok(output)
    }

    /// Copy a local file to `remote_path` on the host.
    pub async fn copy(
        &self,
        local: &Path,
        remote_path: &str,
        limit: Duration,
    ) -> Result<(), TransportError> {
        let mut cmd = Command::new("scp");
        cmd.args(self.common_args())
            .arg("-q")
            .arg(local)
            .arg(format!("{}:{}", self.host, remote_path));

        let output = run(cmd, limit).await.map_err(|e| self.run_error(e, limit))?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_ssh_failure(&self.host, &output.stderr))
        }
    }

    fn run_error(&self, err: RunError, limit: Duration) -> TransportError {
        match err {
            RunError::Timeout => TransportError::Timeout {
                host: self.host.clone(),
                secs: limit.as_secs(),
            },
            RunError::Spawn(e) => TransportError::IoFailure {
                host: self.host.clone(),
                reason: format!("could not launch ssh client: {e}"),
            },
        }
    }
}

/// Map ssh/scp diagnostics onto the transport error classes.
pub fn classify_ssh_failure(host: &str, stderr: &str) -> TransportError {
    let reason = stderr.trim().to_string();
    let lower = reason.to_lowercase();
    let host = host.to_string();

    if lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("too many authentication failures")
    {
        TransportError::AuthFailure { host, reason }
    } else if lower.contains("could not resolve")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("no route to host")
        || lower.contains("network is unreachable")
        || lower.contains("connection closed")
        || lower.contains("connection reset")
    {
        TransportError::Unreachable { host, reason }
    } else {
        TransportError::IoFailure { host, reason }
    }
}

/// Where shell scripts for a target run.
#[derive(Debug, Clone)]
pub enum Shell {
    Local,
    Remote(Ssh),
}

impl Shell {
    pub fn label(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Remote(ssh) => ssh.host(),
        }
    }

    pub async fn run(&self, script: &str, limit: Duration) -> Result<CommandOutput, TransportError> {
        match self {
            Self::Remote(ssh) => ssh.run(script, limit).await,
            Self::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                run(cmd, limit).await.map_err(|e| match e {
                    RunError::Timeout => TransportError::Timeout {
                        host: "local".to_string(),
                        secs: limit.as_secs(),
                    },
                    RunError::Spawn(e) => TransportError::IoFailure {
                        host: "local".to_string(),
                        reason: e.to_string(),
                    },
                })
            }
        }
    }
}
