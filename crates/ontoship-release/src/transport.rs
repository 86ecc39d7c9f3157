//! Moves a packaged archive into a target's staging directory.
//!
//! Both variants write to a hidden `.partial` name first and rename over the
//! final path, so re-sending overwrites and the final path never names a
//! partial archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{shell_quote, Ssh};
use crate::error::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Label of the receiving host, for logs and errors.
    fn host(&self) -> &str;

    /// Deliver `archive` and return its path on the target.
    async fn send(&self, archive: &Path) -> Result<PathBuf, TransportError>;
}

fn archive_file_name(host: &str, archive: &Path) -> Result<String, TransportError> {
    archive
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| TransportError::IoFailure {
            host: host.to_string(),
            reason: format!("{} has no file name", archive.display()),
        })
}

/// Copy into a staging directory on this machine.
pub struct LocalTransport {
    staging: PathBuf,
    timeout: Duration,
}

impl LocalTransport {
    pub fn new(staging: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            staging: staging.into(),
            timeout,
        }
    }

    async fn copy(&self, archive: &Path, name: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.staging).await?;
        let dest = self.staging.join(name);
        let source = tokio::fs::canonicalize(archive).await?;
        if source == tokio::fs::canonicalize(&self.staging).await?.join(name) {
            return Ok(dest);
        }
        let partial = self.staging.join(format!(".{name}.partial"));
        tokio::fs::copy(archive, &partial).await?;
        tokio::fs::rename(&partial, &dest).await?;
        Ok(dest)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn host(&self) -> &str {
        "local"
    }

    async fn send(&self, archive: &Path) -> Result<PathBuf, TransportError> {
        let name = archive_file_name("local", archive)?;
        let dest = tokio::time::timeout(self.timeout, self.copy(archive, &name))
            .await
            .map_err(|_| TransportError::Timeout {
                host: "local".to_string(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| TransportError::IoFailure {
                host: "local".to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(archive = %dest.display(), "Archive staged locally");
        Ok(dest)
    }
}

/// `scp` into a staging directory on a remote host.
pub struct RemoteTransport {
    ssh: Ssh,
    staging: PathBuf,
    timeout: Duration,
    step_timeout: Duration,
}

impl RemoteTransport {
    pub fn new(ssh: Ssh, staging: impl Into<PathBuf>, timeout: Duration, step_timeout: Duration) -> Self {
        Self {
            ssh,
            staging: staging.into(),
            timeout,
            step_timeout,
        }
    }

    fn io_failure(&self, reason: String) -> TransportError {
        TransportError::IoFailure {
            host: self.ssh.host().to_string(),
            reason,
        }
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    fn host(&self) -> &str {
        self.ssh.host()
    }

    async fn send(&self, archive: &Path) -> Result<PathBuf, TransportError> {
        let name = archive_file_name(self.ssh.host(), archive)?;
        let local_size = tokio::fs::metadata(archive)
            .await
            .map_err(|e| self.io_failure(format!("{}: {e}", archive.display())))?
            .len();

        let staging = self.staging.to_string_lossy().into_owned();
        let dest = format!("{staging}/{name}");
        let partial = format!("{staging}/.{name}.partial");

        let mkdir = self
            .ssh
            .run(&format!("mkdir -p {}", shell_quote(&staging)), self.step_timeout)
            .await?;
        if !mkdir.success() {
            return Err(self.io_failure(mkdir.reason()));
        }

        tracing::info!(host = %self.ssh.host(), archive = %name, bytes = local_size, "Sending archive");
        self.ssh.copy(archive, &partial, self.timeout).await?;

        let finish = self
            .ssh
            .run(
                &format!(
                    "mv -f {p} {d} && stat -c %s {d}",
                    p = shell_quote(&partial),
                    d = shell_quote(&dest)
                ),
                self.step_timeout,
            )
            .await?;
        if !finish.success() {
            return Err(self.io_failure(finish.reason()));
        }

        let remote_size: u64 = finish
            .stdout
            .trim()
            .parse()
            .map_err(|_| self.io_failure(format!("unexpected stat output: {}", finish.stdout.trim())))?;
        if remote_size != local_size {
            return Err(self.io_failure(format!(
                "size mismatch after transfer: sent {local_size} bytes, host has {remote_size}"
            )));
        }

        tracing::info!(host = %self.ssh.host(), archive = %dest, "Archive delivered");
        Ok(PathBuf::from(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_send_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("sparc-data-graph-20240115T093000Z.zip");
        std::fs::write(&archive, b"first").unwrap();
        let staging = dir.path().join("staging");
        let transport = LocalTransport::new(&staging, Duration::from_secs(5));

        let dest = transport.send(&archive).await.unwrap();
        assert_eq!(dest, staging.join("sparc-data-graph-20240115T093000Z.zip"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"first");

        std::fs::write(&archive, b"second").unwrap();
        let again = transport.send(&archive).await.unwrap();
        assert_eq!(again, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"second");

        let leftovers: Vec<_> = std::fs::read_dir(&staging)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_local_send_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a-graph-20240115T093000Z.zip");
        std::fs::write(&archive, b"zip").unwrap();
        let transport = LocalTransport::new(dir.path(), Duration::from_secs(5));

        let dest = transport.send(&archive).await.unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"zip");
    }

    #[tokio::test]
    async fn test_local_send_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path().join("staging"), Duration::from_secs(5));
        let err = transport.send(&dir.path().join("missing.zip")).await.unwrap_err();
        assert!(matches!(err, TransportError::IoFailure { .. }));
    }
}
