//! Error types for the release pipeline.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("Snapshot root not found: {0}")]
    SnapshotMissing(PathBuf),

    #[error("Snapshot root is not a readable directory: {path}: {reason}")]
    SnapshotUnreadable { path: PathBuf, reason: String },

    #[error("Failed to copy snapshot into {staged}: {source}")]
    Copy {
        staged: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive {archive}: {reason}")]
    Archive { archive: PathBuf, reason: String },

    #[error("Packaging task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Authentication to {host} failed: {reason}")]
    AuthFailure { host: String, reason: String },

    #[error("Transfer to {host} failed: {reason}")]
    IoFailure { host: String, reason: String },

    #[error("Transfer to {host} timed out after {secs}s")]
    Timeout { host: String, secs: u64 },
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to stop service {unit}: {reason}")]
    StopFailed { unit: String, reason: String },

    #[error("Failed to start service {unit}: {reason}")]
    StartFailed { unit: String, reason: String },
}

#[derive(Error, Debug)]
pub enum CutoverError {
    #[error("Failed to extract {release}: {reason}")]
    ExtractFailed { release: String, reason: String },

    #[error("Release {release} failed verification: {reason}")]
    VerifyFailed { release: String, reason: String },

    #[error("Failed to repoint alias {alias} to {release}: {reason}")]
    RepointFailed {
        alias: String,
        release: String,
        reason: String,
    },

    #[error("{path} exists and is not a symlink; refusing to replace it")]
    AliasNotSymlink { path: String },

    #[error("Another cutover for {base_name} holds the lock on {host}: {detail}")]
    Locked {
        host: String,
        base_name: String,
        detail: String,
    },

    #[error("Release {0} is already published")]
    AlreadyPublished(String),

    #[error("No release of {0} is published on this host")]
    NothingPublished(String),

    #[error("Release {0} is not unpacked on this host")]
    ReleaseNotFound(String),

    #[error("No release older than {0} to roll back to")]
    NoEarlierRelease(String),

    #[error("Cutover cancelled before swap; {release} removed")]
    Cancelled { release: String },

    #[error("{step} timed out after {secs}s")]
    Timeout { step: &'static str, secs: u64 },

    #[error("Cutover aborted: {0}")]
    Service(#[source] ServiceError),

    #[error("{release} is published but the service did not come back: {source}")]
    PublishedServiceDown {
        release: String,
        #[source]
        source: ServiceError,
    },

    #[error("Host command failed: {0}")]
    Host(String),
}

/// Top-level error for one pipeline run or one target within it.
#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Cutover(#[from] CutoverError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Target {target} did not finish within {secs}s")]
    TargetTimeout { target: String, secs: u64 },

    #[error("Target task failed: {0}")]
    Task(String),
}

impl From<ontoship_core::OntoshipError> for ReleaseError {
    fn from(e: ontoship_core::OntoshipError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReleaseError>;
