use thiserror::Error;

/// Top-level error type shared by ontoship crates.
#[derive(Error, Debug)]
pub enum OntoshipError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid base name {name:?}: {reason}")]
    InvalidBaseName { name: String, reason: String },

    #[error("Invalid release timestamp {0:?}: expected YYYYMMDDTHHMMSSZ")]
    InvalidTimestamp(String),

    #[error("Invalid release name {0:?}")]
    InvalidReleaseName(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for OntoshipError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
