//! Configuration management for ontoship binaries.
//!
//! Configuration is loaded from (in priority order):
//! 1. Command-line overrides (applied by each binary)
//! 2. Environment variables (`ONTOSHIP_` prefix, `__` as the section separator)
//! 3. Config file (`ontoship.toml`, or the prefix given with `--config`)
//! 4. Defaults

use serde::de::DeserializeOwned;

use crate::error::OntoshipError;

/// Environment variable prefix for every section.
pub const ENV_PREFIX: &str = "ONTOSHIP";

/// Default config file prefix.
pub const DEFAULT_CONFIG_PREFIX: &str = "ontoship";

/// Build the layered configuration (file, then environment).
pub fn load(file_prefix: &str) -> Result<config::Config, OntoshipError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("release.hosts")
                .try_parsing(true),
        )
        .build()?;
    Ok(cfg)
}

/// Deserialize one section, falling back to its defaults when absent.
///
/// A section that is present but malformed is an error, not a silent default.
pub fn section<T>(cfg: &config::Config, name: &str) -> Result<T, OntoshipError>
where
    T: DeserializeOwned + Default,
{
    match cfg.get::<T>(name) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => {
            tracing::debug!(section = name, "Config section absent, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(OntoshipError::Config(format!("[{name}]: {e}"))),
    }
}
