//! Configuration for the release pipeline.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ontoship_core::{BaseName, Target};

use crate::error::{ReleaseError, Result};

/// Loaded from the `[release]` section or `ONTOSHIP_RELEASE__` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Name of the deployment and of the published alias (e.g. "sparc-data").
    #[serde(default)]
    pub base_name: String,

    /// Snapshot root produced by the graph build.
    #[serde(default = "default_build_location")]
    pub build_location: PathBuf,

    /// Runtime root on every target: release directories plus the alias.
    #[serde(default = "default_runtime_location")]
    pub runtime_location: PathBuf,

    /// Where archives are received on every target before extraction.
    #[serde(default = "default_staging_location")]
    pub staging_location: PathBuf,

    /// Account that owns the runtime root on remote hosts (`sudo -u`).
    #[serde(default)]
    pub service_user: Option<String>,

    /// systemd unit of the consuming service; no stop/start when unset.
    #[serde(default)]
    pub service_unit: Option<String>,

    /// Deploy to `hosts` over ssh instead of the local machine.
    #[serde(default)]
    pub remote: bool,

    /// Remote target hosts (ssh destinations).
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Extra ssh/scp options.
    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,

    /// Directory for deploy journal records; disabled when empty.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    #[serde(default = "default_extract_timeout")]
    pub extract_timeout_secs: u64,

    #[serde(default = "default_service_timeout")]
    pub service_timeout_secs: u64,

    /// Overall budget for one target (transfer plus cutover).
    #[serde(default = "default_target_timeout")]
    pub target_timeout_secs: u64,
}

fn default_build_location() -> PathBuf {
    PathBuf::from("./build/graph")
}

fn default_runtime_location() -> PathBuf {
    PathBuf::from("/var/lib/scigraph")
}

fn default_staging_location() -> PathBuf {
    PathBuf::from("/tmp/ontoship")
}

fn default_ssh_options() -> Vec<String> {
    vec!["-o".to_string(), "BatchMode=yes".to_string()]
}

fn default_journal_dir() -> String {
    "./journal".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_transfer_timeout() -> u64 {
    1800
}

fn default_extract_timeout() -> u64 {
    900
}

fn default_service_timeout() -> u64 {
    120
}

fn default_target_timeout() -> u64 {
    3600
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            base_name: String::new(),
            build_location: default_build_location(),
            runtime_location: default_runtime_location(),
            staging_location: default_staging_location(),
            service_user: None,
            service_unit: None,
            remote: false,
            hosts: Vec::new(),
            ssh_options: default_ssh_options(),
            journal_dir: default_journal_dir(),
            connect_timeout_secs: default_connect_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            extract_timeout_secs: default_extract_timeout(),
            service_timeout_secs: default_service_timeout(),
            target_timeout_secs: default_target_timeout(),
        }
    }
}

impl ReleaseConfig {
    pub fn base_name(&self) -> Result<BaseName> {
        if self.base_name.is_empty() {
            return Err(ReleaseError::Config(
                "base_name is required: set --base-name or release.base_name".to_string(),
            ));
        }
        Ok(BaseName::new(self.base_name.clone())?)
    }

    /// The deployment targets this configuration names.
    pub fn targets(&self) -> Result<Vec<Target>> {
        if !self.remote {
            return Ok(vec![Target::Local]);
        }
        if self.hosts.is_empty() {
            return Err(ReleaseError::Config(
                "remote deploy requires at least one host: set --host or release.hosts".to_string(),
            ));
        }
        Ok(self.hosts.iter().map(Target::remote).collect())
    }

    /// Resolve a single target for host-scoped commands (releases, rollback).
    pub fn target(&self, host: Option<&str>) -> Result<Target> {
        match host {
            Some("local") => Ok(Target::Local),
            Some(host) => Ok(Target::remote(host)),
            None => {
                let mut targets = self.targets()?;
                if targets.len() != 1 {
                    return Err(ReleaseError::Config(
                        "several hosts configured: choose one with --host".to_string(),
                    ));
                }
                Ok(targets.remove(0))
            }
        }
    }

    pub fn journal_dir(&self) -> Option<&str> {
        (!self.journal_dir.is_empty()).then_some(self.journal_dir.as_str())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn target_timeout(&self) -> Duration {
        Duration::from_secs(self.target_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReleaseConfig::default();
        assert_eq!(config.runtime_location, PathBuf::from("/var/lib/scigraph"));
        assert!(!config.remote);
        assert_eq!(config.targets().unwrap(), vec![Target::Local]);
        assert_eq!(config.journal_dir(), Some("./journal"));
        assert!(config.base_name().is_err());
    }

    #[test]
    fn test_remote_targets() {
        let config = ReleaseConfig {
            remote: true,
            hosts: vec!["graph-1".to_string(), "graph-2".to_string()],
            ..Default::default()
        };
        assert_eq!(
            config.targets().unwrap(),
            vec![Target::remote("graph-1"), Target::remote("graph-2")]
        );
        assert!(config.target(None).is_err());
        assert_eq!(config.target(Some("graph-2")).unwrap(), Target::remote("graph-2"));
        assert_eq!(config.target(Some("local")).unwrap(), Target::Local);
    }

    #[test]
    fn test_remote_without_hosts_is_error() {
        let config = ReleaseConfig {
            remote: true,
            ..Default::default()
        };
        assert!(matches!(config.targets(), Err(ReleaseError::Config(_))));
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ontoship.toml"),
            r#"
[release]
base_name = "sparc-data"
runtime_location = "/srv/scigraph"
service_unit = "scigraph"
remote = true
hosts = ["graph-1"]
"#,
        )
        .unwrap();

        let prefix = dir.path().join("ontoship");
        let cfg = ontoship_core::config::load(prefix.to_str().unwrap()).unwrap();
        let config: ReleaseConfig = ontoship_core::config::section(&cfg, "release").unwrap();

        assert_eq!(config.base_name().unwrap().as_str(), "sparc-data");
        assert_eq!(config.runtime_location, PathBuf::from("/srv/scigraph"));
        assert_eq!(config.service_unit.as_deref(), Some("scigraph"));
        assert_eq!(config.targets().unwrap(), vec![Target::remote("graph-1")]);
        assert_eq!(config.service_timeout_secs, 120);
    }
}
