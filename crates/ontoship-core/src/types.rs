//! Core domain types for graph releases.
//!
//! A release is one packaged graph snapshot. Its identity is the pair
//! (`BaseName`, `ReleaseTimestamp`), from which every on-disk name is derived:
//! the staged directory, the archive, and the unpacked directory on each host.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OntoshipError;

/// Separator between the base name and the timestamp in release names.
pub const GRAPH_INFIX: &str = "-graph-";

/// Extension of packaged release archives.
pub const ARCHIVE_EXTENSION: &str = "zip";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

// ── Base Name ─────────────────────────────────────────────────────

/// Name of a graph deployment (e.g. `sparc-data`).
///
/// Also the name of the published alias on every host, so it is restricted
/// to characters that are safe as a single path component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct BaseName(String);

impl BaseName {
    pub fn new(name: impl Into<String>) -> Result<Self, OntoshipError> {
        let name = name.into();
        let invalid = |reason: &str| OntoshipError::InvalidBaseName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if name.starts_with('.') {
            return Err(invalid("must not start with '.'"));
        }
        if name.contains(GRAPH_INFIX) {
            return Err(invalid("must not contain '-graph-'"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("only ASCII letters, digits, '-', '_' and '.' are allowed"));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BaseName {
    type Err = OntoshipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BaseName {
    type Error = OntoshipError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BaseName> for String {
    fn from(value: BaseName) -> Self {
        value.0
    }
}

// ── Timestamp ─────────────────────────────────────────────────────

/// Second-granularity UTC instant rendered as `YYYYMMDDTHHMMSSZ`.
///
/// The rendering is fixed width, so lexical order of the strings equals
/// chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReleaseTimestamp(DateTime<Utc>);

impl ReleaseTimestamp {
    /// Truncate an instant to whole seconds.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.with_nanosecond(0).unwrap_or(at))
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// The earliest timestamp at or after `at` that is strictly greater than `last`.
    pub fn next_after(at: DateTime<Utc>, last: Option<Self>) -> Self {
        let candidate = Self::from_datetime(at);
        match last {
            Some(prev) if candidate <= prev => Self(prev.0 + TimeDelta::seconds(1)),
            _ => candidate,
        }
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for ReleaseTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for ReleaseTimestamp {
    type Err = OntoshipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map(|naive| Self(naive.and_utc()))
            .map_err(|_| OntoshipError::InvalidTimestamp(s.to_string()))
    }
}

impl Serialize for ReleaseTimestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReleaseTimestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Release ───────────────────────────────────────────────────────

/// One packaged graph snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub base_name: BaseName,
    pub timestamp: ReleaseTimestamp,
    /// BLAKE3 hex digest of the archive bytes, once packaged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Release {
    pub fn new(base_name: BaseName, timestamp: ReleaseTimestamp) -> Self {
        Self {
            base_name,
            timestamp,
            checksum: None,
        }
    }

    /// `<base_name>-graph-<timestamp>`: the top-level directory inside the
    /// archive and the unpacked directory on every host.
    pub fn dir_name(&self) -> String {
        format!("{}{GRAPH_INFIX}{}", self.base_name, self.timestamp)
    }

    /// `<base_name>-graph-<timestamp>.zip`
    pub fn archive_name(&self) -> String {
        format!("{}.{ARCHIVE_EXTENSION}", self.dir_name())
    }

    /// Parse a release directory name back into a release.
    pub fn from_dir_name(name: &str) -> Result<Self, OntoshipError> {
        let invalid = || OntoshipError::InvalidReleaseName(name.to_string());
        let (base, stamp) = name.rsplit_once(GRAPH_INFIX).ok_or_else(invalid)?;
        let base_name = BaseName::new(base).map_err(|_| invalid())?;
        let timestamp = stamp.parse().map_err(|_| invalid())?;
        Ok(Self::new(base_name, timestamp))
    }

    /// Parse an archive file name (`...-graph-<ts>.zip`) back into a release.
    pub fn from_archive_name(name: &str) -> Result<Self, OntoshipError> {
        let stem = name
            .strip_suffix(ARCHIVE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(|| OntoshipError::InvalidReleaseName(name.to_string()))?;
        Self::from_dir_name(stem)
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

// ── Target ────────────────────────────────────────────────────────

/// Where a release is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// The machine running the pipeline; no network involved.
    Local,
    /// A host reached over ssh.
    Remote { host: String },
}

impl Target {
    pub fn remote(host: impl Into<String>) -> Self {
        Self::Remote { host: host.into() }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote { host } => f.write_str(host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: &str) -> ReleaseTimestamp {
        s.parse().unwrap()
    }

    #[test]
    fn test_base_name_validation() {
        assert!(BaseName::new("sparc-data").is_ok());
        assert!(BaseName::new("NIF_ontology.v2").is_ok());
        assert!(BaseName::new("").is_err());
        assert!(BaseName::new(".hidden").is_err());
        assert!(BaseName::new("a/b").is_err());
        assert!(BaseName::new("x-graph-y").is_err());
        assert!(BaseName::new("with space").is_err());
    }

    #[test]
    fn test_timestamp_round_trip_and_order() {
        let t = ts("20240115T093000Z");
        assert_eq!(t.to_string(), "20240115T093000Z");
        assert!(ts("20240115T093000Z") < ts("20240115T093001Z"));
        assert!(ts("20231231T235959Z") < ts("20240101T000000Z"));
        assert!("2024-01-15".parse::<ReleaseTimestamp>().is_err());
    }

    #[test]
    fn test_next_after_bumps_on_collision() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        let first = ReleaseTimestamp::next_after(at, None);
        let second = ReleaseTimestamp::next_after(at, Some(first));
        let third = ReleaseTimestamp::next_after(at, Some(second));

        assert_eq!(first.to_string(), "20240115T093000Z");
        assert_eq!(second.to_string(), "20240115T093001Z");
        assert_eq!(third.to_string(), "20240115T093002Z");

        // A clock that moved forward wins over the bump.
        let later = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        assert_eq!(
            ReleaseTimestamp::next_after(later, Some(third)).to_string(),
            "20240115T100000Z"
        );
    }

    #[test]
    fn test_release_names() {
        let release = Release::new(
            BaseName::new("sparc-data").unwrap(),
            ts("20240115T093000Z"),
        );
        assert_eq!(release.dir_name(), "sparc-data-graph-20240115T093000Z");
        assert_eq!(release.archive_name(), "sparc-data-graph-20240115T093000Z.zip");

        let parsed = Release::from_archive_name(&release.archive_name()).unwrap();
        assert_eq!(parsed, release);
        assert!(Release::from_dir_name("sparc-data").is_err());
        assert!(Release::from_dir_name("sparc-data-graph-latest").is_err());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Local.to_string(), "local");
        assert_eq!(Target::remote("graph.example.org").to_string(), "graph.example.org");
        assert!(Target::remote("h").is_remote());
    }
}
