//! Journal persistence: trait + file-backed implementation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::DeployRecord;

/// Errors from journal storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Deploy record has no content hash (session not finished)")]
    NotFinished,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filters for listing deploy records. Unset fields match everything.
#[derive(Debug, Default)]
pub struct JournalQuery {
    pub host: Option<String>,
    pub base_name: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JournalQuery {
    fn matches(&self, record: &DeployRecord) -> bool {
        if self.host.as_ref().is_some_and(|h| h != &record.host) {
            return false;
        }
        if self.base_name.as_ref().is_some_and(|b| b != &record.base_name) {
            return false;
        }
        if self.from.is_some_and(|from| record.started_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.started_at > to) {
            return false;
        }
        true
    }
}

/// Storage backend for deploy records.
pub trait JournalStore {
    /// Store a finished record.
    fn save(&self, record: &DeployRecord) -> Result<(), StoreError>;

    /// Records matching the query, newest first.
    fn list(&self, query: &JournalQuery) -> Result<Vec<DeployRecord>, StoreError>;
}

/// Stores records as `{root}/YYYY/MM/DD/{id}.json`.
pub struct FileJournalStore {
    root: PathBuf,
}

impl FileJournalStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn record_path(&self, record: &DeployRecord) -> PathBuf {
        let date = record.started_at.format("%Y/%m/%d");
        self.root.join(format!("{date}/{}.json", record.id.0))
    }
}

impl JournalStore for FileJournalStore {
    fn save(&self, record: &DeployRecord) -> Result<(), StoreError> {
        if record.content_hash.is_none() {
            return Err(StoreError::NotFinished);
        }

        let path = self.record_path(record);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(record)?)?;

        tracing::debug!(record_id = %record.id, path = %path.display(), "Deploy record saved");
        Ok(())
    }

    fn list(&self, query: &JournalQuery) -> Result<Vec<DeployRecord>, StoreError> {
        let mut results = Vec::new();
        collect_records(&self.root, query, &mut results)?;
        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}

fn collect_records(
    dir: &Path,
    query: &JournalQuery,
    results: &mut Vec<DeployRecord>,
) -> Result<(), StoreError> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_records(&path, query, results)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let record: DeployRecord = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if query.matches(&record) {
                results.push(record);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JournalSession, Outcome};

    fn finished(host: &str, base_name: &str, outcome: Outcome) -> DeployRecord {
        let mut session = JournalSession::new(host, base_name, &format!("{base_name}-graph-T"), "deploy");
        session.record_transition("idle", "unpacking");
        session.record_action("extract", "Unpacked", serde_json::json!({"entries": 3}), true);
        session.finish(outcome)
    }

    #[test]
    fn save_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();
        let record = finished("h1", "sparc-data", Outcome::Published);

        store.save(&record).unwrap();
        let loaded = store.list(&JournalQuery::default()).unwrap();
        assert_eq!(loaded, vec![record]);
        assert!(loaded[0].verify_integrity());
    }

    #[test]
    fn tampered_record_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();
        let record = finished("h1", "sparc-data", Outcome::Failed);
        store.save(&record).unwrap();

        let path = store.record_path(&record);
        let mut edited: DeployRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        edited.outcome = Some(Outcome::Published);
        fs::write(&path, serde_json::to_string_pretty(&edited).unwrap()).unwrap();

        let loaded = store.list(&JournalQuery::default()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].verify_integrity());
    }

    #[test]
    fn unfinished_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();
        let mut record = finished("h1", "sparc-data", Outcome::Published);
        record.content_hash = None;
        assert!(matches!(store.save(&record), Err(StoreError::NotFinished)));
    }

    #[test]
    fn list_filters_by_host_and_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();
        store.save(&finished("h1", "sparc-data", Outcome::Published)).unwrap();
        store.save(&finished("h2", "sparc-data", Outcome::Published)).unwrap();
        store.save(&finished("h1", "nifstd", Outcome::Failed)).unwrap();

        let by_host = store
            .list(&JournalQuery {
                host: Some("h1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_host.len(), 2);

        let by_both = store
            .list(&JournalQuery {
                host: Some("h1".to_string()),
                base_name: Some("sparc-data".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_both.len(), 1);
        assert_eq!(by_both[0].host, "h1");

        let limited = store
            .list(&JournalQuery {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
