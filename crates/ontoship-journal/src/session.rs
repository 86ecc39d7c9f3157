//! Incremental recorder used while a cutover runs.
//!
//! ```
//! # use ontoship_journal::{JournalSession, Outcome};
//! let mut session = JournalSession::new(
//!     "local",
//!     "sparc-data",
//!     "sparc-data-graph-20240115T093000Z",
//!     "deploy",
//! );
//! session.record_transition("idle", "unpacking");
//! session.record_action("extract", "Unpacked archive", serde_json::json!({}), true);
//! let record = session.finish(Outcome::Published);
//! assert!(record.verify_integrity());
//! ```

use chrono::Utc;

use crate::{Action, DeployRecord, Outcome, RecordId, Transition};

/// Builds a `DeployRecord` while the cutover progresses.
pub struct JournalSession {
    record: DeployRecord,
}

impl JournalSession {
    pub fn new(host: &str, base_name: &str, release: &str, intent: &str) -> Self {
        Self {
            record: DeployRecord {
                id: RecordId::new(),
                host: host.to_string(),
                base_name: base_name.to_string(),
                release: release.to_string(),
                previous: None,
                intent: intent.to_string(),
                transitions: Vec::new(),
                actions: Vec::new(),
                outcome: None,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
                content_hash: None,
            },
        }
    }

    pub fn id(&self) -> RecordId {
        self.record.id
    }

    /// Note which release the alias named before this attempt.
    pub fn set_previous(&mut self, previous: Option<String>) {
        self.record.previous = previous;
    }

    pub fn record_transition(&mut self, from: &str, to: &str) {
        self.record.transitions.push(Transition {
            from: from.to_string(),
            to: to.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_action(
        &mut self,
        kind: &str,
        description: &str,
        details: serde_json::Value,
        success: bool,
    ) {
        self.record.actions.push(Action {
            kind: kind.to_string(),
            description: description.to_string(),
            details,
            success,
            at: Utc::now(),
        });
    }

    /// Attach the error that ended (or degraded) the attempt.
    pub fn record_error(&mut self, error: &str) {
        self.record.error = Some(error.to_string());
    }

    /// Close the session and seal the record with its content hash.
    pub fn finish(mut self, outcome: Outcome) -> DeployRecord {
        self.record.outcome = Some(outcome);
        self.record.completed_at = Some(Utc::now());
        self.record.content_hash = Some(self.record.compute_hash());
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_seals_record() {
        let mut session = JournalSession::new("h1", "sparc-data", "sparc-data-graph-T", "deploy");
        session.set_previous(Some("sparc-data-graph-S".to_string()));
        session.record_transition("idle", "unpacking");
        session.record_transition("unpacking", "failed");
        session.record_action("extract", "zip is corrupt", serde_json::json!({}), false);
        session.record_error("extract failed");

        let record = session.finish(Outcome::Failed);
        assert_eq!(record.outcome, Some(Outcome::Failed));
        assert_eq!(record.transitions.len(), 2);
        assert_eq!(record.previous.as_deref(), Some("sparc-data-graph-S"));
        assert!(record.completed_at.is_some());
        assert!(record.verify_integrity());
    }

    #[test]
    fn edited_record_fails_integrity() {
        let session = JournalSession::new("h1", "sparc-data", "sparc-data-graph-T", "deploy");
        let mut record = session.finish(Outcome::Published);
        record.release = "sparc-data-graph-OTHER".to_string();
        assert!(!record.verify_integrity());
    }
}
