//! ontoship-journal: Tamper-evident record of every cutover attempt.
//!
//! Each deploy or rollback against one host produces a `DeployRecord`:
//! the state transitions the cutover went through, the actions it took
//! (stop, repoint, start, cleanup) and how it ended. Records are
//! content-hashed with BLAKE3 so later edits are detectable, and stored
//! as JSON files by date.

pub mod hash;
pub mod session;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use session::JournalSession;
pub use store::{FileJournalStore, JournalQuery, JournalStore, StoreError};

// ── Core Types ───────────────────────────────────────────────────

/// Unique identifier for a deploy record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A state change observed by the cutover controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

/// A side effect performed against the host or its service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    /// Kind of action (e.g. "extract", "stop_service", "repoint").
    pub kind: String,
    pub description: String,
    pub details: serde_json::Value,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// How the attempt ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The alias names the new release and the service is up.
    Published,
    /// The alias names the new release but the service failed to start.
    PublishedServiceDown,
    /// Aborted; the previously published release is still in place.
    Failed,
    /// Operator cancellation before the swap.
    Cancelled,
}

/// The complete record of one cutover attempt on one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployRecord {
    pub id: RecordId,
    /// Target host label ("local" or the ssh host name).
    pub host: String,
    pub base_name: String,
    /// Release directory name being published.
    pub release: String,
    /// Release the alias pointed at before the attempt, if any.
    pub previous: Option<String>,
    /// "deploy" or "rollback".
    pub intent: String,
    pub transitions: Vec<Transition>,
    pub actions: Vec<Action>,
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// BLAKE3 content hash (hex), set when the session finishes.
    pub content_hash: Option<String>,
}

impl DeployRecord {
    /// Compute the BLAKE3 hash over every field except `content_hash`.
    pub fn compute_hash(&self) -> String {
        hash::compute_record_hash(self)
    }

    /// Whether the stored hash matches the record's content.
    pub fn verify_integrity(&self) -> bool {
        match &self.content_hash {
            Some(stored) => stored == &self.compute_hash(),
            None => false,
        }
    }
}
