//! BLAKE3 content hashing for deploy records.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{Action, DeployRecord, Outcome, RecordId, Transition};

/// Hashable view of a record (excludes `content_hash`).
#[derive(Serialize)]
struct HashableRecord<'a> {
    id: &'a RecordId,
    host: &'a str,
    base_name: &'a str,
    release: &'a str,
    previous: &'a Option<String>,
    intent: &'a str,
    transitions: &'a [Transition],
    actions: &'a [Action],
    outcome: &'a Option<Outcome>,
    error: &'a Option<String>,
    started_at: &'a DateTime<Utc>,
    completed_at: &'a Option<DateTime<Utc>>,
}

/// Serialize the record to canonical JSON and return its BLAKE3 hex digest.
pub fn compute_record_hash(record: &DeployRecord) -> String {
    let hashable = HashableRecord {
        id: &record.id,
        host: &record.host,
        base_name: &record.base_name,
        release: &record.release,
        previous: &record.previous,
        intent: &record.intent,
        transitions: &record.transitions,
        actions: &record.actions,
        outcome: &record.outcome,
        error: &record.error,
        started_at: &record.started_at,
        completed_at: &record.completed_at,
    };

    // Plain structs of strings and timestamps always serialize.
    let json = serde_json::to_vec(&hashable).unwrap_or_default();
    blake3::hash(&json).to_hex().to_string()
}
