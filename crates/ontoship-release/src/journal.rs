//! Deploy journal helpers for cutover attempts.

use std::path::Path;

use ontoship_journal::store::{FileJournalStore, JournalQuery, JournalStore, StoreError};
use ontoship_journal::{DeployRecord, JournalSession, Outcome};

/// Finish the session and store the record when a journal directory is set.
///
/// Storage failures are logged; they never fail the cutover.
pub fn finalize_and_store(
    session: JournalSession,
    outcome: Outcome,
    journal_dir: Option<&Path>,
) -> DeployRecord {
    let record = session.finish(outcome);
    let Some(dir) = journal_dir else {
        return record;
    };

    match FileJournalStore::new(dir).and_then(|store| store.save(&record)) {
        Ok(()) => tracing::info!(
            record_id = %record.id,
            host = %record.host,
            release = %record.release,
            outcome = ?outcome,
            "Deploy recorded"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to store deploy record"),
    }
    record
}

/// Stored records matching `query`, newest first.
pub fn history(journal_dir: &Path, query: &JournalQuery) -> Result<Vec<DeployRecord>, StoreError> {
    FileJournalStore::new(journal_dir)?.list(query)
}
