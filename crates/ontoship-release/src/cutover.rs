//! Per-host cutover controller.
//!
//! One controller drives every publish and rollback against a single host.
//! For each base name it runs the state machine
//! `Idle → Unpacking → Unpacked → Swapping → Published`, with `Failed`
//! reachable from any non-terminal state. Until `Swapping` begins a failure
//! leaves no observable trace: the half-unpacked release is removed and the
//! alias and service are untouched. Once `Swapping` begins, cancellation is
//! ignored and every failure triggers recovery before it is surfaced.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use ontoship_core::{BaseName, Release, ReleaseTimestamp};
use ontoship_journal::{JournalSession, Outcome, RecordId};

use crate::error::{CutoverError, ServiceError};
use crate::host::ReleaseHost;
use crate::journal;
use crate::service::ServiceControl;

// ── State machine ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverState {
    Idle,
    Unpacking,
    Unpacked,
    Swapping,
    Published,
    Failed,
}

impl CutoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Unpacking => "unpacking",
            Self::Unpacked => "unpacked",
            Self::Swapping => "swapping",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use CutoverState::*;
        match (self, next) {
            (Idle, Unpacking) | (Unpacking, Unpacked) | (Unpacked, Swapping) | (Swapping, Published) => {
                true
            }
            // Rollback republishes a release that is already unpacked.
            (Idle, Unpacked) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for CutoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Reports ──────────────────────────────────────────────────────

/// Limits for the individual cutover steps.
#[derive(Debug, Clone)]
pub struct CutoverTimeouts {
    pub extract: Duration,
    pub service: Duration,
    /// Small host operations: lock, inspect, repoint, cleanup.
    pub step: Duration,
}

impl Default for CutoverTimeouts {
    fn default() -> Self {
        Self {
            extract: Duration::from_secs(900),
            service: Duration::from_secs(120),
            step: Duration::from_secs(60),
        }
    }
}

/// Result of a successful deploy or rollback on one host.
#[derive(Debug, Clone, Serialize)]
pub struct CutoverReport {
    pub host: String,
    pub base_name: String,
    /// Release the alias names now.
    pub release: String,
    /// Release the alias named before.
    pub previous: Option<String>,
    pub state: CutoverState,
    pub record_id: RecordId,
}

/// One unpacked release on a host.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseEntry {
    pub release: String,
    pub timestamp: ReleaseTimestamp,
    pub published: bool,
}

// ── Attempt ──────────────────────────────────────────────────────

/// Bookkeeping for one deploy or rollback: current state plus journal.
struct Attempt<'a> {
    host: String,
    base: &'a BaseName,
    release: String,
    previous: Option<String>,
    state: CutoverState,
    states: &'a Mutex<HashMap<BaseName, CutoverState>>,
    session: JournalSession,
}

impl<'a> Attempt<'a> {
    fn new(
        controller: &'a CutoverController,
        base: &'a BaseName,
        release: String,
        intent: &str,
    ) -> Self {
        let host = controller.host.label().to_string();
        controller.states.lock().insert(base.clone(), CutoverState::Idle);
        let session = JournalSession::new(&host, base.as_str(), &release, intent);
        Self {
            host,
            base,
            release,
            previous: None,
            state: CutoverState::Idle,
            states: &controller.states,
            session,
        }
    }

    fn set_previous(&mut self, previous: Option<String>) {
        self.session.set_previous(previous.clone());
        self.previous = previous;
    }

    fn advance(&mut self, next: CutoverState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal cutover transition {} -> {}",
            self.state,
            next
        );
        tracing::info!(
            host = %self.host,
            base_name = %self.base,
            release = %self.release,
            from = %self.state,
            state = %next,
            "Cutover state changed"
        );
        self.session.record_transition(self.state.as_str(), next.as_str());
        self.state = next;
        self.states.lock().insert(self.base.clone(), next);
    }

    fn action(&mut self, kind: &str, description: &str, success: bool) {
        self.session.record_action(
            kind,
            description,
            serde_json::json!({ "host": self.host, "release": self.release }),
            success,
        );
    }

    fn finish(
        mut self,
        result: &Result<(), CutoverError>,
        journal_dir: Option<&Path>,
    ) -> CutoverReport {
        let outcome = match result {
            Ok(()) => Outcome::Published,
            Err(CutoverError::PublishedServiceDown { .. }) => Outcome::PublishedServiceDown,
            Err(CutoverError::Cancelled { .. }) => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        };

        if let Err(e) = result {
            tracing::error!(
                host = %self.host,
                base_name = %self.base,
                release = %self.release,
                error = %e,
                "Cutover did not complete"
            );
            self.session.record_error(&e.to_string());
            if !self.state.is_terminal() {
                self.advance(CutoverState::Failed);
            }
        }

        let record = journal::finalize_and_store(self.session, outcome, journal_dir);
        CutoverReport {
            host: self.host,
            base_name: self.base.to_string(),
            release: self.release,
            previous: self.previous,
            state: self.state,
            record_id: record.id,
        }
    }
}

// ── Host lock ────────────────────────────────────────────────────

/// Host-level lock held for one attempt.
///
/// If the attempt's future is dropped before `release`, the unlock runs
/// from a spawned task instead.
struct HostLock {
    host: Arc<dyn ReleaseHost>,
    base: BaseName,
    held: bool,
}

impl HostLock {
    async fn release(mut self) {
        self.held = false;
        self.host.unlock(&self.base).await;
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let (host, base) = (self.host.clone(), self.base.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(host = %host.label(), base_name = %base, "Cutover abandoned, releasing host lock");
                handle.spawn(async move { host.unlock(&base).await });
            }
            Err(_) => {
                tracing::error!(host = %host.label(), base_name = %base, "Cutover abandoned outside a runtime, host lock left in place")
            }
        }
    }
}

// ── Controller ───────────────────────────────────────────────────

/// Serializes and drives cutovers against one host.
pub struct CutoverController {
    host: Arc<dyn ReleaseHost>,
    service: Arc<dyn ServiceControl>,
    timeouts: CutoverTimeouts,
    journal_dir: Option<PathBuf>,
    gates: Mutex<HashMap<BaseName, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<HashMap<BaseName, CutoverState>>,
}

impl CutoverController {
    pub fn new(host: Arc<dyn ReleaseHost>, service: Arc<dyn ServiceControl>) -> Self {
        Self {
            host,
            service,
            timeouts: CutoverTimeouts::default(),
            journal_dir: None,
            gates: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: CutoverTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Record every attempt as a deploy journal entry under `dir`.
    pub fn with_journal(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    pub fn host_label(&self) -> &str {
        self.host.label()
    }

    /// Last observed state for `base` on this host.
    pub fn state(&self, base: &BaseName) -> CutoverState {
        self.states
            .lock()
            .get(base)
            .copied()
            .unwrap_or(CutoverState::Idle)
    }

    /// Unpacked releases of `base`, oldest first, with the published one marked.
    pub async fn releases(&self, base: &BaseName) -> Result<Vec<ReleaseEntry>, CutoverError> {
        let published = self.step("inspect alias", self.host.published(base)).await?;
        let releases = self.step("list releases", self.host.releases(base)).await?;
        Ok(releases
            .into_iter()
            .map(|release| {
                let name = release.dir_name();
                ReleaseEntry {
                    published: published.as_deref() == Some(name.as_str()),
                    release: name,
                    timestamp: release.timestamp,
                }
            })
            .collect())
    }

    /// Unpack `archive` (already on the host) and publish it.
    pub async fn deploy(
        &self,
        archive: &Path,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<CutoverReport, CutoverError> {
        let base = &release.base_name;
        let gate = self.gate(base);
        let _guard = gate.lock().await;
        let lock = self.acquire(base).await?;

        let mut attempt = Attempt::new(self, base, release.dir_name(), "deploy");
        let result = self.run_deploy(&mut attempt, archive, release, cancel).await;
        lock.release().await;

        let report = attempt.finish(&result, self.journal_dir.as_deref());
        result.map(|()| report)
    }

    /// Republish an older unpacked release: the newest one older than the
    /// current release, or the one with timestamp `to`.
    pub async fn rollback(
        &self,
        base: &BaseName,
        to: Option<ReleaseTimestamp>,
    ) -> Result<CutoverReport, CutoverError> {
        let gate = self.gate(base);
        let _guard = gate.lock().await;
        let lock = self.acquire(base).await?;

        let (current, target) = match self.rollback_target(base, to).await {
            Ok(found) => found,
            Err(e) => {
                lock.release().await;
                return Err(e);
            }
        };

        let dir = target.dir_name();
        let mut attempt = Attempt::new(self, base, dir.clone(), "rollback");
        attempt.set_previous(Some(current.clone()));
        attempt.advance(CutoverState::Unpacked);
        let result = self.swap(&mut attempt, base, &dir, Some(&current)).await;
        lock.release().await;

        let report = attempt.finish(&result, self.journal_dir.as_deref());
        result.map(|()| report)
    }

    fn gate(&self, base: &BaseName) -> Arc<tokio::sync::Mutex<()>> {
        self.gates.lock().entry(base.clone()).or_default().clone()
    }

    async fn acquire(&self, base: &BaseName) -> Result<HostLock, CutoverError> {
        self.step("lock", self.host.lock(base)).await?;
        Ok(HostLock {
            host: self.host.clone(),
            base: base.clone(),
            held: true,
        })
    }

    async fn step<T>(
        &self,
        step: &'static str,
        fut: impl Future<Output = Result<T, CutoverError>>,
    ) -> Result<T, CutoverError> {
        tokio::time::timeout(self.timeouts.step, fut)
            .await
            .map_err(|_| CutoverError::Timeout {
                step,
                secs: self.timeouts.step.as_secs(),
            })?
    }

    async fn service_step(
        &self,
        step: &'static str,
        fut: impl Future<Output = Result<(), ServiceError>>,
    ) -> Result<(), CutoverError> {
        match tokio::time::timeout(self.timeouts.service, fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CutoverError::Service(e)),
            Err(_) => Err(CutoverError::Timeout {
                step,
                secs: self.timeouts.service.as_secs(),
            }),
        }
    }

    async fn run_deploy(
        &self,
        attempt: &mut Attempt<'_>,
        archive: &Path,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<(), CutoverError> {
        let base = &release.base_name;
        let dir = release.dir_name();

        let previous = self.step("inspect alias", self.host.published(base)).await?;
        attempt.set_previous(previous.clone());
        if previous.as_deref() == Some(dir.as_str()) {
            return Err(CutoverError::AlreadyPublished(dir));
        }
        if cancel.is_cancelled() {
            return Err(CutoverError::Cancelled { release: dir });
        }

        let existing = self.step("list releases", self.host.releases(base)).await?;
        if existing.iter().any(|r| r.dir_name() == dir) {
            tracing::warn!(host = %attempt.host, release = %dir, "Removing stale release directory");
            let removed = self.step("cleanup", self.host.remove_release(&dir)).await;
            attempt.action("cleanup", "Removed stale directory from an earlier attempt", removed.is_ok());
            removed?;
        }

        attempt.advance(CutoverState::Unpacking);
        let extracted = self.extract(archive, release, &cancel.child_token()).await;
        let unpacked = match extracted {
            Ok(()) => self.step("verify", self.host.verify(release)).await,
            Err(e) => Err(e),
        };
        match &unpacked {
            Ok(()) => attempt.action("extract", &format!("Unpacked {dir}"), true),
            Err(e) => attempt.action("extract", &e.to_string(), false),
        }
        if let Err(e) = unpacked {
            self.discard(attempt, &dir).await;
            return Err(e);
        }

        attempt.advance(CutoverState::Unpacked);
        if cancel.is_cancelled() {
            self.discard(attempt, &dir).await;
            return Err(CutoverError::Cancelled { release: dir });
        }

        self.swap(attempt, base, &dir, previous.as_deref()).await
    }

    /// Extract under the extract timeout. On expiry the extractor is told to
    /// stop and awaited, so nothing is still writing when cleanup runs.
    async fn extract(
        &self,
        archive: &Path,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<(), CutoverError> {
        let mut extract = self.host.extract(archive, release, cancel);
        tokio::select! {
            result = &mut extract => result,
            _ = tokio::time::sleep(self.timeouts.extract) => {
                cancel.cancel();
                if let Err(e) = extract.await {
                    tracing::debug!(release = %release, error = %e, "Extractor stopped after timeout");
                }
                Err(CutoverError::Timeout {
                    step: "extract",
                    secs: self.timeouts.extract.as_secs(),
                })
            }
        }
    }

    /// Stop, repoint, verify, start. Cancellation is not consulted here.
    async fn swap(
        &self,
        attempt: &mut Attempt<'_>,
        base: &BaseName,
        dir: &str,
        previous: Option<&str>,
    ) -> Result<(), CutoverError> {
        attempt.advance(CutoverState::Swapping);

        if let Err(e) = self.service_step("stop service", self.service.stop()).await {
            attempt.action("stop_service", &e.to_string(), false);
            self.recover_service(attempt).await;
            return Err(e);
        }
        attempt.action("stop_service", &format!("Stopped {}", self.service.name()), true);

        let repointed = match self.step("repoint", self.host.repoint(base, dir)).await {
            Ok(()) => self.confirm_alias(base, dir).await,
            Err(e) => Err(e),
        };
        if let Err(e) = repointed {
            attempt.action("repoint", &e.to_string(), false);
            self.restore_alias(attempt, base, dir, previous).await;
            self.recover_service(attempt).await;
            return Err(e);
        }
        attempt.action("repoint", &format!("{base} -> {dir}"), true);

        match self.service_step("start service", self.service.start()).await {
            Ok(()) => {
                attempt.action("start_service", &format!("Started {}", self.service.name()), true);
                attempt.advance(CutoverState::Published);
                Ok(())
            }
            Err(e) => {
                attempt.action("start_service", &e.to_string(), false);
                attempt.advance(CutoverState::Published);
                let source = match e {
                    CutoverError::Service(source) => source,
                    other => ServiceError::StartFailed {
                        unit: self.service.name().to_string(),
                        reason: other.to_string(),
                    },
                };
                Err(CutoverError::PublishedServiceDown {
                    release: dir.to_string(),
                    source,
                })
            }
        }
    }

    async fn confirm_alias(&self, base: &BaseName, dir: &str) -> Result<(), CutoverError> {
        let now = self.step("inspect alias", self.host.published(base)).await?;
        if now.as_deref() == Some(dir) {
            return Ok(());
        }
        Err(CutoverError::RepointFailed {
            alias: base.to_string(),
            release: dir.to_string(),
            reason: format!("alias resolves to {now:?} after repoint"),
        })
    }

    /// Put the alias back on `previous` if a failed repoint left it elsewhere.
    async fn restore_alias(
        &self,
        attempt: &mut Attempt<'_>,
        base: &BaseName,
        dir: &str,
        previous: Option<&str>,
    ) {
        let Some(previous) = previous else {
            return;
        };
        match self.host.published(base).await {
            Ok(Some(current)) if current == previous => {}
            Ok(_) => {
                let restored = self.step("repoint", self.host.repoint(base, previous)).await;
                if let Err(e) = &restored {
                    tracing::error!(host = %attempt.host, base_name = %base, error = %e, "Failed to restore alias");
                }
                attempt.action("repoint", &format!("Restored {base} -> {previous}"), restored.is_ok());
            }
            Err(e) => {
                tracing::error!(host = %attempt.host, base_name = %base, release = %dir, error = %e, "Cannot inspect alias after failed repoint")
            }
        }
    }

    /// Best-effort start after an aborted swap.
    async fn recover_service(&self, attempt: &mut Attempt<'_>) {
        match self.service_step("start service", self.service.start()).await {
            Ok(()) => attempt.action("start_service", "Restarted on the previous release", true),
            Err(e) => {
                tracing::error!(host = %attempt.host, error = %e, "Service did not restart after aborted cutover");
                attempt.action("start_service", &e.to_string(), false);
            }
        }
    }

    async fn discard(&self, attempt: &mut Attempt<'_>, dir: &str) {
        let removed = self.step("cleanup", self.host.remove_release(dir)).await;
        if let Err(e) = &removed {
            tracing::warn!(host = %attempt.host, release = %dir, error = %e, "Failed to remove half-unpacked release");
        }
        attempt.action("cleanup", &format!("Removed {dir}"), removed.is_ok());
    }

    async fn rollback_target(
        &self,
        base: &BaseName,
        to: Option<ReleaseTimestamp>,
    ) -> Result<(String, Release), CutoverError> {
        let current = self
            .step("inspect alias", self.host.published(base))
            .await?
            .ok_or_else(|| CutoverError::NothingPublished(base.to_string()))?;
        let current_ts = Release::from_dir_name(&current).ok().map(|r| r.timestamp);
        let releases = self.step("list releases", self.host.releases(base)).await?;

        let target = match to {
            Some(ts) => releases
                .into_iter()
                .find(|r| r.timestamp == ts)
                .ok_or_else(|| CutoverError::ReleaseNotFound(Release::new(base.clone(), ts).dir_name()))?,
            None => releases
                .into_iter()
                .filter(|r| current_ts.map_or(true, |c| r.timestamp < c))
                .max_by_key(|r| r.timestamp)
                .ok_or_else(|| CutoverError::NoEarlierRelease(current.clone()))?,
        };
        if target.dir_name() == current {
            return Err(CutoverError::AlreadyPublished(current));
        }

        self.step("verify", self.host.verify(&target)).await?;
        Ok((current, target))
    }
}
