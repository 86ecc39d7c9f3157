//! Package once, then transfer and cut over on every target concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ontoship_core::{Release, Target};

use crate::command::{Shell, Ssh};
use crate::config::ReleaseConfig;
use crate::cutover::{CutoverController, CutoverReport, CutoverTimeouts};
use crate::error::{CutoverError, ReleaseError, Result};
use crate::host::{LocalHost, ReleaseHost, RemoteHost};
use crate::package::{PackagedRelease, Packager};
use crate::service::{NoService, ServiceControl, SystemdService};
use crate::transport::{LocalTransport, RemoteTransport, Transport};

/// How one target ended.
#[derive(Debug, Serialize)]
pub struct TargetOutcome {
    pub target: String,
    pub report: Option<CutoverReport>,
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of deploying one release to every configured target.
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub release: Release,
    pub archive: PathBuf,
    pub targets: Vec<TargetOutcome>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> usize {
        self.targets.iter().filter(|t| t.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.targets.len() - self.succeeded()
    }
}

/// Everything a target needs to receive and publish a release.
struct TargetOps {
    transport: Arc<dyn Transport>,
    controller: Arc<CutoverController>,
}

/// Release pipeline for one configuration.
///
/// Controllers are created once per target and reused, so cutovers issued
/// through the same pipeline share their per-base-name gates.
pub struct Pipeline {
    config: ReleaseConfig,
    packager: Packager,
    targets: Mutex<HashMap<Target, Arc<TargetOps>>>,
}

impl Pipeline {
    pub fn new(config: ReleaseConfig) -> Self {
        Self {
            config,
            packager: Packager::new(),
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    /// Package the configured snapshot.
    pub async fn build(&self) -> Result<PackagedRelease> {
        let base = self.config.base_name()?;
        Ok(self.packager.package(&self.config.build_location, &base).await?)
    }

    /// Build, then deploy to every configured target.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipelineReport> {
        let packaged = self.build().await?;
        self.deploy(&packaged.archive, &packaged.release, cancel).await
    }

    /// Transfer `archive` and publish `release` on every configured target.
    ///
    /// Each target runs in its own task, so one failing or stalled target
    /// does not hold up the others. The per-target timeout cancels a target
    /// that has not started swapping; a swap already under way runs to the
    /// end, bounded by the service and step timeouts.
    pub async fn deploy(
        &self,
        archive: &Path,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport> {
        let targets = self.config.targets()?;
        let limit = self.config.target_timeout();
        let mut tasks = JoinSet::new();

        tracing::info!(release = %release, targets = targets.len(), "Deploying release");

        for target in targets {
            let ops = self.ops(&target);
            let (archive, release, cancel) = (archive.to_path_buf(), release.clone(), cancel.clone());
            tasks.spawn(async move {
                let label = target.to_string();
                let budget = cancel.child_token();
                let timer = {
                    let budget = budget.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(limit).await;
                        budget.cancel();
                    })
                };
                let result = deploy_target(&ops, &archive, &release, &budget).await;
                timer.abort();

                let expired = budget.is_cancelled() && !cancel.is_cancelled();
                let result = match result {
                    Err(ReleaseError::Cutover(CutoverError::Cancelled { .. })) if expired => {
                        Err(ReleaseError::TargetTimeout {
                            target: label.clone(),
                            secs: limit.as_secs(),
                        })
                    }
                    Ok(report) if expired => {
                        tracing::warn!(target = %label, secs = limit.as_secs(), "Swap finished past the target timeout");
                        Ok(report)
                    }
                    other => other,
                };
                (label, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (target, result) = match joined {
                Ok(done) => done,
                Err(e) => ("unknown".to_string(), Err(ReleaseError::Task(e.to_string()))),
            };
            let outcome = match result {
                Ok(report) => {
                    tracing::info!(target = %target, release = %report.release, "Target published");
                    TargetOutcome {
                        target,
                        report: Some(report),
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::error!(target = %target, error = %e, "Target failed");
                    TargetOutcome {
                        target,
                        report: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.target.cmp(&b.target));

        Ok(PipelineReport {
            release: release.clone(),
            archive: archive.to_path_buf(),
            targets: outcomes,
        })
    }

    /// Cutover controller for a single target.
    pub fn controller(&self, target: &Target) -> Arc<CutoverController> {
        self.ops(target).controller.clone()
    }

    fn ops(&self, target: &Target) -> Arc<TargetOps> {
        self.targets
            .lock()
            .entry(target.clone())
            .or_insert_with(|| Arc::new(build_ops(&self.config, target)))
            .clone()
    }
}

async fn deploy_target(
    ops: &TargetOps,
    archive: &Path,
    release: &Release,
    cancel: &CancellationToken,
) -> Result<CutoverReport> {
    let cancelled = || CutoverError::Cancelled {
        release: release.dir_name(),
    };
    if cancel.is_cancelled() {
        return Err(cancelled().into());
    }
    let received = tokio::select! {
        sent = ops.transport.send(archive) => sent?,
        _ = cancel.cancelled() => return Err(cancelled().into()),
    };
    Ok(ops.controller.deploy(&received, release, cancel).await?)
}

fn build_ops(config: &ReleaseConfig, target: &Target) -> TargetOps {
    let timeouts = CutoverTimeouts {
        extract: config.extract_timeout(),
        service: config.service_timeout(),
        step: config.service_timeout(),
    };

    let (transport, host, shell): (Arc<dyn Transport>, Arc<dyn ReleaseHost>, Shell) = match target {
        Target::Local => (
            Arc::new(LocalTransport::new(
                &config.staging_location,
                config.transfer_timeout(),
            )),
            Arc::new(LocalHost::new(&config.runtime_location)),
            Shell::Local,
        ),
        Target::Remote { host } => {
            let ssh = Ssh::new(host, config.ssh_options.clone(), config.connect_timeout());
            (
                Arc::new(RemoteTransport::new(
                    ssh.clone(),
                    &config.staging_location,
                    config.transfer_timeout(),
                    config.service_timeout(),
                )),
                Arc::new(RemoteHost::new(
                    ssh.clone(),
                    &config.runtime_location,
                    config.service_user.clone(),
                    config.service_timeout(),
                    config.extract_timeout(),
                )),
                Shell::Remote(ssh),
            )
        }
    };

    let service: Arc<dyn ServiceControl> = match &config.service_unit {
        Some(unit) => Arc::new(SystemdService::new(unit, shell, config.service_timeout())),
        None => Arc::new(NoService),
    };

    let mut controller = CutoverController::new(host, service).with_timeouts(timeouts);
    if let Some(dir) = config.journal_dir() {
        controller = controller.with_journal(dir);
    }

    TargetOps {
        transport,
        controller: Arc::new(controller),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ServiceError, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Service whose stop takes `stop_delay`.
    #[derive(Default)]
    struct SlowService {
        stop_delay: Duration,
        calls: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ServiceControl for SlowService {
        fn name(&self) -> &str {
            "scigraph"
        }

        async fn stop(&self) -> std::result::Result<(), ServiceError> {
            self.calls.lock().unwrap().push("stop");
            tokio::time::sleep(self.stop_delay).await;
            Ok(())
        }

        async fn start(&self) -> std::result::Result<(), ServiceError> {
            self.calls.lock().unwrap().push("start");
            Ok(())
        }
    }

    /// Transfer that never completes.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        fn host(&self) -> &str {
            "stalled"
        }

        async fn send(&self, _archive: &Path) -> std::result::Result<PathBuf, TransportError> {
            std::future::pending::<std::result::Result<PathBuf, TransportError>>().await
        }
    }

    fn config(root: &Path, hosts: &[&str]) -> ReleaseConfig {
        let graph = root.join("build/graph");
        std::fs::create_dir_all(&graph).unwrap();
        std::fs::write(graph.join("graph.db"), b"nodes and edges").unwrap();
        ReleaseConfig {
            base_name: "sparc-data".to_string(),
            build_location: graph,
            remote: true,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            journal_dir: String::new(),
            target_timeout_secs: 1,
            ..Default::default()
        }
    }

    fn install(
        pipeline: &Pipeline,
        host: &str,
        transport: Arc<dyn Transport>,
        runtime: PathBuf,
        service: Arc<dyn ServiceControl>,
    ) {
        let controller = CutoverController::new(Arc::new(LocalHost::new(runtime)), service);
        pipeline.targets.lock().insert(
            Target::remote(host),
            Arc::new(TargetOps {
                transport,
                controller: Arc::new(controller),
            }),
        );
    }

    #[tokio::test]
    async fn test_target_timeout_does_not_interrupt_swap() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(config(dir.path(), &["serve-1"]));
        let service = Arc::new(SlowService {
            stop_delay: Duration::from_millis(1500),
            ..Default::default()
        });
        let runtime = dir.path().join("serve-1/runtime");
        install(
            &pipeline,
            "serve-1",
            Arc::new(LocalTransport::new(dir.path().join("serve-1/staging"), Duration::from_secs(60))),
            runtime.clone(),
            service.clone(),
        );

        let report = pipeline.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed(), 0);
        assert_eq!(*service.calls.lock().unwrap(), vec!["stop", "start"]);
        let alias = std::fs::read_link(runtime.join("sparc-data")).unwrap();
        assert_eq!(alias.to_string_lossy(), report.release.dir_name());
        assert!(!runtime.join(".sparc-data.lock").exists());

        let base = pipeline.config().base_name().unwrap();
        let controller = pipeline.controller(&Target::remote("serve-1"));
        assert_eq!(controller.state(&base), crate::CutoverState::Published);
    }

    #[tokio::test]
    async fn test_stalled_target_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(config(dir.path(), &["serve-1", "serve-2"]));
        let healthy = dir.path().join("serve-1/runtime");
        let stalled = dir.path().join("serve-2/runtime");
        install(
            &pipeline,
            "serve-1",
            Arc::new(LocalTransport::new(dir.path().join("serve-1/staging"), Duration::from_secs(60))),
            healthy.clone(),
            Arc::new(SlowService::default()),
        );
        let stalled_service = Arc::new(SlowService::default());
        install(
            &pipeline,
            "serve-2",
            Arc::new(StalledTransport),
            stalled.clone(),
            stalled_service.clone(),
        );

        let report = pipeline.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        let ok = report.targets.iter().find(|t| t.target == "serve-1").unwrap();
        assert!(ok.is_success());
        let timed_out = report.targets.iter().find(|t| t.target == "serve-2").unwrap();
        assert!(timed_out.error.as_deref().unwrap().contains("did not finish within 1s"));

        let alias = std::fs::read_link(healthy.join("sparc-data")).unwrap();
        assert_eq!(alias.to_string_lossy(), report.release.dir_name());
        assert!(std::fs::symlink_metadata(stalled.join("sparc-data")).is_err());
        assert!(stalled_service.calls.lock().unwrap().is_empty());
    }
}
