//! CLI entry point for the ontoship release pipeline.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use ontoship_core::config::{self as core_config, DEFAULT_CONFIG_PREFIX};
use ontoship_core::{Release, ReleaseTimestamp};
use ontoship_journal::JournalQuery;
use ontoship_release::package::archive_checksum;
use ontoship_release::{Pipeline, ReleaseConfig};

#[derive(Parser)]
#[command(name = "ontoship")]
#[command(about = "Package ontology graph snapshots and publish them to serving hosts")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: ontoship).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PREFIX, global = true)]
    config: String,

    #[command(flatten)]
    overrides: Overrides,
}

/// Command-line overrides for the `[release]` config section.
#[derive(Args)]
struct Overrides {
    /// Deployment name, also the name of the published alias.
    #[arg(long, global = true)]
    base_name: Option<String>,

    /// Snapshot root produced by the graph build.
    #[arg(long, global = true)]
    build_location: Option<PathBuf>,

    /// Runtime root on the targets.
    #[arg(long, global = true)]
    runtime_location: Option<PathBuf>,

    /// Staging directory on the targets.
    #[arg(long, global = true)]
    staging_location: Option<PathBuf>,

    /// Account owning the runtime root on remote hosts.
    #[arg(long, global = true)]
    service_user: Option<String>,

    /// systemd unit to stop and start around the swap.
    #[arg(long, global = true)]
    service_unit: Option<String>,

    /// Target host (repeatable); implies --remote.
    #[arg(long = "host", global = true)]
    hosts: Vec<String>,

    /// Deploy to remote hosts over ssh.
    #[arg(long, global = true, conflicts_with = "local")]
    remote: bool,

    /// Deploy on this machine.
    #[arg(long, global = true)]
    local: bool,
}

impl Overrides {
    fn apply(self, config: &mut ReleaseConfig) {
        if let Some(v) = self.base_name {
            config.base_name = v;
        }
        if let Some(v) = self.build_location {
            config.build_location = v;
        }
        if let Some(v) = self.runtime_location {
            config.runtime_location = v;
        }
        if let Some(v) = self.staging_location {
            config.staging_location = v;
        }
        if let Some(v) = self.service_user {
            config.service_user = Some(v);
        }
        if let Some(v) = self.service_unit {
            config.service_unit = Some(v);
        }
        if !self.hosts.is_empty() {
            config.hosts = self.hosts;
            config.remote = true;
        }
        if self.remote {
            config.remote = true;
        }
        if self.local {
            config.remote = false;
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Package the snapshot into a new timestamped release archive.
    Build,
    /// Package (or take an existing archive) and publish it on every target.
    Deploy {
        /// Deploy this archive instead of packaging the snapshot.
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Config,
    /// List unpacked releases on a target.
    Releases,
    /// Republish an older release on a target.
    Rollback {
        /// Timestamp of the release to publish (default: the one before the current).
        #[arg(long)]
        to: Option<ReleaseTimestamp>,
    },
    /// Show recorded cutover attempts.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let cfg = core_config::load(&cli.config)?;
    let mut config: ReleaseConfig = core_config::section(&cfg, "release")?;
    cli.overrides.apply(&mut config);

    match cli.command {
        Command::Build => {
            let pipeline = Pipeline::new(config);
            let packaged = pipeline.build().await?;
            println!("{}", packaged.archive.display());
        }
        Command::Deploy { archive } => {
            let pipeline = Pipeline::new(config);
            let cancel = cancel_on_ctrl_c();
            let report = match archive {
                Some(path) => {
                    let release = archive_release(&path)?;
                    pipeline.deploy(&path, &release, &cancel).await?
                }
                None => pipeline.run(&cancel).await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed() > 0 {
                anyhow::bail!(
                    "{} of {} targets failed",
                    report.failed(),
                    report.targets.len()
                );
            }
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Releases => {
            let base = config.base_name()?;
            let target = config.target(None)?;
            let pipeline = Pipeline::new(config);
            let entries = pipeline.controller(&target).releases(&base).await?;
            for entry in entries {
                let marker = if entry.published { "*" } else { " " };
                println!("{marker} {}", entry.release);
            }
        }
        Command::Rollback { to } => {
            let base = config.base_name()?;
            let target = config.target(None)?;
            let pipeline = Pipeline::new(config);
            let report = pipeline.controller(&target).rollback(&base, to).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::History { limit } => {
            let Some(dir) = config.journal_dir() else {
                anyhow::bail!("Journal disabled: set release.journal_dir");
            };
            let query = JournalQuery {
                base_name: (!config.base_name.is_empty()).then(|| config.base_name.clone()),
                limit: Some(limit),
                ..Default::default()
            };
            let records = ontoship_release::journal::history(std::path::Path::new(dir), &query)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

/// Parse the release identity from an archive path and checksum its bytes.
fn archive_release(path: &std::path::Path) -> anyhow::Result<Release> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?;
    let release = Release::from_archive_name(name)?;
    Ok(release.with_checksum(archive_checksum(path)?))
}

/// Token cancelled on the first Ctrl-C; cutovers already swapping finish regardless.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling cutovers that have not started swapping");
            child.cancel();
        }
    });
    token
}
