//! ontoship-release: Package graph snapshots and publish them atomically.
//!
//! A snapshot directory is archived once per release as
//! `<base_name>-graph-<timestamp>.zip`, shipped to each target host and
//! unpacked next to the releases already there. The published alias, a
//! symlink named after the base name, is then repointed in a single rename
//! while the consuming service is stopped. Readers of the alias see either
//! the old complete release or the new one, never a partial tree.

pub mod command;
pub mod config;
pub mod cutover;
pub mod error;
pub mod host;
pub mod journal;
pub mod package;
pub mod pipeline;
pub mod service;
pub mod transport;

pub use config::ReleaseConfig;
pub use cutover::{CutoverController, CutoverReport, CutoverState, CutoverTimeouts, ReleaseEntry};
pub use error::{CutoverError, PackagingError, ReleaseError, ServiceError, TransportError};
pub use host::{LocalHost, ReleaseHost, RemoteHost};
pub use package::{PackagedRelease, Packager};
pub use pipeline::{Pipeline, PipelineReport, TargetOutcome};
pub use service::{NoService, ServiceControl, SystemdService};
pub use transport::{LocalTransport, RemoteTransport, Transport};
