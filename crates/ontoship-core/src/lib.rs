//! ontoship-core: Shared types, configuration, and error handling for ontoship.
//!
//! This crate provides the foundational types used by the release pipeline
//! and the query gateway:
//! - Release identity (`BaseName`, `ReleaseTimestamp`, `Release`)
//! - Deployment targets (`Target`)
//! - Layered configuration loading
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use error::OntoshipError;
pub use types::{BaseName, Release, ReleaseTimestamp, Target};
