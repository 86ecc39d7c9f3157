//! ontoship-gateway: Parameterized graph traversals over HTTP.
//!
//! Operators declare query templates (a route, a Cypher body with `${name}`
//! placeholders, and typed parameters). Requests are resolved against the
//! registry before anything touches Neo4j: missing parameters are rejected,
//! values are bound as query parameters, and structural parts such as
//! relationship types and depth bounds are validated before rendering.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod template;

pub use client::{GraphClient, GraphConfig, GraphError, QueryExecutor};
pub use error::{GatewayError, ParameterError, TemplateError};
pub use registry::{ResolvedQuery, TemplateRegistry};
pub use template::{ParamKind, ParamLocation, ParamSpec, QueryTemplate};
