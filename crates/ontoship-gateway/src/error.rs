//! Error types for the query gateway.

use thiserror::Error;

use crate::client::GraphError;

/// A caller-supplied parameter set that cannot be bound to a template.
///
/// Always recovered at the request boundary: one rejected request, nothing else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Missing required parameter(s): {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Unknown parameter(s): {}", .0.join(", "))]
    Unknown(Vec<String>),

    #[error("Invalid value for parameter {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// A template that cannot be registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template {path}: placeholder ${{{name}}} is not a declared parameter")]
    UndeclaredPlaceholder { path: String, name: String },

    #[error("Template {path}: path parameter {name} does not appear in the route")]
    PathParameterNotInRoute { path: String, name: String },

    #[error("Template {path}: route segment {{{name}}} is not a declared path parameter")]
    UndeclaredRouteSegment { path: String, name: String },

    #[error("Template {path}: parameter {name} is declared twice")]
    DuplicateParameter { path: String, name: String },

    #[error("Template {path}: invalid parameter {name}: {reason}")]
    InvalidParameter {
        path: String,
        name: String,
        reason: String,
    },

    #[error("Route already registered: {0}")]
    DuplicateRoute(String),

    #[error("Invalid route {0:?}: must start with '/'")]
    InvalidRoute(String),
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No template registered for route {0}")]
    RouteNotFound(String),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
