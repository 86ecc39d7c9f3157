//! HTTP surface for the template registry.
//!
//! Every registered template is served at its route with `GET`; query-string
//! parameters map to the template's declared query parameters. Resolution
//! happens before any traversal runs, so a bad request never reaches Neo4j.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::client::QueryExecutor;
use crate::error::{GatewayError, ParameterError};
use crate::registry::TemplateRegistry;
use crate::template::QueryTemplate;

/// Shared handler state, cloneable across requests.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    registry: TemplateRegistry,
    executor: Arc<dyn QueryExecutor>,
    query_timeout: Duration,
}

impl AppState {
    pub fn new(
        registry: TemplateRegistry,
        executor: Arc<dyn QueryExecutor>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(AppInner {
                registry,
                executor,
                query_timeout,
            }),
        }
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/templates", get(list_templates))
        .fallback(dynamic_query)
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("query execution timed out")]
    Timeout,

    #[error("{0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::RouteNotFound(path) => Self::NotFound(format!("no template for {path}")),
            GatewayError::Parameter(p) => Self::BadRequest(p.to_string()),
            GatewayError::Graph(g) => Self::BadGateway(g.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    /// Error code (e.g. "bad_request", "not_found").
    pub error: String,
    pub detail: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone())),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            ApiError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None),
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout", None),
            ApiError::BadGateway(msg) => {
                tracing::warn!(%msg, "graph engine error");
                (StatusCode::BAD_GATEWAY, "graph_error", Some(msg.clone()))
            }
            ApiError::Internal(msg) => {
                tracing::error!(%msg, "internal gateway error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Some(msg.clone()))
            }
        };

        let body = ErrorBody {
            error: error.to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

// ── Handlers ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct QueryResponse {
    pub route: String,
    pub row_count: usize,
    pub rows: Vec<serde_json::Value>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_templates(State(state): State<AppState>) -> Json<Vec<QueryTemplate>> {
    Json(state.inner.registry.templates().cloned().collect())
}

async fn dynamic_query(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<QueryResponse>, ApiError> {
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed);
    }

    let resolved = match state.inner.registry.resolve(uri.path(), &params) {
        Ok(resolved) => resolved,
        Err(GatewayError::Parameter(e)) => {
            if let ParameterError::Missing(names) = &e {
                tracing::info!(path = %uri.path(), missing = ?names, "Rejected request");
            }
            return Err(ApiError::BadRequest(e.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let rows = tokio::time::timeout(
        state.inner.query_timeout,
        state.inner.executor.execute(&resolved),
    )
    .await
    .map_err(|_| ApiError::Timeout)?
    .map_err(|e| ApiError::from(GatewayError::Graph(e)))?;

    tracing::info!(route = %resolved.route, rows = rows.len(), "Template executed");

    Ok(Json(QueryResponse {
        route: resolved.route,
        row_count: rows.len(),
        rows,
    }))
}
