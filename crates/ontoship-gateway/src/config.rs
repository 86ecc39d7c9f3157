//! Configuration for the query gateway.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{GatewayError, Result};
use crate::registry::TemplateRegistry;
use crate::template::{builtin_templates, QueryTemplate};

/// Loaded from the `[gateway]` section or `ONTOSHIP_GATEWAY__` environment variables.
///
/// ```toml
/// [gateway]
/// bind = "0.0.0.0:9000"
///
/// [[gateway.templates]]
/// path = "/dynamic/subclasses/{id}"
/// query = "MATCH (c {iri: ${id}})<-[:subClassOf*1..${depth}]-(s) RETURN s.iri AS iri"
/// parameters = [
///   { name = "id", location = "path", required = true },
///   { name = "depth", kind = "depth", max = 5 },
/// ]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Socket address the HTTP server listens on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Reject requests carrying undeclared parameters.
    #[serde(default)]
    pub strict: bool,

    /// Upper bound on a single traversal.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Declared templates; the built-in set is used when empty.
    #[serde(default)]
    pub templates: Vec<QueryTemplate>,
}

fn default_bind() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_query_timeout() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            strict: false,
            query_timeout_secs: default_query_timeout(),
            templates: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Build the registry for this configuration.
    pub fn registry(&self) -> Result<TemplateRegistry> {
        let templates = if self.templates.is_empty() {
            tracing::info!("No templates configured, registering built-in traversals");
            builtin_templates()
        } else {
            self.templates.clone()
        };

        let registry = TemplateRegistry::from_templates(templates)?.strict(self.strict);
        if registry.is_empty() {
            return Err(GatewayError::Config("no templates registered".to_string()));
        }
        Ok(registry)
    }
}
