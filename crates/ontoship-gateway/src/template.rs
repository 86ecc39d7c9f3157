//! Query templates: declared routes with typed parameters.
//!
//! A template body is Cypher with `${name}` placeholders. Placeholders of a
//! value kind (`string`, `integer`, `float`, `boolean`) become bound Neo4j
//! parameters (`$name`); they are never spliced into the query text.
//! Structural kinds cover the parts of a pattern Cypher cannot
//! parameterize and are validated against a strict grammar before they are
//! rendered:
//!
//! - `relationship_types`: `part_of,has_part` renders as ``:`part_of`|`has_part` ``
//!   and renders as nothing when omitted (any relationship type).
//! - `depth`: an integer in `1..=max`, defaulting to `max`.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ParameterError, TemplateError};

/// Depth cap for `depth` parameters that do not declare one.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// Where a parameter is read from in the request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    #[default]
    Query,
    Path,
}

/// Type of a parameter value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
    RelationshipTypes,
    Depth,
}

impl ParamKind {
    /// Whether values of this kind are bound as query parameters.
    pub fn is_value(self) -> bool {
        matches!(
            self,
            Self::String | Self::Integer | Self::Float | Self::Boolean
        )
    }
}

/// One declared parameter of a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: ParamLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub kind: ParamKind,
    /// Value used when the caller omits an optional parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Upper bound for `depth` parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl ParamSpec {
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            location: ParamLocation::Query,
            required: false,
            kind,
            default: None,
            max: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn in_path(mut self) -> Self {
        self.location = ParamLocation::Path;
        self.required = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }

    pub fn with_max(mut self, max: u32) -> Self {
        self.max = Some(max);
        self
    }

    fn max_depth(&self) -> u32 {
        self.max.unwrap_or(DEFAULT_MAX_DEPTH)
    }

    /// Parse a caller-supplied (or default) value according to this parameter's kind.
    pub fn parse(&self, raw: &str) -> Result<Argument, ParameterError> {
        let invalid = |reason: String| ParameterError::Invalid {
            name: self.name.clone(),
            reason,
        };

        match self.kind {
            ParamKind::String => Ok(Argument::Value(ParamValue::String(raw.to_string()))),
            ParamKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(|v| Argument::Value(ParamValue::Integer(v)))
                .map_err(|_| invalid(format!("{raw:?} is not an integer"))),
            ParamKind::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| Argument::Value(ParamValue::Float(v)))
                .ok_or_else(|| invalid(format!("{raw:?} is not a number"))),
            ParamKind::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Argument::Value(ParamValue::Boolean(true))),
                "false" | "0" | "no" => Ok(Argument::Value(ParamValue::Boolean(false))),
                _ => Err(invalid(format!("{raw:?} is not a boolean"))),
            },
            ParamKind::RelationshipTypes => {
                let mut types = Vec::new();
                for part in raw.split(&[',', '|'][..]).map(str::trim).filter(|p| !p.is_empty()) {
                    if !identifier_re().is_match(part) {
                        return Err(invalid(format!("{part:?} is not a relationship type name")));
                    }
                    types.push(part.to_string());
                }
                Ok(Argument::RelationshipTypes(types))
            }
            ParamKind::Depth => {
                let max = self.max_depth();
                let depth = raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| invalid(format!("{raw:?} is not a positive integer")))?;
                if depth == 0 || depth > max {
                    return Err(invalid(format!("depth must be between 1 and {max}")));
                }
                Ok(Argument::Depth(depth))
            }
        }
    }

    /// The argument used when the caller omits this parameter.
    pub(crate) fn omitted(&self) -> Result<Argument, ParameterError> {
        if let Some(default) = &self.default {
            return self.parse(default);
        }
        Ok(match self.kind {
            ParamKind::RelationshipTypes => Argument::RelationshipTypes(Vec::new()),
            ParamKind::Depth => Argument::Depth(self.max_depth()),
            _ => Argument::Null,
        })
    }
}

/// A typed value bound as a Neo4j query parameter.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

/// A parsed parameter, ready for rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Value(ParamValue),
    /// Optional value parameter that was omitted and has no default.
    Null,
    RelationshipTypes(Vec<String>),
    Depth(u32),
}

/// A named, parameterized traversal exposed at `path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryTemplate {
    /// Route, e.g. `/dynamic/shortest` or `/dynamic/neighbors/{id}`.
    pub path: String,
    #[serde(default)]
    pub summary: String,
    pub query: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl QueryTemplate {
    pub fn new(path: &str, query: &str, parameters: Vec<ParamSpec>) -> Self {
        Self {
            path: path.to_string(),
            summary: String::new(),
            query: query.to_string(),
            parameters,
        }
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_string();
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Placeholder names referenced by the query body, in order of appearance.
    pub fn placeholders(&self) -> Vec<String> {
        placeholder_re()
            .captures_iter(&self.query)
            .map(|c| c["name"].to_string())
            .collect()
    }

    /// Check the template's internal consistency.
    pub fn validate(&self) -> Result<(), TemplateError> {
        let path = || self.path.clone();

        if !self.path.starts_with('/') {
            return Err(TemplateError::InvalidRoute(self.path.clone()));
        }

        let mut seen = HashSet::new();
        for spec in &self.parameters {
            if !seen.insert(spec.name.as_str()) {
                return Err(TemplateError::DuplicateParameter {
                    path: path(),
                    name: spec.name.clone(),
                });
            }
            if !identifier_re().is_match(&spec.name) {
                return Err(TemplateError::InvalidParameter {
                    path: path(),
                    name: spec.name.clone(),
                    reason: "name must be an identifier".to_string(),
                });
            }
            if spec.kind == ParamKind::Depth && spec.max == Some(0) {
                return Err(TemplateError::InvalidParameter {
                    path: path(),
                    name: spec.name.clone(),
                    reason: "max depth must be at least 1".to_string(),
                });
            }
            if spec.location == ParamLocation::Path && !spec.required {
                return Err(TemplateError::InvalidParameter {
                    path: path(),
                    name: spec.name.clone(),
                    reason: "path parameters are always required".to_string(),
                });
            }
            if let Some(default) = &spec.default {
                spec.parse(default)
                    .map_err(|e| TemplateError::InvalidParameter {
                        path: path(),
                        name: spec.name.clone(),
                        reason: format!("bad default: {e}"),
                    })?;
            }
        }

        for name in self.placeholders() {
            if self.parameter(&name).is_none() {
                return Err(TemplateError::UndeclaredPlaceholder { path: path(), name });
            }
        }

        let segments = route_params(&self.path);
        for spec in self
            .parameters
            .iter()
            .filter(|p| p.location == ParamLocation::Path)
        {
            if !segments.contains(&spec.name) {
                return Err(TemplateError::PathParameterNotInRoute {
                    path: path(),
                    name: spec.name.clone(),
                });
            }
        }
        for name in segments {
            let declared = self
                .parameter(&name)
                .is_some_and(|p| p.location == ParamLocation::Path);
            if !declared {
                return Err(TemplateError::UndeclaredRouteSegment { path: path(), name });
            }
        }

        Ok(())
    }

    /// Render the query body with parsed arguments.
    ///
    /// Value arguments become `$name` references (the caller binds the
    /// values); structural arguments are rendered from their validated form.
    pub(crate) fn render(&self, argument: impl Fn(&str) -> Option<Argument>) -> String {
        placeholder_re()
            .replace_all(&self.query, |caps: &regex::Captures<'_>| {
                let name = &caps["name"];
                let open = caps.name("open").map_or("", |m| m.as_str());
                let close = caps.name("close").map_or("", |m| m.as_str());
                let quoted = !open.is_empty() && open == close;

                let body = match argument(name) {
                    Some(Argument::Value(_)) => format!("${name}"),
                    Some(Argument::Null) | None => "null".to_string(),
                    Some(Argument::RelationshipTypes(types)) if types.is_empty() => String::new(),
                    Some(Argument::RelationshipTypes(types)) => {
                        let alternatives: Vec<String> =
                            types.iter().map(|t| format!("`{t}`")).collect();
                        format!(":{}", alternatives.join("|"))
                    }
                    Some(Argument::Depth(depth)) => depth.to_string(),
                };

                if quoted {
                    body
                } else {
                    format!("{open}{body}{close}")
                }
            })
            .into_owned()
    }
}

/// `{name}` segments of a route.
pub(crate) fn route_params(route: &str) -> Vec<String> {
    route
        .split('/')
        .filter_map(|seg| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
        .map(str::to_string)
        .collect()
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?P<open>['"]?)\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)\}(?P<close>['"]?)"#)
            .expect("placeholder pattern is valid")
    })
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"))
}

/// Built-in traversals registered when the configuration declares none.
pub fn builtin_templates() -> Vec<QueryTemplate> {
    vec![
        QueryTemplate::new(
            "/dynamic/shortestSimple",
            "MATCH (start {iri: ${start_id}}), (end {iri: ${end_id}}), \
             path = shortestPath((start)-[${relationship}*..${max_depth}]-(end)) \
             RETURN path",
            vec![
                ParamSpec::new("start_id", ParamKind::String)
                    .required()
                    .describe("IRI of the start node"),
                ParamSpec::new("end_id", ParamKind::String)
                    .required()
                    .describe("IRI of the end node"),
                ParamSpec::new("relationship", ParamKind::RelationshipTypes)
                    .describe("Relationship types to traverse (any when omitted)"),
                ParamSpec::new("max_depth", ParamKind::Depth)
                    .with_max(DEFAULT_MAX_DEPTH)
                    .describe("Maximum path length"),
            ],
        )
        .with_summary("Shortest path between two nodes"),
        QueryTemplate::new(
            "/dynamic/neighbors/{id}",
            "MATCH (n {iri: ${id}})-[r${relationship}]-(m) \
             RETURN n.iri AS source, type(r) AS relationship, m.iri AS target \
             LIMIT ${limit}",
            vec![
                ParamSpec::new("id", ParamKind::String)
                    .in_path()
                    .describe("IRI of the node"),
                ParamSpec::new("relationship", ParamKind::RelationshipTypes)
                    .describe("Relationship types to follow (any when omitted)"),
                ParamSpec::new("limit", ParamKind::Integer)
                    .with_default("100")
                    .describe("Maximum number of neighbors"),
            ],
        )
        .with_summary("Direct neighbors of a node"),
    ]
}
