//! Template registry: route lookup and parameter binding.

use std::collections::{BTreeMap, HashMap};

use neo4rs::Query;
use serde::Serialize;

use crate::error::{GatewayError, ParameterError, Result, TemplateError};
use crate::template::{route_params, Argument, ParamLocation, ParamValue, QueryTemplate};

/// A template bound to one request's parameters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedQuery {
    /// Route of the template that produced this query.
    pub route: String,
    /// Cypher text; caller values appear only as `$name` references.
    pub cypher: String,
    /// Values bound to the `$name` references.
    pub params: BTreeMap<String, ParamValue>,
}

impl ResolvedQuery {
    /// Build the neo4rs query with every value bound as a typed parameter.
    pub fn to_query(&self) -> Query {
        self.params
            .iter()
            .fold(neo4rs::query(&self.cypher), |q, (name, value)| match value {
                ParamValue::String(s) => q.param(name, s.clone()),
                ParamValue::Integer(i) => q.param(name, *i),
                ParamValue::Float(f) => q.param(name, *f),
                ParamValue::Boolean(b) => q.param(name, *b),
            })
    }
}

struct Route {
    segments: Vec<Segment>,
    template: QueryTemplate,
}

enum Segment {
    Literal(String),
    Param(String),
}

impl Route {
    fn new(template: QueryTemplate) -> Self {
        let segments = split_path(&template.path)
            .map(|seg| {
                match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Literal(seg.to_string()),
                }
            })
            .collect();
        Self { segments, template }
    }

    /// Path parameters captured from `path`, or `None` if the route does not match.
    fn capture(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split_path(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captured = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    captured.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(captured)
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Holds the registered templates and binds requests to them.
#[derive(Default)]
pub struct TemplateRegistry {
    routes: Vec<Route>,
    strict: bool,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject requests that carry undeclared query parameters instead of ignoring them.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Build a registry from a list of templates, failing on the first bad one.
    pub fn from_templates(templates: Vec<QueryTemplate>) -> std::result::Result<Self, TemplateError> {
        let mut registry = Self::new();
        for template in templates {
            registry.register(template)?;
        }
        Ok(registry)
    }

    /// Add a template after checking its placeholders and route.
    pub fn register(&mut self, template: QueryTemplate) -> std::result::Result<(), TemplateError> {
        template.validate()?;

        let shape = route_shape(&template.path);
        if self.routes.iter().any(|r| route_shape(&r.template.path) == shape) {
            return Err(TemplateError::DuplicateRoute(template.path));
        }

        tracing::debug!(path = %template.path, params = template.parameters.len(), "Template registered");
        self.routes.push(Route::new(template));
        Ok(())
    }

    pub fn templates(&self) -> impl Iterator<Item = &QueryTemplate> {
        self.routes.iter().map(|r| &r.template)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the template for a request path. Routes with more literal
    /// segments win over routes that capture the same position.
    fn lookup(&self, path: &str) -> Option<(&QueryTemplate, HashMap<String, String>)> {
        self.routes
            .iter()
            .filter_map(|route| route.capture(path).map(|c| (route, c)))
            .max_by_key(|(route, _)| route.literal_count())
            .map(|(route, captured)| (&route.template, captured))
    }

    /// Bind the request's parameters to the template at `path`.
    ///
    /// Fails with `RouteNotFound` for unknown routes and with a
    /// `ParameterError` when required parameters are missing or a value
    /// does not parse; no query is produced in either case.
    pub fn resolve(&self, path: &str, supplied: &HashMap<String, String>) -> Result<ResolvedQuery> {
        let (template, captured) = self
            .lookup(path)
            .ok_or_else(|| GatewayError::RouteNotFound(path.to_string()))?;

        let unknown = unknown_params(template, supplied);
        if !unknown.is_empty() {
            if self.strict {
                return Err(ParameterError::Unknown(unknown).into());
            }
            tracing::debug!(route = %template.path, ?unknown, "Ignoring undeclared parameters");
        }

        let missing: Vec<String> = template
            .parameters
            .iter()
            .filter(|spec| spec.required)
            .filter(|spec| match spec.location {
                ParamLocation::Path => !captured.contains_key(&spec.name),
                ParamLocation::Query => !supplied.contains_key(&spec.name),
            })
            .map(|spec| spec.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ParameterError::Missing(missing).into());
        }

        let mut arguments = HashMap::with_capacity(template.parameters.len());
        let mut params = BTreeMap::new();
        for spec in &template.parameters {
            let raw = match spec.location {
                ParamLocation::Path => captured.get(&spec.name),
                ParamLocation::Query => supplied.get(&spec.name),
            };
            let argument = match raw {
                Some(raw) => spec.parse(raw)?,
                None => spec.omitted()?,
            };
            if let Argument::Value(value) = &argument {
                if spec.kind.is_value() {
                    params.insert(spec.name.clone(), value.clone());
                }
            }
            arguments.insert(spec.name.as_str(), argument);
        }

        let cypher = template.render(|name| arguments.get(name).cloned());
        tracing::debug!(route = %template.path, %cypher, "Resolved template");

        Ok(ResolvedQuery {
            route: template.path.clone(),
            cypher,
            params,
        })
    }
}

/// Route with parameter names erased, for duplicate detection.
fn route_shape(path: &str) -> String {
    let params = route_params(path);
    split_path(path)
        .map(|seg| {
            if params.iter().any(|p| seg == format!("{{{p}}}")) {
                "{}"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn unknown_params(template: &QueryTemplate, supplied: &HashMap<String, String>) -> Vec<String> {
    let mut unknown: Vec<String> = supplied
        .keys()
        .filter(|name| {
            !template
                .parameters
                .iter()
                .any(|p| &p.name == *name && p.location == ParamLocation::Query)
        })
        .cloned()
        .collect();
    unknown.sort();
    unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{builtin_templates, ParamKind, ParamSpec};

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn registry() -> TemplateRegistry {
        TemplateRegistry::from_templates(builtin_templates()).unwrap()
    }

    #[test]
    fn test_resolve_shortest_path() {
        let resolved = registry()
            .resolve(
                "/dynamic/shortestSimple",
                &params(&[
                    ("start_id", "UBERON:0000955"),
                    ("end_id", "UBERON:0001062"),
                    ("relationship", "subClassOf,part_of"),
                    ("max_depth", "4"),
                ]),
            )
            .unwrap();

        assert_eq!(
            resolved.cypher,
            "MATCH (start {iri: $start_id}), (end {iri: $end_id}), \
             path = shortestPath((start)-[:`subClassOf`|`part_of`*..4]-(end)) \
             RETURN path"
        );
        assert_eq!(
            resolved.params.get("start_id"),
            Some(&ParamValue::String("UBERON:0000955".to_string()))
        );
        assert_eq!(resolved.params.len(), 2);
    }

    #[test]
    fn test_omitted_relationship_means_any_type() {
        let resolved = registry()
            .resolve(
                "/dynamic/shortestSimple",
                &params(&[("start_id", "a"), ("end_id", "b")]),
            )
            .unwrap();
        assert!(resolved.cypher.contains("(start)-[*..10]-(end)"));
    }

    #[test]
    fn test_missing_required_names_exactly_the_missing() {
        let err = registry()
            .resolve("/dynamic/shortestSimple", &params(&[("start_id", "a")]))
            .unwrap_err();
        match err {
            GatewayError::Parameter(ParameterError::Missing(names)) => {
                assert_eq!(names, vec!["end_id".to_string()]);
            }
            other => panic!("expected Missing, got {other:?}"),
        }

        let err = registry()
            .resolve("/dynamic/shortestSimple", &HashMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Parameter(ParameterError::Missing(ref names))
                if names == &vec!["start_id".to_string(), "end_id".to_string()]
        ));
    }

    #[test]
    fn test_metacharacters_are_bound_as_data() {
        let hostile = "x'}) MATCH (n) DETACH DELETE n //";
        let resolved = registry()
            .resolve(
                "/dynamic/shortestSimple",
                &params(&[("start_id", hostile), ("end_id", "b")]),
            )
            .unwrap();

        assert!(!resolved.cypher.contains("DETACH"));
        assert!(resolved.cypher.contains("$start_id"));
        assert_eq!(
            resolved.params.get("start_id"),
            Some(&ParamValue::String(hostile.to_string()))
        );
    }

    #[test]
    fn test_structural_injection_rejected() {
        let err = registry()
            .resolve(
                "/dynamic/shortestSimple",
                &params(&[
                    ("start_id", "a"),
                    ("end_id", "b"),
                    ("relationship", "part_of*]-() DETACH DELETE n //"),
                ]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Parameter(ParameterError::Invalid { ref name, .. }) if name == "relationship"
        ));
    }

    #[test]
    fn test_unknown_params_ignored_unless_strict() {
        let supplied = params(&[("start_id", "a"), ("end_id", "b"), ("verbose", "1")]);
        assert!(registry().resolve("/dynamic/shortestSimple", &supplied).is_ok());

        let strict = TemplateRegistry::from_templates(builtin_templates())
            .unwrap()
            .strict(true);
        let err = strict.resolve("/dynamic/shortestSimple", &supplied).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Parameter(ParameterError::Unknown(ref names)) if names == &vec!["verbose".to_string()]
        ));
    }

    #[test]
    fn test_path_parameters_and_defaults() {
        let resolved = registry()
            .resolve("/dynamic/neighbors/UBERON:0000955", &HashMap::new())
            .unwrap();
        assert_eq!(
            resolved.params.get("id"),
            Some(&ParamValue::String("UBERON:0000955".to_string()))
        );
        assert_eq!(resolved.params.get("limit"), Some(&ParamValue::Integer(100)));
        assert!(resolved.cypher.contains("-[r]-"));
    }

    #[test]
    fn test_unknown_route() {
        let err = registry().resolve("/dynamic/nope", &HashMap::new()).unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound(_)));
        let err = registry()
            .resolve("/dynamic/neighbors/a/b", &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound(_)));
    }

    #[test]
    fn test_literal_route_preferred_over_capture() {
        let mut registry = TemplateRegistry::new();
        registry
            .register(QueryTemplate::new(
                "/node/{id}",
                "MATCH (n {iri: ${id}}) RETURN n",
                vec![ParamSpec::new("id", ParamKind::String).in_path()],
            ))
            .unwrap();
        registry
            .register(QueryTemplate::new("/node/count", "MATCH (n) RETURN count(n)", vec![]))
            .unwrap();

        let resolved = registry.resolve("/node/count", &HashMap::new()).unwrap();
        assert_eq!(resolved.route, "/node/count");
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut registry = registry();
        let dup = QueryTemplate::new(
            "/dynamic/neighbors/{iri}",
            "MATCH (n {iri: ${iri}}) RETURN n",
            vec![ParamSpec::new("iri", ParamKind::String).in_path()],
        );
        assert!(matches!(registry.register(dup), Err(TemplateError::DuplicateRoute(_))));
    }

    #[test]
    fn test_optional_value_without_default_renders_null() {
        let mut registry = TemplateRegistry::new();
        registry
            .register(QueryTemplate::new(
                "/label",
                "MATCH (n) WHERE ${label} IS NULL OR n.label = ${label} RETURN n",
                vec![ParamSpec::new("label", ParamKind::String)],
            ))
            .unwrap();
        let resolved = registry.resolve("/label", &HashMap::new()).unwrap();
        assert_eq!(
            resolved.cypher,
            "MATCH (n) WHERE null IS NULL OR n.label = null RETURN n"
        );
        assert!(resolved.params.is_empty());
    }
}
