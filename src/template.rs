//! `${...}` placeholder substitution.
//!
//! Two namespaces are visible to a template: `metadata.<key>` reads the
//! workload metadata and `resources.<name>[.<path>]` reads a resource's
//! outputs. `$$` collapses to a literal `$`; anything that does not look like
//! a placeholder (including `${}`) is left alone.
use crate::error::ValidationError;
use crate::graph::{walk, WorkloadOutputs};
use crate::secrets::{Resolved, SecretWatch};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Everything a template of one workload can reference.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub metadata: &'a Map<String, Value>,
    pub resources: &'a WorkloadOutputs<'a>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\$(\$|\{([a-zA-Z0-9.\-_\[\]"'#]+)\})"#).expect("regex for placeholders")
    })
}

/// Replace every placeholder in `template`.
///
/// Every unresolved reference is reported, not just the first.
pub fn substitute(template: &str, ctx: &TemplateContext<'_>) -> Result<String, ValidationError> {
    substitute_tracked(template, ctx).map(|resolved| resolved.value)
}

/// Like [`substitute`], also reporting whether any value came from a secret.
pub fn substitute_tracked(
    template: &str,
    ctx: &TemplateContext<'_>,
) -> Result<Resolved, ValidationError> {
    let mut watch = SecretWatch::default();
    let mut problems = Vec::new();
    let output = placeholder_regex().replace_all(template, |caps: &Captures<'_>| {
        let Some(path) = caps.get(2) else {
            return "$".to_string();
        };
        match resolve(path.as_str(), ctx, &mut watch) {
            Ok(value) => value,
            Err(problem) => {
                problems.push(problem);
                String::new()
            }
        }
    });
    if !problems.is_empty() {
        return Err(ValidationError { problems });
    }
    Ok(watch.finish(output.into_owned()))
}

fn resolve(path: &str, ctx: &TemplateContext<'_>, watch: &mut SecretWatch) -> Result<String, String> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(format!("malformed expression reference '{path}'"));
    }
    match segments.as_slice() {
        ["metadata", key, rest @ ..] => {
            let value = ctx
                .metadata
                .get(*key)
                .and_then(|value| walk(value, rest))
                .ok_or_else(|| format!("expression '{path}' refers to missing metadata key"))?;
            Ok(render(value))
        }
        ["resources", name, rest @ ..] => {
            let outputs = ctx
                .resources
                .get(*name)
                .ok_or_else(|| format!("undefined resource '{name}'"))?;
            let lookup = outputs
                .lookup(rest)
                .map_err(|problem| format!("resource '{name}': {problem}"))?;
            watch.observe(lookup.channel);
            Ok(render(&lookup.value))
        }
        _ => Err(format!("unsupported expression reference '{path}'")),
    }
}

/// Strings are inserted as-is; everything else as compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Resolve every string inside a params object, keeping its shape.
pub fn substitute_params(
    params: &Map<String, Value>,
    ctx: &TemplateContext<'_>,
) -> Result<Map<String, Value>, ValidationError> {
    let mut problems = Vec::new();
    let mut out = Map::new();
    for (key, value) in params {
        match substitute_value(value, ctx) {
            Ok(value) => {
                out.insert(key.clone(), value);
            }
            Err(err) => problems.extend(err.within(key).problems),
        }
    }
    if problems.is_empty() {
        Ok(out)
    } else {
        Err(ValidationError { problems })
    }
}

fn substitute_value(value: &Value, ctx: &TemplateContext<'_>) -> Result<Value, ValidationError> {
    match value {
        Value::String(text) => substitute(text, ctx).map(Value::String),
        Value::Object(map) => substitute_params(map, ctx).map(Value::Object),
        Value::Array(items) => {
            let mut problems = Vec::new();
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                match substitute_value(item, ctx) {
                    Ok(item) => out.push(item),
                    Err(err) => problems.extend(err.within(&index.to_string()).problems),
                }
            }
            if problems.is_empty() {
                Ok(Value::Array(out))
            } else {
                Err(ValidationError { problems })
            }
        }
        other => Ok(other.clone()),
    }
}

/// Resource names referenced by `${resources.<name>...}` placeholders.
pub fn referenced_resources(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| {
            let path = caps.get(2)?.as_str();
            let mut segments = path.split('.');
            match (segments.next(), segments.next()) {
                (Some("resources"), Some(name)) if !name.is_empty() => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceOutputs;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn metadata_and_escapes() {
        let metadata = object(json!({"name": "x", "replicas": 3, "labels": {"tier": "web"}}));
        let resources = WorkloadOutputs::new();
        let ctx = TemplateContext {
            metadata: &metadata,
            resources: &resources,
        };
        assert_eq!(substitute("a-${metadata.name}-b", &ctx).unwrap(), "a-x-b");
        assert_eq!(substitute("$$", &ctx).unwrap(), "$");
        assert_eq!(substitute("$${metadata.name}", &ctx).unwrap(), "${metadata.name}");
        assert_eq!(substitute("keep ${} as is", &ctx).unwrap(), "keep ${} as is");
        assert_eq!(substitute("n=${metadata.replicas}", &ctx).unwrap(), "n=3");
        assert_eq!(
            substitute("${metadata.labels}", &ctx).unwrap(),
            r#"{"tier":"web"}"#
        );
        assert_eq!(substitute("${metadata.labels.tier}", &ctx).unwrap(), "web");
    }

    #[test]
    fn unknown_references_are_all_reported() {
        let metadata = Map::new();
        let resources = WorkloadOutputs::new();
        let ctx = TemplateContext {
            metadata: &metadata,
            resources: &resources,
        };
        let err = substitute("${foo.bar}", &ctx).unwrap_err();
        assert!(err.to_string().contains("foo.bar"), "{err}");

        let err = substitute("${foo.bar} ${metadata.missing} ${resources.db.host}", &ctx)
            .unwrap_err();
        assert_eq!(err.problems.len(), 3, "{err}");
        assert!(err.problems[1].contains("missing metadata key"));
        assert!(err.problems[2].contains("undefined resource 'db'"));

        let err = substitute("${metadata..name}", &ctx).unwrap_err();
        assert!(err.to_string().contains("malformed"), "{err}");
    }

    #[test]
    fn resource_outputs_and_default_key() {
        let metadata = Map::new();
        let values = object(json!({"host": "db.internal", "port": 5432, "default": "pg://x"}));
        let secrets = Map::new();
        let mut resources = WorkloadOutputs::new();
        resources.insert(
            "db".to_string(),
            ResourceOutputs {
                values: &values,
                secrets: &secrets,
            },
        );
        let ctx = TemplateContext {
            metadata: &metadata,
            resources: &resources,
        };
        assert_eq!(
            substitute("${resources.db.host}:${resources.db.port}", &ctx).unwrap(),
            "db.internal:5432"
        );
        assert_eq!(substitute("${resources.db}", &ctx).unwrap(), "pg://x");
        let err = substitute("${resources.db.user}", &ctx).unwrap_err();
        assert!(err.to_string().contains("output 'user' is not set"), "{err}");
    }

    #[test]
    fn secret_signal_is_scoped_to_one_call() {
        let metadata = Map::new();
        let db_values = object(json!({"host": "db.internal", "password": "shadowed"}));
        let db_secrets = object(json!({"password": "hunter2"}));
        let cache_values = object(json!({"host": "cache.internal"}));
        let empty = Map::new();
        let mut resources = WorkloadOutputs::new();
        resources.insert(
            "db".to_string(),
            ResourceOutputs {
                values: &db_values,
                secrets: &db_secrets,
            },
        );
        resources.insert(
            "cache".to_string(),
            ResourceOutputs {
                values: &cache_values,
                secrets: &empty,
            },
        );
        let ctx = TemplateContext {
            metadata: &metadata,
            resources: &resources,
        };

        let secret = substitute_tracked("${resources.db.password}", &ctx).unwrap();
        assert_eq!(secret.value, "hunter2");
        assert!(secret.secret_touched);

        let plain = substitute_tracked("${resources.cache.host}", &ctx).unwrap();
        assert!(!plain.secret_touched);
        let plain = substitute_tracked("${resources.db.host}", &ctx).unwrap();
        assert!(!plain.secret_touched);

        std::thread::scope(|scope| {
            let a = scope.spawn(|| substitute_tracked("${resources.db.password}", &ctx));
            let b = scope.spawn(|| substitute_tracked("${resources.cache.host}", &ctx));
            assert!(a.join().unwrap().unwrap().secret_touched);
            assert!(!b.join().unwrap().unwrap().secret_touched);
        });
    }

    #[test]
    fn params_are_resolved_recursively() {
        let metadata = object(json!({"name": "web"}));
        let resources = WorkloadOutputs::new();
        let ctx = TemplateContext {
            metadata: &metadata,
            resources: &resources,
        };
        let params = object(json!({
            "name": "${metadata.name}-db",
            "size": 10,
            "tags": ["${metadata.name}", "static"],
            "nested": {"bad": "${metadata.nope}"}
        }));
        let err = substitute_params(&params, &ctx).unwrap_err();
        assert_eq!(err.problems.len(), 1);
        assert!(err.problems[0].starts_with("nested: bad: "), "{err}");

        let params = object(json!({"name": "${metadata.name}-db", "tags": ["${metadata.name}"]}));
        let resolved = substitute_params(&params, &ctx).unwrap();
        assert_eq!(Value::Object(resolved), json!({"name": "web-db", "tags": ["web"]}));
    }

    #[test]
    fn collects_resource_references() {
        assert_eq!(
            referenced_resources("${resources.db.host} ${metadata.name} $${resources.x} ${resources.cache}"),
            vec!["db".to_string(), "cache".to_string()]
        );
    }
}
