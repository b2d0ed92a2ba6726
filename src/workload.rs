//! Score workload loading.
//!
//! Only the subset of the Score schema the engine and the Fly conversion need
//! is modelled. Unknown fields are rejected so typos surface early instead of
//! being silently dropped.
use crate::patch::merge_patch;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SCORE_API_VERSION: &str = "score.dev/v1b1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Workload {
    pub api_version: String,
    pub metadata: Map<String, Value>,
    pub containers: BTreeMap<String, Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Container {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ContainerFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerFile {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_expand: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Service {
    #[serde(default)]
    pub ports: BTreeMap<String, ServicePort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServicePort {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A resource dependency as declared inside a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub res_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Setting an id marks the resource as shared across workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Workload {
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(Value::as_str)
    }
}

/// Edits applied to a raw workload document before it is decoded.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// YAML document merged into the workload as a JSON merge patch.
    pub file: Option<PathBuf>,
    /// `path=value` entries; an empty value removes the path.
    pub properties: Vec<String>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.properties.is_empty()
    }
}

/// Read a Score workload file, apply `overrides`, then validate it.
pub fn load_workload_with(path: &Path, overrides: &Overrides) -> Result<Workload> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read workload {}", path.display()))?;
    let mut raw: Value = serde_yaml::from_str(&text)
        .with_context(|| format!("decode workload YAML {}", path.display()))?;
    apply_overrides(&mut raw, overrides)?;
    workload_from_value(raw).with_context(|| format!("invalid workload {}", path.display()))
}

pub fn parse_workload(text: &str) -> Result<Workload> {
    let raw: Value = serde_yaml::from_str(text).context("decode workload YAML")?;
    workload_from_value(raw)
}

fn workload_from_value(raw: Value) -> Result<Workload> {
    let workload: Workload = serde_json::from_value(raw).context("decode workload")?;
    validate_workload(&workload)?;
    Ok(workload)
}

pub fn apply_overrides(raw: &mut Value, overrides: &Overrides) -> Result<()> {
    if let Some(path) = &overrides.file {
        let text = fs::read_to_string(path)
            .with_context(|| format!("--overrides-file '{}': read", path.display()))?;
        let patch: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("--overrides-file '{}': decode YAML", path.display()))?;
        if !patch.is_object() {
            return Err(anyhow!(
                "--overrides-file '{}' must contain a mapping",
                path.display()
            ));
        }
        tracing::info!(file = %path.display(), "applying overrides file to workload");
        merge_patch(raw, &patch);
    }
    for entry in &overrides.properties {
        apply_override_property(raw, entry)
            .with_context(|| format!("--override-property '{entry}'"))?;
    }
    Ok(())
}

/// Set or remove one dotted path, e.g. `containers.main.image=nginx`.
///
/// The value is parsed as YAML, so `port=8080` sets a number. Missing
/// intermediate objects are created; numeric segments index arrays.
pub fn apply_override_property(raw: &mut Value, entry: &str) -> Result<()> {
    let (path, value) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("expected a =-separated path and value"))?;
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(anyhow!("path '{path}' has an empty segment"));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(anyhow!("path must not be empty"));
    };

    let mut current = raw;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let index = array_index(segment, items.len())?;
                &mut items[index]
            }
            _ => return Err(anyhow!("cannot descend into '{segment}' of a scalar value")),
        };
    }

    tracing::info!(path, "overriding workload property");
    if value.is_empty() {
        match current {
            Value::Object(map) => {
                map.remove(*last);
            }
            Value::Array(items) => {
                let index = array_index(last, items.len())?;
                items.remove(index);
            }
            _ => return Err(anyhow!("cannot remove '{last}' from a scalar value")),
        }
        return Ok(());
    }

    let value: Value = serde_yaml::from_str(value).context("decode value as YAML")?;
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Array(items) => {
            let index = array_index(last, items.len())?;
            items[index] = value;
        }
        _ => return Err(anyhow!("cannot set '{last}' on a scalar value")),
    }
    Ok(())
}

fn array_index(segment: &str, len: usize) -> Result<usize> {
    let index: usize = segment
        .parse()
        .map_err(|_| anyhow!("'{segment}' is not an array index"))?;
    if index >= len {
        return Err(anyhow!("index {index} is out of range (length {len})"));
    }
    Ok(index)
}

pub fn validate_workload(workload: &Workload) -> Result<()> {
    if workload.api_version != SCORE_API_VERSION {
        return Err(anyhow!(
            "unsupported apiVersion {:?} (expected {SCORE_API_VERSION:?})",
            workload.api_version
        ));
    }
    let name = workload
        .name()
        .ok_or_else(|| anyhow!("metadata.name must be a string"))?;
    if name.trim().is_empty() {
        return Err(anyhow!("metadata.name must be non-empty"));
    }
    if workload.containers.is_empty() {
        return Err(anyhow!("at least one container is required"));
    }
    for (res_name, decl) in &workload.resources {
        if decl.res_type.trim().is_empty() {
            return Err(anyhow!("resources.{res_name}: type must be non-empty"));
        }
        if res_name.contains('.') {
            return Err(anyhow!("resources.{res_name}: name must not contain '.'"));
        }
    }
    Ok(())
}

/// Replace the `.` placeholder image with a concrete one.
pub fn apply_image_override(workload: &mut Workload, image: Option<&str>) -> Result<()> {
    for (container_name, container) in workload.containers.iter_mut() {
        if container.image != "." {
            continue;
        }
        let Some(image) = image else {
            return Err(anyhow!(
                "container '{container_name}' has no image and --image was not provided"
            ));
        };
        tracing::info!(container = %container_name, image, "set container image from --image");
        container.image = image.to_string();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: web
containers:
  main:
    image: nginx
    variables:
      DB_HOST: ${resources.db.host}
resources:
  db:
    type: postgres
    params:
      size: small
"#;

    #[test]
    fn parses_sample_workload() {
        let workload = parse_workload(SAMPLE).expect("parse");
        assert_eq!(workload.name(), Some("web"));
        let db = &workload.resources["db"];
        assert_eq!(db.res_type, "postgres");
        assert_eq!(db.class, None);
        assert_eq!(
            db.params.as_ref().and_then(|p| p.get("size")),
            Some(&Value::String("small".to_string()))
        );
    }

    #[test]
    fn rejects_wrong_api_version_and_missing_name() {
        let bad_version = SAMPLE.replace("score.dev/v1b1", "score.dev/v2");
        assert!(parse_workload(&bad_version).is_err());

        let no_name = SAMPLE.replace("  name: web\n", "  other: web\n");
        let err = parse_workload(&no_name).unwrap_err();
        assert!(format!("{err:#}").contains("metadata.name"));
    }

    #[test]
    fn image_override_requires_flag_for_dot_images() {
        let mut workload = parse_workload(&SAMPLE.replace("image: nginx", "image: .")).unwrap();
        assert!(apply_image_override(&mut workload, None).is_err());
        apply_image_override(&mut workload, Some("busybox")).unwrap();
        assert_eq!(workload.containers["main"].image, "busybox");
    }

    #[test]
    fn override_properties_set_and_remove_paths() {
        let mut raw: Value = serde_yaml::from_str(SAMPLE).unwrap();
        apply_override_property(&mut raw, "containers.main.image=busybox:1.36").unwrap();
        apply_override_property(&mut raw, "resources.db.params.size=").unwrap();
        apply_override_property(&mut raw, "resources.db.params.replicas=2").unwrap();
        apply_override_property(&mut raw, "service.ports.web.port=8080").unwrap();

        let workload = workload_from_value(raw).unwrap();
        assert_eq!(workload.containers["main"].image, "busybox:1.36");
        let params = workload.resources["db"].params.clone().unwrap_or_default();
        assert_eq!(params.get("size"), None);
        assert_eq!(params.get("replicas"), Some(&Value::from(2)));
        let service = workload.service.expect("service created by override");
        assert_eq!(service.ports["web"].port, 8080);
    }

    #[test]
    fn malformed_override_properties_are_rejected() {
        let mut raw: Value = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(apply_override_property(&mut raw, "containers.main.image").is_err());
        assert!(apply_override_property(&mut raw, "containers..image=x").is_err());
        assert!(apply_override_property(&mut raw, "apiVersion.inner=x").is_err());
    }

    #[test]
    fn overrides_file_is_merged_before_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workload_path = dir.path().join("score.yaml");
        fs::write(&workload_path, SAMPLE).unwrap();
        let overrides_path = dir.path().join("overrides.yaml");
        fs::write(
            &overrides_path,
            "containers:\n  main:\n    variables:\n      DB_HOST: null\n      MODE: prod\n",
        )
        .unwrap();

        let overrides = Overrides {
            file: Some(overrides_path),
            properties: vec!["metadata.team=core".to_string()],
        };
        let workload = load_workload_with(&workload_path, &overrides).unwrap();
        let variables = &workload.containers["main"].variables;
        assert_eq!(variables.get("MODE").map(String::as_str), Some("prod"));
        assert!(!variables.contains_key("DB_HOST"));
        assert_eq!(workload.metadata.get("team"), Some(&Value::from("core")));
        assert_eq!(workload.containers["main"].image, "nginx");
    }
}
