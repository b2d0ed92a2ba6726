//! Conversion of a provisioned workload into a Fly app config.
//!
//! Container variables and inline file contents go through the tracked
//! substitution. A variable whose value was read from a secret output is moved
//! out of `env` into the returned secrets map so it can be set as a runtime
//! secret; file contents that would embed a secret are rejected.
use crate::graph;
use crate::state::State;
use crate::template::{substitute_tracked, TemplateContext};
use crate::workload::{Container, ContainerFile};
use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppConfig {
    pub app: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Experimental>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Build {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Experimental {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct File {
    pub guest_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Base64 of the file contents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub internal_port: u16,
    pub protocol: String,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServicePort {
    pub port: u16,
}

/// App config plus the variables that must be delivered as secrets.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadManifest {
    pub config: AppConfig,
    pub secrets: BTreeMap<String, String>,
}

impl WorkloadManifest {
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("encode app config as TOML")
    }
}

pub fn workload_manifest(state: &State, workload_name: &str) -> Result<WorkloadManifest> {
    let workload = state
        .workloads
        .get(workload_name)
        .ok_or_else(|| anyhow!("workload '{workload_name}' is not in the project"))?;
    let outputs = graph::outputs_for(state, workload_name)?;
    let ctx = TemplateContext {
        metadata: &workload.spec.metadata,
        resources: &outputs,
    };

    let mut containers = workload.spec.containers.iter();
    let (container_name, container) = match (containers.next(), containers.next()) {
        (Some(only), None) => only,
        _ => {
            return Err(anyhow!(
                "workload '{workload_name}': exactly one container per workload is supported"
            ))
        }
    };
    let base_dir = workload
        .file
        .as_deref()
        .and_then(|file| Path::new(file).parent())
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut config = AppConfig {
        app: format!("{}{}", state.extras.app_prefix, workload_name),
        build: Some(build_section(container, workload.file.is_some(), &base_dir)),
        ..AppConfig::default()
    };
    if !container.command.is_empty() || !container.args.is_empty() {
        config.experimental = Some(Experimental {
            cmd: container.args.clone(),
            entrypoint: container.command.clone(),
        });
    }

    let mut secrets = BTreeMap::new();
    for (key, template) in &container.variables {
        let resolved = substitute_tracked(template, &ctx)
            .with_context(|| format!("containers.{container_name}.variables.{key}"))?;
        if resolved.secret_touched {
            tracing::debug!(variable = %key, "routing variable to runtime secrets");
            secrets.insert(key.clone(), resolved.value);
        } else {
            config.env.insert(key.clone(), resolved.value);
        }
    }

    for (index, file) in container.files.iter().enumerate() {
        let converted = convert_file(file, &ctx, &base_dir)
            .with_context(|| format!("containers.{container_name}.files[{index}]"))?;
        config.files.push(converted);
    }

    if let Some(service) = &workload.spec.service {
        for port in service.ports.values() {
            let protocol = match port.protocol.as_deref() {
                Some(protocol) if protocol.eq_ignore_ascii_case("udp") => "udp",
                _ => "tcp",
            };
            config.services.push(Service {
                internal_port: port.target_port.unwrap_or(port.port),
                protocol: protocol.to_string(),
                ports: vec![ServicePort { port: port.port }],
            });
        }
    }

    Ok(WorkloadManifest { config, secrets })
}

fn build_section(container: &Container, has_file: bool, base_dir: &Path) -> Build {
    if container.image == "." && has_file {
        return Build {
            image: None,
            dockerfile: Some(base_dir.join("Dockerfile").display().to_string()),
        };
    }
    Build {
        image: Some(container.image.clone()),
        dockerfile: None,
    }
}

fn convert_file(file: &ContainerFile, ctx: &TemplateContext<'_>, base_dir: &Path) -> Result<File> {
    let expand = !file.no_expand.unwrap_or(false);
    let raw = match (&file.content, &file.source) {
        (Some(content), _) => content.clone(),
        (None, Some(source)) => {
            let path = resolve_source(source, base_dir);
            if !expand {
                return Ok(File {
                    guest_path: file.target.clone(),
                    local_path: Some(path.display().to_string()),
                    raw_value: None,
                });
            }
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            String::from_utf8(bytes).map_err(|_| {
                anyhow!(
                    "cannot expand non UTF-8 file {} (set noExpand to copy it as-is)",
                    path.display()
                )
            })?
        }
        (None, None) => return Err(anyhow!("content or source must be set")),
    };

    let contents = if expand {
        let resolved = substitute_tracked(&raw, ctx)?;
        if resolved.secret_touched {
            return Err(anyhow!(
                "file '{}' references a secret output and cannot be written as plaintext",
                file.target
            ));
        }
        resolved.value
    } else {
        raw
    };
    Ok(File {
        guest_path: file.target.clone(),
        local_path: None,
        raw_value: Some(base64::engine::general_purpose::STANDARD.encode(contents)),
    })
}

fn resolve_source(source: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(source);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
#[path = "convert_tests.rs"]
mod tests;
