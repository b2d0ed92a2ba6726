//! Persisted project state.
//!
//! One JSON document per project holds the workloads, the resources keyed by
//! uid, the shared state, and the provisioner registry. The document is
//! rewritten whole on every persist via a temp file and rename, so readers
//! never observe a partial write. Concurrent writers are not coordinated.
use crate::error::{Error, Result, ValidationError};
use crate::provisioners::Provisioner;
use crate::workload::Workload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_DIR: &str = ".score-fly";
pub const STATE_FILE_NAME: &str = "state.json";
pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_RESOURCE_CLASS: &str = "default";
pub const SHARED_STATE_APP_PREFIX_KEY: &str = "app_prefix";

/// Deterministic identity of a resource: `<type>.<class>#<id>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceUid(String);

impl ResourceUid {
    /// Derive the uid for a declaration.
    ///
    /// Shared resources (those with an explicit id) collapse to one uid across
    /// workloads; everything else is scoped to `<workload>.<resource name>`.
    pub fn new(
        workload: &str,
        res_name: &str,
        res_type: &str,
        class: Option<&str>,
        id: Option<&str>,
    ) -> Self {
        let class = class.unwrap_or(DEFAULT_RESOURCE_CLASS);
        let id = match id {
            Some(id) => id.to_string(),
            None => format!("{workload}.{res_name}"),
        };
        ResourceUid(format!("{res_type}.{class}#{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceUid {
    fn from(value: &str) -> Self {
        ResourceUid(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadState {
    pub spec: Workload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    #[serde(rename = "type")]
    pub res_type: String,
    pub class: String,
    pub id: String,
    /// Owning workload; empty once the resource is orphaned.
    #[serde(default)]
    pub source_workload: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Raw params as declared, before substitution.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Params after substitution; recomputed every run.
    #[serde(skip)]
    pub resolved_params: Option<Map<String, Value>>,
    /// Provisioner-private state, round-tripped untouched.
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub secrets: Map<String, Value>,
    /// Id of the provisioner that last provisioned this resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provisioner: String,
}

impl ResourceState {
    pub fn is_orphaned(&self) -> bool {
        self.source_workload.is_empty()
    }
}

/// Declared shape of one resource in the current workloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBinding {
    pub res_type: String,
    pub class: String,
    pub id: String,
    pub source_workload: String,
    pub params: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

pub type Bindings = BTreeMap<ResourceUid, ResourceBinding>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateExtras {
    #[serde(default)]
    pub app_prefix: String,
    /// Registration order: index 0 takes precedence.
    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub schema_version: u32,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadState>,
    #[serde(default)]
    pub resources: BTreeMap<ResourceUid, ResourceState>,
    #[serde(default = "empty_object")]
    pub shared_state: Value,
    #[serde(default)]
    pub extras: StateExtras,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for State {
    fn default() -> Self {
        State {
            schema_version: STATE_SCHEMA_VERSION,
            workloads: BTreeMap::new(),
            resources: BTreeMap::new(),
            shared_state: empty_object(),
            extras: StateExtras::default(),
        }
    }
}

impl State {
    pub fn new(app_prefix: &str) -> Self {
        let mut shared = Map::new();
        shared.insert(
            SHARED_STATE_APP_PREFIX_KEY.to_string(),
            Value::String(app_prefix.to_string()),
        );
        State {
            shared_state: Value::Object(shared),
            extras: StateExtras {
                app_prefix: app_prefix.to_string(),
                provisioners: Vec::new(),
            },
            ..State::default()
        }
    }

    /// Add or replace a workload by its metadata name.
    pub fn with_workload(&mut self, spec: Workload, file: Option<String>) -> Result<()> {
        let name = spec
            .name()
            .ok_or_else(|| ValidationError::new("workload metadata.name must be a string"))?
            .to_string();
        self.workloads.insert(name, WorkloadState { spec, file });
        Ok(())
    }

    /// Resolve every resource declaration to its binding without touching the
    /// store.
    ///
    /// Workloads are visited in name order. A shared uid declared more than
    /// once takes its params and metadata from the first declaration that sets
    /// them; two declarations setting different values are rejected.
    pub fn resource_bindings(&self) -> Result<Bindings> {
        let mut bindings = Bindings::new();
        let mut problems = Vec::new();
        for (workload_name, workload) in &self.workloads {
            for (res_name, decl) in &workload.spec.resources {
                let uid = ResourceUid::new(
                    workload_name,
                    res_name,
                    &decl.res_type,
                    decl.class.as_deref(),
                    decl.id.as_deref(),
                );
                let params = decl.params.clone().unwrap_or_default();
                let metadata = decl.metadata.clone().unwrap_or_default();

                let Some(existing) = bindings.get_mut(&uid) else {
                    bindings.insert(
                        uid,
                        ResourceBinding {
                            res_type: decl.res_type.clone(),
                            class: decl
                                .class
                                .clone()
                                .unwrap_or_else(|| DEFAULT_RESOURCE_CLASS.to_string()),
                            id: decl
                                .id
                                .clone()
                                .unwrap_or_else(|| format!("{workload_name}.{res_name}")),
                            source_workload: workload_name.clone(),
                            params,
                            metadata,
                        },
                    );
                    continue;
                };

                if !params.is_empty() {
                    if existing.params.is_empty() {
                        // params resolve against the workload that declared them
                        existing.params = params;
                        existing.source_workload = workload_name.clone();
                    } else if existing.params != params {
                        problems.push(format!(
                            "resource '{uid}': multiple definitions with different params"
                        ));
                    }
                }
                if !metadata.is_empty() {
                    if existing.metadata.is_empty() {
                        existing.metadata = metadata;
                    } else if existing.metadata != metadata {
                        problems.push(format!(
                            "resource '{uid}': multiple definitions with different metadata"
                        ));
                    }
                }
            }
        }
        if !problems.is_empty() {
            return Err(ValidationError { problems }.into());
        }
        Ok(bindings)
    }

    /// Write `bindings` into the store and return the bound uids.
    ///
    /// Entries already in the store keep their state and outputs; params,
    /// metadata and owner are replaced.
    pub fn apply_bindings(&mut self, bindings: &Bindings) -> BTreeSet<ResourceUid> {
        for (uid, binding) in bindings {
            let entry = self
                .resources
                .entry(uid.clone())
                .or_insert_with(|| ResourceState {
                    res_type: binding.res_type.clone(),
                    class: binding.class.clone(),
                    id: binding.id.clone(),
                    source_workload: String::new(),
                    metadata: Map::new(),
                    params: Map::new(),
                    resolved_params: None,
                    state: Map::new(),
                    outputs: Map::new(),
                    secrets: Map::new(),
                    provisioner: String::new(),
                });
            entry.source_workload = binding.source_workload.clone();
            entry.params = binding.params.clone();
            entry.metadata = binding.metadata.clone();
            entry.resolved_params = None;
        }
        bindings.keys().cloned().collect()
    }

    /// Bind every resource declaration to a resource entry.
    ///
    /// Nothing is written when any declaration conflicts.
    pub fn prime_resources(&mut self) -> Result<BTreeSet<ResourceUid>> {
        let bindings = self.resource_bindings()?;
        Ok(self.apply_bindings(&bindings))
    }

    /// Clear the owner of every resource not declared in this run.
    ///
    /// Entries are kept so they can be deprovisioned explicitly later.
    pub fn mark_orphans(&mut self, declared: &BTreeSet<ResourceUid>) -> Vec<ResourceUid> {
        let mut orphans = Vec::new();
        for (uid, resource) in self.resources.iter_mut() {
            if declared.contains(uid) {
                continue;
            }
            resource.source_workload.clear();
            orphans.push(uid.clone());
        }
        orphans
    }

    /// Find the uid a workload's resource name refers to.
    pub fn resource_uid_for(&self, workload: &str, res_name: &str) -> Option<ResourceUid> {
        let decl = self.workloads.get(workload)?.spec.resources.get(res_name)?;
        Some(ResourceUid::new(
            workload,
            res_name,
            &decl.res_type,
            decl.class.as_deref(),
            decl.id.as_deref(),
        ))
    }
}

/// A state document bound to the directory it lives in.
#[derive(Debug, Clone)]
pub struct StateDirectory {
    pub path: PathBuf,
    pub state: State,
}

impl StateDirectory {
    pub fn new(path: PathBuf, state: State) -> Self {
        StateDirectory { path, state }
    }

    /// Load the state directory if one exists at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        use anyhow::Context;

        let file = path.join(STATE_FILE_NAME);
        if !file.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&file).with_context(|| format!("read state {}", file.display()))?;
        let state: State = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse state {}", file.display()))?;
        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(anyhow::anyhow!(
                "unsupported state schema_version {} in {}",
                state.schema_version,
                file.display()
            ));
        }
        Ok(Some(StateDirectory {
            path: path.to_path_buf(),
            state,
        }))
    }

    pub fn state_path(&self) -> PathBuf {
        self.path.join(STATE_FILE_NAME)
    }

    /// Write the whole document atomically.
    pub fn persist(&self) -> Result<()> {
        self.write_atomic()
            .map_err(|message| Error::persist(&self.state_path(), message, None))
    }

    /// Persist, then return `outcome`; a write failure keeps `outcome`'s error.
    pub fn persist_after<T>(&self, outcome: Result<T>) -> Result<T> {
        match self.write_atomic() {
            Ok(()) => outcome,
            Err(message) => Err(Error::persist(&self.state_path(), message, outcome.err())),
        }
    }

    fn write_atomic(&self) -> std::result::Result<(), String> {
        let path = self.state_path();
        fs::create_dir_all(&self.path)
            .map_err(|err| format!("create {}: {err}", self.path.display()))?;
        let mut text = serde_json::to_string_pretty(&self.state)
            .map_err(|err| format!("serialize state: {err}"))?;
        text.push('\n');
        let mut tmp = tempfile::NamedTempFile::new_in(&self.path)
            .map_err(|err| format!("create temp file: {err}"))?;
        tmp.write_all(text.as_bytes())
            .map_err(|err| format!("write temp file: {err}"))?;
        tmp.as_file()
            .sync_all()
            .map_err(|err| format!("sync temp file: {err}"))?;
        tmp.persist(&path)
            .map_err(|err| format!("rename into place: {}", err.error))?;
        tracing::debug!(path = %path.display(), bytes = text.len(), "persisted state");
        Ok(())
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
