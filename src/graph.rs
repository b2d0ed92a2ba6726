//! Resource dependency graph.
//!
//! A resource depends on every resource its raw params reference through a
//! `${resources.<name>...}` placeholder, where `<name>` is resolved within the
//! owning workload. Provisioning follows a topological order of that graph;
//! resources with no relative ordering are taken in uid string order
//! (`<type>.<class>#<id>`, so type sorts first) and runs are reproducible.
use crate::error::{CycleError, ValidationError};
use crate::secrets::{Channel, Lookup};
use crate::state::{Bindings, ResourceBinding, ResourceUid, State};
use crate::template;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Property looked up by a bare `${resources.<name>}` reference.
pub const DEFAULT_OUTPUT_KEY: &str = "default";

/// Order the bound resources so every resource comes after its dependencies.
pub fn provisioning_order(
    state: &State,
    bindings: &Bindings,
) -> Result<Vec<ResourceUid>, CycleError> {
    let deps: BTreeMap<&ResourceUid, BTreeSet<ResourceUid>> = bindings
        .iter()
        .map(|(uid, binding)| {
            let edges = dependencies_of(state, binding)
                .into_iter()
                .filter(|dep| bindings.contains_key(dep))
                .collect();
            (uid, edges)
        })
        .collect();

    let mut dependents: BTreeMap<&ResourceUid, Vec<&ResourceUid>> = BTreeMap::new();
    let mut pending: BTreeMap<&ResourceUid, usize> = BTreeMap::new();
    for (uid, edges) in &deps {
        pending.insert(*uid, edges.len());
        for dep in edges {
            if let Some((dep_key, _)) = deps.get_key_value(dep) {
                dependents.entry(*dep_key).or_default().push(*uid);
            }
        }
    }

    let mut ready: BTreeSet<&ResourceUid> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(uid, _)| *uid)
        .collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(uid) = ready.pop_first() {
        order.push(uid.clone());
        pending.remove(uid);
        for next in dependents.get(uid).into_iter().flatten() {
            if let Some(count) = pending.get_mut(*next) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    if pending.is_empty() {
        return Ok(order);
    }
    let remaining: BTreeSet<&ResourceUid> = pending.keys().copied().collect();
    Err(CycleError {
        members: cycle_members(&deps, &remaining),
    })
}

/// Resources in the unsorted remainder that can reach themselves.
///
/// The remainder also holds resources that only depend on a cycle; those are
/// not reported.
fn cycle_members(
    deps: &BTreeMap<&ResourceUid, BTreeSet<ResourceUid>>,
    remaining: &BTreeSet<&ResourceUid>,
) -> Vec<ResourceUid> {
    remaining
        .iter()
        .filter(|start| reaches(deps, remaining, start, start))
        .map(|uid| (*uid).clone())
        .collect()
}

/// Whether `target` is reachable from `from` over at least one edge.
fn reaches(
    deps: &BTreeMap<&ResourceUid, BTreeSet<ResourceUid>>,
    remaining: &BTreeSet<&ResourceUid>,
    from: &ResourceUid,
    target: &ResourceUid,
) -> bool {
    let mut seen: BTreeSet<&ResourceUid> = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(uid) = stack.pop() {
        for dep in deps.get(uid).into_iter().flatten() {
            if dep == target {
                return true;
            }
            if let Some(dep) = remaining.get(dep) {
                if seen.insert(*dep) {
                    stack.push(*dep);
                }
            }
        }
    }
    false
}

/// Uids referenced from a binding's raw params.
pub fn dependencies_of(state: &State, binding: &ResourceBinding) -> BTreeSet<ResourceUid> {
    let mut names = BTreeSet::new();
    collect_resource_refs(&Value::Object(binding.params.clone()), &mut names);
    names
        .into_iter()
        .filter_map(|name| state.resource_uid_for(&binding.source_workload, &name))
        .collect()
}

fn collect_resource_refs(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => names.extend(template::referenced_resources(text)),
        Value::Array(items) => items.iter().for_each(|item| collect_resource_refs(item, names)),
        Value::Object(map) => map.values().for_each(|item| collect_resource_refs(item, names)),
        _ => {}
    }
}

/// Read-only view of one resource's outputs.
#[derive(Debug, Clone, Copy)]
pub struct ResourceOutputs<'a> {
    pub values: &'a Map<String, Value>,
    pub secrets: &'a Map<String, Value>,
}

impl ResourceOutputs<'_> {
    /// Walk `path` into the outputs, preferring the secret channel.
    ///
    /// The first segment names the output; later segments index into nested
    /// objects or, when numeric, arrays.
    pub fn lookup(&self, path: &[&str]) -> Result<Lookup, String> {
        let Some((first, rest)) = path.split_first() else {
            return self.lookup(&[DEFAULT_OUTPUT_KEY]);
        };
        let (root, channel) = match (self.secrets.get(*first), self.values.get(*first)) {
            (Some(secret), _) => (secret, Channel::Secrets),
            (None, Some(value)) => (value, Channel::Values),
            (None, None) => return Err(format!("output '{first}' is not set")),
        };
        let value = walk(root, rest).ok_or_else(|| {
            format!("output '{}' has no property '{}'", first, rest.join("."))
        })?;
        Ok(Lookup {
            value: value.clone(),
            channel,
        })
    }
}

pub(crate) fn walk<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Output views for every resource a workload declares, keyed by resource name.
pub type WorkloadOutputs<'a> = BTreeMap<String, ResourceOutputs<'a>>;

pub fn outputs_for<'a>(state: &'a State, workload: &str) -> Result<WorkloadOutputs<'a>, ValidationError> {
    let spec = &state
        .workloads
        .get(workload)
        .ok_or_else(|| ValidationError::new(format!("unknown workload '{workload}'")))?
        .spec;
    let mut out = WorkloadOutputs::new();
    for res_name in spec.resources.keys() {
        let Some(uid) = state.resource_uid_for(workload, res_name) else {
            continue;
        };
        if let Some(resource) = state.resources.get(&uid) {
            out.insert(
                res_name.clone(),
                ResourceOutputs {
                    values: &resource.outputs,
                    secrets: &resource.secrets,
                },
            );
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;
