//! Provisioning runs over the whole project state.
//!
//! A run has two halves. Planning binds every declaration and orders the
//! resources without touching `state`, so a conflicting declaration or a
//! dependency cycle leaves nothing to persist. Execution then provisions one
//! resource at a time in dependency order, mutating `state` in place as soon
//! as each step succeeds; a run that fails part way through still leaves every
//! earlier resource's results in `state`, and callers persist with
//! [`crate::state::StateDirectory::persist_after`] to keep them.
use crate::config::EngineConfig;
use crate::error::{Error, Result, ValidationError};
use crate::graph;
use crate::patch::merge_patch;
use crate::provisioners::{find_provisioner, Mode, ProvisionRequest, Provisioner};
use crate::state::{Bindings, ResourceUid, State};
use crate::template::{substitute_params, TemplateContext};
use serde_json::{Map, Value};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolving,
    Matching,
    Dispatching,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Resolving => "resolving",
            Phase::Matching => "matching",
            Phase::Dispatching => "dispatching",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Resources provisioned in this run, in the order they were dispatched.
    pub provisioned: Vec<ResourceUid>,
    /// Stored resources no workload declares any more.
    pub orphans: Vec<ResourceUid>,
}

/// Bound declarations and the order to provision them in.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    bindings: Bindings,
    order: Vec<ResourceUid>,
}

impl ProvisionPlan {
    pub fn order(&self) -> &[ResourceUid] {
        &self.order
    }
}

/// Bind and order every declared resource without modifying `state`.
pub fn plan_provisioning(state: &State) -> Result<ProvisionPlan> {
    let bindings = state.resource_bindings()?;
    let order = graph::provisioning_order(state, &bindings)?;
    tracing::debug!(count = order.len(), "provisioning order computed");
    Ok(ProvisionPlan { bindings, order })
}

/// Provision every declared resource, then mark the undeclared ones orphaned.
///
/// Stops at the first failing resource.
pub fn provision_resources(state: &mut State, config: &EngineConfig) -> Result<ProvisionReport> {
    let plan = plan_provisioning(state)?;
    execute_plan(state, plan, config)
}

/// Commit `plan`'s bindings into `state` and dispatch in plan order.
pub fn execute_plan(
    state: &mut State,
    plan: ProvisionPlan,
    config: &EngineConfig,
) -> Result<ProvisionReport> {
    let declared = state.apply_bindings(&plan.bindings);

    let mut report = ProvisionReport::default();
    for uid in plan.order {
        provision_one(state, &uid, config)?;
        report.provisioned.push(uid);
    }

    report.orphans = state.mark_orphans(&declared);
    for uid in &report.orphans {
        tracing::warn!(
            uid = %uid,
            "resource is no longer declared by any workload; run `resources deprovision` to remove it"
        );
    }
    Ok(report)
}

fn provision_one(state: &mut State, uid: &ResourceUid, config: &EngineConfig) -> Result<()> {
    let mut phase = Phase::Resolving;
    let outcome = provision_steps(state, uid, config, &mut phase);
    if let Err(err) = &outcome {
        tracing::error!(uid = %uid, phase = phase.as_str(), error = %err, "provisioning failed");
    }
    outcome
}

fn provision_steps(
    state: &mut State,
    uid: &ResourceUid,
    config: &EngineConfig,
    phase: &mut Phase,
) -> Result<()> {
    let resolved = resolve_params(state, uid)?;

    *phase = Phase::Matching;
    let resource = state
        .resources
        .get(uid)
        .ok_or_else(|| ValidationError::new(format!("resource '{uid}' is not in the state")))?;
    let provisioner = find_provisioner(
        &state.extras.provisioners,
        &resource.res_type,
        &resource.class,
        &resource.id,
    )
    .cloned()
    .ok_or_else(|| Error::NoProvisioner {
        uid: uid.clone(),
        res_type: resource.res_type.clone(),
        class: resource.class.clone(),
        id: resource.id.clone(),
    })?;

    *phase = Phase::Dispatching;
    let start = Instant::now();
    let Some(resource) = state.resources.get_mut(uid) else {
        return Err(ValidationError::new(format!("resource '{uid}' is not in the state")).into());
    };
    resource.resolved_params = Some(resolved);
    let request = ProvisionRequest::new(uid, resource, &state.shared_state, Mode::Provision);
    let response = provisioner.provision(uid, &request, config)?;

    if let Some(blob) = response.state {
        resource.state = blob;
    }
    if let Some(values) = response.values {
        resource.outputs = values;
    }
    if let Some(secrets) = response.secrets {
        resource.secrets = secrets;
    }
    resource.provisioner = provisioner.id.clone();
    if let Some(patch) = &response.shared {
        merge_patch(&mut state.shared_state, patch);
    }

    tracing::info!(
        uid = %uid,
        provisioner = %provisioner.id,
        elapsed_ms = start.elapsed().as_millis(),
        "provisioned resource"
    );
    Ok(())
}

fn resolve_params(state: &State, uid: &ResourceUid) -> Result<Map<String, Value>> {
    let resource = state
        .resources
        .get(uid)
        .ok_or_else(|| ValidationError::new(format!("resource '{uid}' is not in the state")))?;
    if resource.params.is_empty() {
        return Ok(Map::new());
    }
    let workload = state.workloads.get(&resource.source_workload).ok_or_else(|| {
        ValidationError::new(format!(
            "resource '{uid}' belongs to unknown workload '{}'",
            resource.source_workload
        ))
    })?;
    let outputs = graph::outputs_for(state, &resource.source_workload)?;
    let ctx = TemplateContext {
        metadata: &workload.spec.metadata,
        resources: &outputs,
    };
    let resolved = substitute_params(&resource.params, &ctx)
        .map_err(|err| err.within(&format!("resource '{uid}' params")))?;
    Ok(resolved)
}

/// Deprovision one resource and drop it from the state.
///
/// The provisioner recorded at provision time is used; the registry is not
/// re-matched. The entry is removed only when the dispatch succeeds; a
/// shared-state patch in the response is applied all the same.
pub fn deprovision_resource(state: &mut State, uid: &ResourceUid, config: &EngineConfig) -> Result<()> {
    let resource = state
        .resources
        .get(uid)
        .ok_or_else(|| ValidationError::new(format!("resource '{uid}' does not exist")))?;
    if !resource.is_orphaned() {
        tracing::warn!(
            uid = %uid,
            workload = %resource.source_workload,
            "resource is still declared; it will be provisioned again on the next generate"
        );
    }
    if resource.provisioner.is_empty() {
        tracing::info!(uid = %uid, "resource was never provisioned; removing it");
        state.resources.remove(uid);
        return Ok(());
    }

    let provisioner: &Provisioner = state
        .extras
        .provisioners
        .iter()
        .find(|provisioner| provisioner.id == resource.provisioner)
        .ok_or_else(|| {
            ValidationError::new(format!(
                "resource '{uid}' was provisioned by '{}' which is no longer registered",
                resource.provisioner
            ))
        })?;

    let start = Instant::now();
    let request = ProvisionRequest::new(uid, resource, &state.shared_state, Mode::Deprovision);
    let patch = provisioner.deprovision(uid, &request, config)?;
    let provisioner_id = provisioner.id.clone();

    state.resources.remove(uid);
    if let Some(patch) = &patch {
        merge_patch(&mut state.shared_state, patch);
    }
    tracing::info!(
        uid = %uid,
        provisioner = %provisioner_id,
        elapsed_ms = start.elapsed().as_millis(),
        "deprovisioned resource"
    );
    Ok(())
}

#[cfg(test)]
#[path = "provision_tests.rs"]
mod tests;
