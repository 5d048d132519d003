// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Binding construction and upserts.
//!
//! A binding is the detector's output artifact: a snapshot of a resource
//! template plus the placement echoed from its governing policy, owned by the
//! template through a controller reference. The scheduler fills in
//! `spec.clusters`; the detector never touches that field on an existing
//! binding.

use anyhow::{bail, Context as AnyhowContext, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DynamicObject, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Write as FmtWrite;

use crate::constants::CONFLICT_RETRY_ATTEMPTS;
use crate::crd::{
    BindingObject, BindingSpec, ClusterResourceBinding, ClusterResourceBindingSpec,
    ObjectReference, PropagationSpec, ResourceBinding, ResourceBindingSpec,
};
use crate::detector::{is_conflict, is_not_found};
use crate::interpreter::{InterpreterOperation, ResourceInterpreter};
use crate::keys::ClusterWideKey;
use crate::labels::{
    dedupe_and_merge, BINDING_CONTROLLER_FINALIZER, CLUSTER_RESOURCE_BINDING_CONTROLLER_FINALIZER,
};

/// Outcome of a binding upsert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    /// The binding did not exist and was created.
    Created,
    /// The binding existed and was rewritten.
    Updated,
    /// The binding already matched the desired state; no write was issued.
    Unchanged,
}

/// Deterministic binding name for a template.
///
/// The suffix hashes the kind alongside the name, so two templates of
/// different kinds sharing a name never collide on the binding.
#[must_use]
pub fn generate_binding_name(kind: &str, name: &str) -> String {
    // RBAC-ish names may contain ':', which a CRD object name cannot.
    let sanitized = name.to_lowercase().replace(':', ".");
    let digest = Sha256::digest(format!("{kind}/{name}").as_bytes());
    let mut suffix = String::with_capacity(8);
    for byte in &digest[..4] {
        let _ = write!(suffix, "{byte:02x}");
    }
    format!("{sanitized}-{suffix}")
}

/// Build the desired `ResourceBinding` for a namespaced template.
///
/// # Errors
///
/// Fails when the template lacks identity fields or the resource interpreter
/// cannot derive its replicas.
pub(crate) async fn build_resource_binding(
    interpreter: &dyn ResourceInterpreter,
    object: &DynamicObject,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    policy_spec: &PropagationSpec,
) -> Result<ResourceBinding> {
    let key = ClusterWideKey::from_object(object)?;
    let mut spec = binding_spec_for(interpreter, object, &key, policy_spec).await?;
    spec.propagate_deps = policy_spec.propagate_deps;

    Ok(ResourceBinding {
        metadata: ObjectMeta {
            name: Some(generate_binding_name(&key.kind, &key.name)),
            namespace: object.namespace(),
            owner_references: Some(vec![controller_reference(object, &key)?]),
            labels: Some(labels),
            annotations: Some(annotations),
            finalizers: Some(vec![BINDING_CONTROLLER_FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: ResourceBindingSpec { binding: spec },
        status: None,
    })
}

/// Build the desired `ClusterResourceBinding` for a cluster-scoped template.
///
/// Dependency propagation is not carried on cluster bindings; cluster-scoped
/// resources have no dependency graph to follow.
///
/// # Errors
///
/// Fails when the template lacks identity fields or the resource interpreter
/// cannot derive its replicas.
pub(crate) async fn build_cluster_resource_binding(
    interpreter: &dyn ResourceInterpreter,
    object: &DynamicObject,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    policy_spec: &PropagationSpec,
) -> Result<ClusterResourceBinding> {
    let key = ClusterWideKey::from_object(object)?;
    let spec = binding_spec_for(interpreter, object, &key, policy_spec).await?;

    Ok(ClusterResourceBinding {
        metadata: ObjectMeta {
            name: Some(generate_binding_name(&key.kind, &key.name)),
            owner_references: Some(vec![controller_reference(object, &key)?]),
            labels: Some(labels),
            annotations: Some(annotations),
            finalizers: Some(vec![
                CLUSTER_RESOURCE_BINDING_CONTROLLER_FINALIZER.to_string()
            ]),
            ..Default::default()
        },
        spec: ClusterResourceBindingSpec { binding: spec },
        status: None,
    })
}

/// The binding body shared by both scopes: template snapshot, policy echo,
/// and interpreted replicas when the kind supports it.
async fn binding_spec_for(
    interpreter: &dyn ResourceInterpreter,
    object: &DynamicObject,
    key: &ClusterWideKey,
    policy_spec: &PropagationSpec,
) -> Result<BindingSpec> {
    let mut spec = BindingSpec {
        resource: ObjectReference {
            api_version: key.api_version(),
            kind: key.kind.clone(),
            namespace: object.namespace(),
            name: key.name.clone(),
            uid: object.metadata.uid.clone(),
            resource_version: object.metadata.resource_version.clone(),
        },
        placement: Some(policy_spec.placement.clone()),
        scheduler_name: policy_spec.scheduler_name.clone(),
        failover: policy_spec.failover.clone(),
        conflict_resolution: policy_spec.conflict_resolution,
        ..Default::default()
    };

    if interpreter.hook_enabled(&key.gvk(), InterpreterOperation::InterpretReplica) {
        let (replicas, requirements) = interpreter
            .get_replicas(object)
            .await
            .with_context(|| format!("interpreting replicas of {key}"))?;
        spec.replicas = Some(replicas);
        spec.replica_requirements = requirements;
    }

    Ok(spec)
}

/// Controller-owning reference from a binding back to its template.
fn controller_reference(object: &DynamicObject, key: &ClusterWideKey) -> Result<OwnerReference> {
    Ok(OwnerReference {
        api_version: key.api_version(),
        kind: key.kind.clone(),
        name: key.name.clone(),
        uid: object
            .metadata
            .uid
            .clone()
            .context("template has no uid")?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Create or update a binding under optimistic-concurrency retry.
///
/// The mutation preserves the scheduler-owned `spec.clusters` of an existing
/// binding, merges labels and annotations, and refuses to touch a binding
/// whose controller owner is a different object than `owner_uid`, leaving it
/// for garbage collection.
///
/// `strip_labels` removes the other scope's identity label when a policy of
/// one scope takes a binding over from the other.
///
/// # Errors
///
/// Fails on owner mismatch, on exhausted conflict retries, and on any other
/// API error.
pub(crate) async fn create_or_update_binding<B>(
    api: &Api<B>,
    desired: &B,
    owner_uid: &str,
    strip_labels: &[&str],
) -> Result<OperationResult>
where
    B: Resource<DynamicType = ()>
        + BindingObject
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug,
{
    let name = desired.meta().name.clone().context("binding has no name")?;

    for _ in 0..CONFLICT_RETRY_ATTEMPTS {
        let existing = match api.get(&name).await {
            Ok(existing) => existing,
            Err(err) if is_not_found(&err) => {
                match api.create(&PostParams::default(), desired).await {
                    Ok(_) => return Ok(OperationResult::Created),
                    // Lost a create race; fall through to the update path.
                    Err(err) if is_conflict(&err) => continue,
                    Err(err) => {
                        return Err(err).with_context(|| format!("creating binding {name}"))
                    }
                }
            }
            Err(err) => return Err(err).with_context(|| format!("fetching binding {name}")),
        };

        // A binding owned by a different object must be garbage collected
        // before this template may take the name.
        if let Some(owner) = controller_of(&existing) {
            if owner.uid != owner_uid {
                bail!(
                    "failed to update binding {name}: controller owner uid {} does not match \
                     template uid {owner_uid}, waiting for garbage collection",
                    owner.uid
                );
            }
        }

        let mut updated = existing.clone();
        if let Some(labels) = desired.meta().labels.as_ref() {
            dedupe_and_merge(&mut updated.meta_mut().labels, labels);
        }
        if let Some(annotations) = desired.meta().annotations.as_ref() {
            dedupe_and_merge(&mut updated.meta_mut().annotations, annotations);
        }
        updated.meta_mut().owner_references = desired.meta().owner_references.clone();
        updated.meta_mut().finalizers = desired.meta().finalizers.clone();
        if let Some(labels) = updated.meta_mut().labels.as_mut() {
            for label in strip_labels {
                labels.remove(*label);
            }
        }

        // Overwrite the spec but keep the scheduling result.
        let clusters = existing.binding().clusters.clone();
        *updated.binding_mut() = desired.binding().clone();
        updated.binding_mut().clusters = clusters;

        if serde_json::to_value(&updated)? == serde_json::to_value(&existing)? {
            return Ok(OperationResult::Unchanged);
        }

        match api.replace(&name, &PostParams::default(), &updated).await {
            Ok(_) => return Ok(OperationResult::Updated),
            Err(err) if is_conflict(&err) => continue,
            Err(err) => return Err(err).with_context(|| format!("updating binding {name}")),
        }
    }

    bail!("conflict retries exhausted while updating binding {name}")
}

/// The controller owner reference of an object, if any.
fn controller_of<B: Resource>(object: &B) -> Option<&OwnerReference> {
    object
        .meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

#[cfg(test)]
#[path = "binding_tests.rs"]
mod binding_tests;
