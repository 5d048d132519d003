// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Resource interpretation.
//!
//! The binding builder needs to know how many replicas a template asks for,
//! but the detector watches arbitrary kinds. The [`ResourceInterpreter`]
//! trait abstracts that knowledge; the built-in implementation understands
//! the standard workload kinds that declare `.spec.replicas` and a pod
//! template.

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::crd::ReplicaRequirements;

/// Interpretation hooks a resource kind may support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpreterOperation {
    /// Derive `(replicas, requirements)` from a template.
    InterpretReplica,
}

/// Knows the details of resource structure for particular kinds.
#[async_trait]
pub trait ResourceInterpreter: Send + Sync {
    /// Whether `operation` is supported for the given kind.
    fn hook_enabled(&self, gvk: &GroupVersionKind, operation: InterpreterOperation) -> bool;

    /// Derive the declared replica count and per-replica requirements.
    ///
    /// Only called when [`hook_enabled`](Self::hook_enabled) returned true
    /// for [`InterpreterOperation::InterpretReplica`].
    async fn get_replicas(
        &self,
        object: &DynamicObject,
    ) -> Result<(i32, Option<ReplicaRequirements>)>;
}

/// Interpreter for the built-in workload kinds.
///
/// Covers `apps/v1` Deployment, StatefulSet and ReplicaSet, and `batch/v1`
/// Job. Custom workload shapes need their own interpreter.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinInterpreter;

#[async_trait]
impl ResourceInterpreter for BuiltinInterpreter {
    fn hook_enabled(&self, gvk: &GroupVersionKind, operation: InterpreterOperation) -> bool {
        match operation {
            InterpreterOperation::InterpretReplica => matches!(
                (gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()),
                ("apps", "v1", "Deployment" | "StatefulSet" | "ReplicaSet")
                    | ("batch", "v1", "Job")
            ),
        }
    }

    async fn get_replicas(
        &self,
        object: &DynamicObject,
    ) -> Result<(i32, Option<ReplicaRequirements>)> {
        let spec = object
            .data
            .get("spec")
            .context("workload template has no spec")?;

        // Workload controllers treat a missing replica count as 1.
        let replicas = spec
            .get("replicas")
            .or_else(|| spec.get("parallelism"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let replicas = i32::try_from(replicas).context("replica count out of range")?;

        Ok((replicas, replica_requirements(spec)))
    }
}

/// Sum the resource requests of the pod template's containers into
/// per-replica requirements. Returns `None` when no container declares
/// requests.
fn replica_requirements(spec: &Value) -> Option<ReplicaRequirements> {
    let containers = spec
        .get("template")?
        .get("spec")?
        .get("containers")?
        .as_array()?;

    let mut request: BTreeMap<String, String> = BTreeMap::new();
    for container in containers {
        let Some(requests) = container
            .get("resources")
            .and_then(|r| r.get("requests"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        for (resource, quantity) in requests {
            if let Some(quantity) = quantity.as_str() {
                // Last container wins on duplicate resource names.
                request.insert(resource.clone(), quantity.to_string());
            }
        }
    }

    if request.is_empty() {
        None
    } else {
        Some(ReplicaRequirements {
            resource_request: Some(request),
        })
    }
}

#[cfg(test)]
#[path = "interpreter_tests.rs"]
mod interpreter_tests;
