// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Removal of policy identity marks.
//!
//! When a policy is deleted or stops matching, its labels and annotations
//! come off the resource template first and the binding second. The ordering
//! matters under partial failure: the binding keeps the policy label until
//! the template is clean, so a retry lists the binding again and finishes
//! the job.

use anyhow::{bail, Context as AnyhowContext, Result};
use kube::api::{Api, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

use crate::constants::CONFLICT_RETRY_ATTEMPTS;
use crate::crd::ObjectReference;
use crate::detector::{is_conflict, is_not_found, ResourceDetector};
use crate::keys::ClusterWideKey;
use crate::labels::remove_marks;

impl ResourceDetector {
    /// Remove policy marks from the resource template referenced by a
    /// binding.
    ///
    /// Reads the template live rather than from the informer cache; the
    /// cache may lag the binding listing that produced the reference. A
    /// template that no longer exists counts as success.
    pub(crate) async fn cleanup_resource_template_marks(
        &self,
        reference: &ObjectReference,
        labels: &[&str],
        annotations: &[&str],
    ) -> Result<()> {
        let key = ClusterWideKey::from_object_reference(reference);
        let api = self.dynamic_api(&key);

        let object = match api.get(&key.name).await {
            Ok(object) => object,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err).with_context(|| format!("fetching template {key}")),
        };

        let mut updated = object.clone();
        remove_marks(&mut updated.metadata, labels, annotations);

        api.replace(&key.name, &PostParams::default(), &updated)
            .await
            .with_context(|| format!("removing policy marks from template {key}"))?;
        debug!(key = %key, "Removed policy marks from resource template");
        Ok(())
    }
}

/// Remove policy marks from a binding under a conflict-retry loop: mutate,
/// write, and on conflict refetch and try again. A binding that disappears
/// mid-loop counts as success.
pub(crate) async fn cleanup_binding_marks<B>(
    api: &Api<B>,
    binding: &B,
    labels: &[&str],
    annotations: &[&str],
) -> Result<()>
where
    B: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = binding.name_any();
    let mut current = binding.clone();

    for _ in 0..CONFLICT_RETRY_ATTEMPTS {
        let mut updated = current.clone();
        remove_marks(updated.meta_mut(), labels, annotations);

        match api.replace(&name, &PostParams::default(), &updated).await {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) if is_conflict(&err) => match api.get(&name).await {
                Ok(fresh) => current = fresh,
                Err(err) if is_not_found(&err) => return Ok(()),
                Err(err) => {
                    return Err(err).with_context(|| format!("refetching binding {name}"))
                }
            },
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("removing policy marks from binding {name}"))
            }
        }
    }

    bail!("conflict retries exhausted while cleaning binding {name}")
}

/// Collapse per-item cleanup errors into one, so one bad binding does not
/// mask successful cleanup of the rest.
pub(crate) fn aggregate_errors(errors: Vec<anyhow::Error>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let summary = errors
        .iter()
        .map(|err| format!("{err:#}"))
        .collect::<Vec<_>>()
        .join("; ");
    bail!("{} cleanup operation(s) failed: {summary}", errors.len())
}

#[cfg(test)]
#[path = "cleanup_tests.rs"]
mod cleanup_tests;
