// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Label, annotation and finalizer constants shared across all reconcilers,
//! plus small helpers for merging and removing marks on object metadata.
//!
//! Policy identity marks come in two scope-specific sets: the ones written
//! when a `PropagationPolicy` claims a resource template, and the ones written
//! by a `ClusterPropagationPolicy`. A template carries at most one of the two
//! permanent-id labels outside of a preemption hand-over.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

// ============================================================================
// Policy identity marks
// ============================================================================

/// Label carrying the permanent id of the `PropagationPolicy` that claimed a
/// resource template. Also present on the policy itself and on derived
/// bindings.
pub const PROPAGATION_POLICY_PERMANENT_ID_LABEL: &str = "propagationpolicy.stratus.io/permanent-id";

/// Annotation naming the namespace of the claiming `PropagationPolicy`.
pub const PROPAGATION_POLICY_NAMESPACE_ANNOTATION: &str = "propagationpolicy.stratus.io/namespace";

/// Annotation naming the claiming `PropagationPolicy`.
pub const PROPAGATION_POLICY_NAME_ANNOTATION: &str = "propagationpolicy.stratus.io/name";

/// Label carrying the permanent id of the claiming `ClusterPropagationPolicy`.
pub const CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL: &str =
    "clusterpropagationpolicy.stratus.io/permanent-id";

/// Annotation naming the claiming `ClusterPropagationPolicy`.
pub const CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION: &str =
    "clusterpropagationpolicy.stratus.io/name";

/// Label set by other controllers to take a resource template out of policy
/// matching entirely. A template carrying this label is left alone.
pub const RESOURCE_TEMPLATE_CLAIMED_BY_LABEL: &str = "stratus.io/claimed-by";

/// Marks removed from templates and bindings when a `PropagationPolicy` is
/// deleted or stops matching.
pub const PROPAGATION_POLICY_MARKED_LABELS: &[&str] = &[PROPAGATION_POLICY_PERMANENT_ID_LABEL];

/// Annotation half of the `PropagationPolicy` mark set.
pub const PROPAGATION_POLICY_MARKED_ANNOTATIONS: &[&str] = &[
    PROPAGATION_POLICY_NAMESPACE_ANNOTATION,
    PROPAGATION_POLICY_NAME_ANNOTATION,
];

/// Marks removed when a `ClusterPropagationPolicy` is deleted or stops
/// matching.
pub const CLUSTER_PROPAGATION_POLICY_MARKED_LABELS: &[&str] =
    &[CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL];

/// Annotation half of the `ClusterPropagationPolicy` mark set.
pub const CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS: &[&str] =
    &[CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION];

// ============================================================================
// Finalizers
// ============================================================================

/// Finalizer held on every `PropagationPolicy` until its marks are cleaned up.
pub const PROPAGATION_POLICY_CONTROLLER_FINALIZER: &str =
    "stratus.io/propagation-policy-controller";

/// Finalizer held on every `ClusterPropagationPolicy` until its marks are
/// cleaned up.
pub const CLUSTER_PROPAGATION_POLICY_CONTROLLER_FINALIZER: &str =
    "stratus.io/cluster-propagation-policy-controller";

/// Finalizer placed on every `ResourceBinding` the detector creates.
pub const BINDING_CONTROLLER_FINALIZER: &str = "stratus.io/binding-controller";

/// Finalizer placed on every `ClusterResourceBinding` the detector creates.
pub const CLUSTER_RESOURCE_BINDING_CONTROLLER_FINALIZER: &str =
    "stratus.io/cluster-resource-binding-controller";

// ============================================================================
// Metadata helpers
// ============================================================================

/// Merge `additions` into `target`, allocating the map if absent. Keys already
/// present are overwritten, everything else is preserved.
pub fn dedupe_and_merge(
    target: &mut Option<BTreeMap<String, String>>,
    additions: &BTreeMap<String, String>,
) {
    if additions.is_empty() {
        return;
    }
    let map = target.get_or_insert_with(BTreeMap::new);
    for (key, value) in additions {
        map.insert(key.clone(), value.clone());
    }
}

/// Remove the given label and annotation keys from `meta`. Empty maps are
/// collapsed back to `None` so serialized output stays clean.
pub fn remove_marks(meta: &mut ObjectMeta, labels: &[&str], annotations: &[&str]) {
    if let Some(map) = meta.labels.as_mut() {
        for key in labels {
            map.remove(*key);
        }
        if map.is_empty() {
            meta.labels = None;
        }
    }
    if let Some(map) = meta.annotations.as_mut() {
        for key in annotations {
            map.remove(*key);
        }
        if map.is_empty() {
            meta.annotations = None;
        }
    }
}

/// Strip the cluster-policy permanent-id label from a label map.
///
/// Returns `true` when the label was present. Used while claiming for a
/// namespace-scoped policy, which supersedes a cluster-scoped claim.
pub fn exclude_cluster_policy(labels: &mut BTreeMap<String, String>) -> bool {
    labels
        .remove(CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL)
        .is_some()
}

/// Read a label value, treating a missing map and a missing key the same.
pub fn label_value<'a>(labels: Option<&'a BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    labels.and_then(|map| map.get(key)).map(String::as_str)
}

#[cfg(test)]
#[path = "labels_tests.rs"]
mod labels_tests;
