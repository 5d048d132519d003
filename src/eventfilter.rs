// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Event ingress filtering and change classification.
//!
//! Every watched kind funnels through one handler. Before an event reaches
//! the template queue it passes the reservation filter; update events are
//! additionally dropped when nothing but volatile metadata or status changed,
//! and classified by whether the change originated inside the control plane.

use kube::api::DynamicObject;
use serde_json::Value;

use crate::config::DetectorConfig;
use crate::constants::{
    RESERVED_NAMESPACE_CLUSTER, RESERVED_NAMESPACE_EXECUTION_PREFIX, RESERVED_NAMESPACE_SYSTEM,
};
use crate::keys::ClusterWideKey;

/// Namespaces owned by the control plane itself.
#[must_use]
pub fn is_reserved_namespace(namespace: &str) -> bool {
    namespace == RESERVED_NAMESPACE_SYSTEM
        || namespace == RESERVED_NAMESPACE_CLUSTER
        || namespace.starts_with(RESERVED_NAMESPACE_EXECUTION_PREFIX)
}

/// Whether an object event should enter the template pipeline.
///
/// Drops objects in reserved namespaces, objects whose namespace matches a
/// configured skip pattern, and the apiserver-managed
/// `kube-system/ConfigMap/extension-apiserver-authentication` singleton.
#[must_use]
pub fn event_filter(key: &ClusterWideKey, config: &DetectorConfig) -> bool {
    if is_reserved_namespace(&key.namespace) {
        return false;
    }

    if config.namespace_skipped(&key.namespace) {
        return false;
    }

    // Generated and managed by kube-apiserver; never propagatable.
    if key.namespace == "kube-system"
        && key.kind == "ConfigMap"
        && key.name == "extension-apiserver-authentication"
    {
        return false;
    }

    true
}

/// Whether the specification of an object changed between two observed
/// versions.
///
/// Volatile metadata (`resourceVersion`, `generation`, `managedFields`) and
/// the entire `status` subtree are ignored; everything else, labels and
/// annotations included, counts as specification.
#[must_use]
pub fn specification_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    let old = comparable(old, false);
    let new = comparable(new, false);
    old != new
}

/// Whether a change touched nothing but detector-owned metadata.
///
/// True when stripping every `stratus.io` label and annotation makes the two
/// versions identical, meaning the detector itself was the author of the
/// change. Lazily-activated policies use this to avoid refresh feedback
/// loops.
#[must_use]
pub fn resource_change_by_stratus(old: &DynamicObject, new: &DynamicObject) -> bool {
    let old = comparable(old, true);
    let new = comparable(new, true);
    old == new
}

/// Serialize an object with volatile fields stripped, optionally also
/// stripping detector-owned marks.
fn comparable(object: &DynamicObject, strip_detector_marks: bool) -> Value {
    let mut value = serde_json::to_value(object).unwrap_or(Value::Null);

    if let Some(map) = value.as_object_mut() {
        map.remove("status");
    }
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
        metadata.remove("generation");
        metadata.remove("managedFields");

        if strip_detector_marks {
            for field in ["labels", "annotations"] {
                if let Some(entries) = metadata.get_mut(field).and_then(Value::as_object_mut) {
                    entries.retain(|key, _| !key.contains("stratus.io"));
                }
            }
        }
    }

    value
}

#[cfg(test)]
#[path = "eventfilter_tests.rs"]
mod eventfilter_tests;
