// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the CRD types.

use crate::crd::*;
use crate::labels::{
    CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL, PROPAGATION_POLICY_PERMANENT_ID_LABEL,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

#[test]
fn test_propagation_spec_defaults() {
    let spec: PropagationSpec = serde_json::from_value(serde_json::json!({})).unwrap();
    assert_eq!(spec.explicit_priority(), 0);
    assert!(!spec.lazy_activation());
    assert!(!spec.preemption_always());
    assert!(!spec.propagate_deps);
    assert!(spec.resource_selectors.is_empty());
}

#[test]
fn test_propagation_spec_camel_case_wire_format() {
    let spec: PropagationSpec = serde_json::from_value(serde_json::json!({
        "resourceSelectors": [
            {"apiVersion": "apps/v1", "kind": "Deployment", "name": "nginx"}
        ],
        "priority": 10,
        "preemption": "Always",
        "activationPreference": "Lazy",
        "schedulerName": "default-scheduler",
        "conflictResolution": "Overwrite",
        "propagateDeps": true,
        "dependentOverrides": ["op1"]
    }))
    .unwrap();

    assert_eq!(spec.explicit_priority(), 10);
    assert!(spec.preemption_always());
    assert!(spec.lazy_activation());
    assert!(spec.propagate_deps);
    assert_eq!(spec.conflict_resolution, Some(ConflictResolution::Overwrite));
    assert_eq!(spec.resource_selectors.len(), 1);
    assert_eq!(spec.resource_selectors[0].name.as_deref(), Some("nginx"));
    assert_eq!(
        spec.dependent_overrides.as_deref(),
        Some(&["op1".to_string()][..])
    );
}

#[test]
fn test_policy_spec_flattens_propagation() {
    // The shared body serializes at the spec's top level, not nested.
    let policy: PropagationPolicySpec = serde_json::from_value(serde_json::json!({
        "priority": 3,
        "placement": {"clusterAffinity": {"clusterNames": ["member1"]}}
    }))
    .unwrap();
    assert_eq!(policy.propagation.explicit_priority(), 3);

    let value = serde_json::to_value(&policy).unwrap();
    assert_eq!(value["priority"], 3);
    assert!(value.get("propagation").is_none());
}

#[test]
fn test_enum_wire_values() {
    assert_eq!(
        serde_json::to_value(PreemptionBehavior::Always).unwrap(),
        serde_json::json!("Always")
    );
    assert_eq!(
        serde_json::to_value(ActivationPreference::Lazy).unwrap(),
        serde_json::json!("Lazy")
    );
    assert_eq!(
        serde_json::to_value(ConflictResolution::Abort).unwrap(),
        serde_json::json!("Abort")
    );
}

#[test]
fn test_binding_spec_round_trip_preserves_clusters() {
    let spec: ResourceBindingSpec = serde_json::from_value(serde_json::json!({
        "resource": {
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "namespace": "default",
            "name": "nginx",
            "uid": "abc-123",
            "resourceVersion": "42"
        },
        "replicas": 3,
        "clusters": [{"name": "member1", "replicas": 3}]
    }))
    .unwrap();

    assert_eq!(spec.binding.replicas, Some(3));
    let clusters = spec.binding.clusters.as_ref().unwrap();
    assert_eq!(clusters[0].name, "member1");

    let value = serde_json::to_value(&spec).unwrap();
    assert_eq!(value["clusters"][0]["name"], "member1");
    assert_eq!(value["resource"]["uid"], "abc-123");
}

#[test]
fn test_permanent_id_reads_scope_specific_label() {
    let mut labels = BTreeMap::new();
    labels.insert(
        PROPAGATION_POLICY_PERMANENT_ID_LABEL.to_string(),
        "pp-id".to_string(),
    );
    let policy = PropagationPolicy {
        metadata: ObjectMeta {
            name: Some("pp1".to_string()),
            namespace: Some("default".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: PropagationPolicySpec {
            propagation: PropagationSpec::default(),
        },
    };
    assert_eq!(policy.permanent_id().as_deref(), Some("pp-id"));

    let mut labels = BTreeMap::new();
    labels.insert(
        CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL.to_string(),
        "cpp-id".to_string(),
    );
    let cluster_policy = ClusterPropagationPolicy {
        metadata: ObjectMeta {
            name: Some("cpp1".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: ClusterPropagationPolicySpec {
            propagation: PropagationSpec::default(),
        },
    };
    assert_eq!(cluster_policy.permanent_id().as_deref(), Some("cpp-id"));

    // Wrong-scope label is not an identity.
    assert_eq!(
        PropagationPolicy {
            metadata: cluster_policy.metadata.clone(),
            spec: PropagationPolicySpec {
                propagation: PropagationSpec::default(),
            },
        }
        .permanent_id(),
        None
    );
}

#[test]
fn test_is_deleting_tracks_deletion_timestamp() {
    let mut policy = PropagationPolicy {
        metadata: ObjectMeta {
            name: Some("pp1".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: PropagationPolicySpec {
            propagation: PropagationSpec::default(),
        },
    };
    assert!(!policy.is_deleting());

    policy.metadata.deletion_timestamp = Some(
        k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::chrono::DateTime::from_timestamp(0, 0).unwrap(),
        ),
    );
    assert!(policy.is_deleting());
}
