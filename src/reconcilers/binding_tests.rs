// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for binding construction.

use super::*;
use crate::crd::Placement;
use crate::interpreter::BuiltinInterpreter;
use crate::labels::PROPAGATION_POLICY_PERMANENT_ID_LABEL;
use kube::core::TypeMeta;

fn template(
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
    uid: &str,
) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(String::from),
            uid: Some(uid.to_string()),
            resource_version: Some("42".to_string()),
            ..Default::default()
        },
        data: serde_json::json!({"spec": {"replicas": 2}}),
    }
}

fn marks() -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = BTreeMap::new();
    labels.insert(
        PROPAGATION_POLICY_PERMANENT_ID_LABEL.to_string(),
        "id-1".to_string(),
    );
    let annotations = BTreeMap::new();
    (labels, annotations)
}

#[test]
fn test_binding_name_is_deterministic() {
    let first = generate_binding_name("Deployment", "nginx");
    let second = generate_binding_name("Deployment", "nginx");
    assert_eq!(first, second);
    assert!(first.starts_with("nginx-"));
}

#[test]
fn test_binding_name_distinguishes_kinds() {
    // Same template name, different kind: distinct binding names.
    let deployment = generate_binding_name("Deployment", "nginx");
    let statefulset = generate_binding_name("StatefulSet", "nginx");
    assert_ne!(deployment, statefulset);
}

#[test]
fn test_binding_name_sanitizes_rbac_names() {
    let name = generate_binding_name("ClusterRole", "system:node-proxier");
    assert!(!name.contains(':'));
    assert!(name.starts_with("system.node-proxier-"));
}

#[tokio::test]
async fn test_build_resource_binding_shape() {
    let object = template("apps/v1", "Deployment", Some("default"), "nginx", "uid-123");
    let (labels, annotations) = marks();
    let policy_spec = PropagationSpec {
        scheduler_name: Some("default-scheduler".to_string()),
        propagate_deps: true,
        placement: Placement::default(),
        ..Default::default()
    };

    let binding =
        build_resource_binding(&BuiltinInterpreter, &object, labels, annotations, &policy_spec)
            .await
            .unwrap();

    assert_eq!(binding.metadata.namespace.as_deref(), Some("default"));
    assert_eq!(
        binding.metadata.finalizers,
        Some(vec![BINDING_CONTROLLER_FINALIZER.to_string()])
    );

    let owner = &binding.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.uid, "uid-123");
    assert_eq!(owner.kind, "Deployment");
    assert_eq!(owner.api_version, "apps/v1");
    assert_eq!(owner.controller, Some(true));

    let spec = &binding.spec.binding;
    assert_eq!(spec.resource.name, "nginx");
    assert_eq!(spec.resource.uid.as_deref(), Some("uid-123"));
    assert_eq!(spec.resource.resource_version.as_deref(), Some("42"));
    assert_eq!(spec.scheduler_name.as_deref(), Some("default-scheduler"));
    assert!(spec.propagate_deps);
    // The scheduler owns clusters; a fresh binding carries none.
    assert!(spec.clusters.is_none());
    // apps/v1 Deployment is interpretable.
    assert_eq!(spec.replicas, Some(2));
}

#[tokio::test]
async fn test_build_binding_skips_replicas_for_uninterpretable_kinds() {
    let object = template("v1", "ConfigMap", Some("default"), "cm1", "uid-9");
    let (labels, annotations) = marks();

    let binding = build_resource_binding(
        &BuiltinInterpreter,
        &object,
        labels,
        annotations,
        &PropagationSpec::default(),
    )
    .await
    .unwrap();

    assert_eq!(binding.spec.binding.replicas, None);
    assert_eq!(binding.spec.binding.replica_requirements, None);
}

#[tokio::test]
async fn test_cluster_binding_omits_propagate_deps() {
    let object = template("v1", "Namespace", None, "prod", "uid-7");
    let (labels, annotations) = marks();
    let policy_spec = PropagationSpec {
        propagate_deps: true,
        ..Default::default()
    };

    let binding = build_cluster_resource_binding(
        &BuiltinInterpreter,
        &object,
        labels,
        annotations,
        &policy_spec,
    )
    .await
    .unwrap();

    assert_eq!(binding.metadata.namespace, None);
    assert_eq!(
        binding.metadata.finalizers,
        Some(vec![CLUSTER_RESOURCE_BINDING_CONTROLLER_FINALIZER.to_string()])
    );
    assert!(!binding.spec.binding.propagate_deps);
    assert_eq!(binding.spec.binding.resource.namespace, None);
}

#[tokio::test]
async fn test_build_binding_requires_uid() {
    let mut object = template("apps/v1", "Deployment", Some("default"), "nginx", "uid-123");
    object.metadata.uid = None;
    let (labels, annotations) = marks();

    let result = build_resource_binding(
        &BuiltinInterpreter,
        &object,
        labels,
        annotations,
        &PropagationSpec::default(),
    )
    .await;
    assert!(result.is_err());
}

#[test]
fn test_controller_of_finds_controller_reference() {
    let mut binding = ResourceBinding {
        metadata: ObjectMeta {
            name: Some("nginx-abc".to_string()),
            owner_references: Some(vec![
                OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Helper".to_string(),
                    name: "not-controller".to_string(),
                    uid: "other".to_string(),
                    ..Default::default()
                },
                OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "nginx".to_string(),
                    uid: "uid-123".to_string(),
                    controller: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        },
        spec: ResourceBindingSpec {
            binding: BindingSpec::default(),
        },
        status: None,
    };

    assert_eq!(controller_of(&binding).unwrap().uid, "uid-123");

    binding.metadata.owner_references = None;
    assert!(controller_of(&binding).is_none());
}
