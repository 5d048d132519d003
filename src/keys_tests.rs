// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for cluster-wide keys.

use super::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::TypeMeta;

fn object(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(String::from),
            ..Default::default()
        },
        data: serde_json::json!({}),
    }
}

#[test]
fn test_key_from_namespaced_object() {
    let key = ClusterWideKey::from_object(&object("apps/v1", "Deployment", Some("default"), "nginx"))
        .unwrap();
    assert_eq!(key.group, "apps");
    assert_eq!(key.version, "v1");
    assert_eq!(key.kind, "Deployment");
    assert_eq!(key.namespace, "default");
    assert_eq!(key.name, "nginx");
    assert!(key.is_namespaced());
    assert_eq!(key.api_version(), "apps/v1");
}

#[test]
fn test_key_from_core_group_object() {
    let key = ClusterWideKey::from_object(&object("v1", "ConfigMap", Some("default"), "cm1")).unwrap();
    assert_eq!(key.group, "");
    assert_eq!(key.version, "v1");
    assert_eq!(key.api_version(), "v1");
}

#[test]
fn test_key_from_cluster_scoped_object() {
    let key = ClusterWideKey::from_object(&object("v1", "Namespace", None, "prod")).unwrap();
    assert_eq!(key.namespace, "");
    assert!(!key.is_namespaced());
}

#[test]
fn test_key_requires_type_metadata() {
    let mut untyped = object("v1", "ConfigMap", Some("default"), "cm1");
    untyped.types = None;
    assert!(ClusterWideKey::from_object(&untyped).is_err());
}

#[test]
fn test_key_from_object_reference() {
    let reference = ObjectReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        namespace: Some("default".to_string()),
        name: "nginx".to_string(),
        uid: Some("abc".to_string()),
        resource_version: Some("1".to_string()),
    };
    let key = ClusterWideKey::from_object_reference(&reference);
    assert_eq!(key.group, "apps");
    assert_eq!(key.kind, "Deployment");
    assert_eq!(key.namespace, "default");
    assert_eq!(key.name, "nginx");
}

#[test]
fn test_display_formats() {
    let namespaced =
        ClusterWideKey::from_object(&object("apps/v1", "Deployment", Some("default"), "nginx"))
            .unwrap();
    assert_eq!(namespaced.to_string(), "apps/v1, kind=Deployment, default/nginx");

    let cluster_scoped =
        ClusterWideKey::from_object(&object("v1", "Namespace", None, "prod")).unwrap();
    assert_eq!(cluster_scoped.to_string(), "v1, kind=Namespace, prod");
}

#[test]
fn test_resource_item_equality_includes_provenance() {
    let key = ClusterWideKey::from_object(&object("v1", "ConfigMap", Some("default"), "cm1")).unwrap();
    let user_change = ResourceItem {
        key: key.clone(),
        change_by_stratus: false,
    };
    let detector_change = ResourceItem {
        key,
        change_by_stratus: true,
    };
    assert_ne!(user_change, detector_change);
    assert_eq!(user_change, user_change.clone());
}

#[test]
fn test_split_api_version() {
    assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
    assert_eq!(split_api_version("v1"), ("", "v1"));
}
