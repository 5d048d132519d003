// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the built-in resource interpreter.

use super::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};

fn workload(api_version: &str, kind: &str, spec: serde_json::Value) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some("workload".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: serde_json::json!({ "spec": spec }),
    }
}

#[test]
fn test_hook_enabled_for_builtin_workloads() {
    let interpreter = BuiltinInterpreter;
    for kind in ["Deployment", "StatefulSet", "ReplicaSet"] {
        assert!(interpreter.hook_enabled(
            &GroupVersionKind::gvk("apps", "v1", kind),
            InterpreterOperation::InterpretReplica
        ));
    }
    assert!(interpreter.hook_enabled(
        &GroupVersionKind::gvk("batch", "v1", "Job"),
        InterpreterOperation::InterpretReplica
    ));

    assert!(!interpreter.hook_enabled(
        &GroupVersionKind::gvk("", "v1", "ConfigMap"),
        InterpreterOperation::InterpretReplica
    ));
    assert!(!interpreter.hook_enabled(
        &GroupVersionKind::gvk("apps", "v1beta1", "Deployment"),
        InterpreterOperation::InterpretReplica
    ));
}

#[tokio::test]
async fn test_get_replicas_reads_spec_replicas() {
    let object = workload("apps/v1", "Deployment", serde_json::json!({"replicas": 3}));
    let (replicas, requirements) = BuiltinInterpreter.get_replicas(&object).await.unwrap();
    assert_eq!(replicas, 3);
    assert!(requirements.is_none());
}

#[tokio::test]
async fn test_get_replicas_defaults_to_one() {
    let object = workload("apps/v1", "Deployment", serde_json::json!({}));
    let (replicas, _) = BuiltinInterpreter.get_replicas(&object).await.unwrap();
    assert_eq!(replicas, 1);
}

#[tokio::test]
async fn test_get_replicas_reads_job_parallelism() {
    let object = workload("batch/v1", "Job", serde_json::json!({"parallelism": 4}));
    let (replicas, _) = BuiltinInterpreter.get_replicas(&object).await.unwrap();
    assert_eq!(replicas, 4);
}

#[tokio::test]
async fn test_get_replicas_collects_container_requests() {
    let object = workload(
        "apps/v1",
        "Deployment",
        serde_json::json!({
            "replicas": 2,
            "template": {
                "spec": {
                    "containers": [
                        {"name": "app", "resources": {"requests": {"cpu": "100m", "memory": "128Mi"}}},
                        {"name": "sidecar", "resources": {}}
                    ]
                }
            }
        }),
    );
    let (replicas, requirements) = BuiltinInterpreter.get_replicas(&object).await.unwrap();
    assert_eq!(replicas, 2);
    let request = requirements.unwrap().resource_request.unwrap();
    assert_eq!(request.get("cpu").map(String::as_str), Some("100m"));
    assert_eq!(request.get("memory").map(String::as_str), Some("128Mi"));
}

#[tokio::test]
async fn test_get_replicas_fails_without_spec() {
    let object = DynamicObject {
        types: Some(TypeMeta {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
        }),
        metadata: ObjectMeta::default(),
        data: serde_json::json!({}),
    };
    assert!(BuiltinInterpreter.get_replicas(&object).await.is_err());
}
