// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for policy matching and selection.

use super::*;
use crate::crd::{
    LabelSelector, LabelSelectorRequirement, PropagationPolicy, PropagationPolicySpec,
    PropagationSpec, ResourceSelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use std::collections::BTreeMap;

fn deployment(name: &str, namespace: &str, labels: &[(&str, &str)]) -> DynamicObject {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        },
        data: serde_json::json!({}),
    }
}

fn kind_selector(kind: &str) -> ResourceSelector {
    ResourceSelector {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        namespace: None,
        name: None,
        label_selector: None,
    }
}

fn name_selector(kind: &str, name: &str) -> ResourceSelector {
    ResourceSelector {
        name: Some(name.to_string()),
        ..kind_selector(kind)
    }
}

fn label_selector(kind: &str, key: &str, value: &str) -> ResourceSelector {
    let mut match_labels = BTreeMap::new();
    match_labels.insert(key.to_string(), value.to_string());
    ResourceSelector {
        label_selector: Some(LabelSelector {
            match_labels: Some(match_labels),
            match_expressions: None,
        }),
        ..kind_selector(kind)
    }
}

fn policy(name: &str, priority: Option<i32>, selectors: Vec<ResourceSelector>) -> PropagationPolicy {
    PropagationPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: PropagationPolicySpec {
            propagation: PropagationSpec {
                resource_selectors: selectors,
                priority,
                ..Default::default()
            },
        },
    }
}

#[test]
fn test_kind_selector_matches() {
    let object = deployment("nginx", "default", &[]);
    assert_eq!(
        selector_implicit_priority(&kind_selector("Deployment"), &object),
        1
    );
    assert_eq!(
        selector_implicit_priority(&kind_selector("StatefulSet"), &object),
        0
    );
}

#[test]
fn test_api_version_must_match() {
    let object = deployment("nginx", "default", &[]);
    let selector = ResourceSelector {
        api_version: "apps/v1beta1".to_string(),
        ..kind_selector("Deployment")
    };
    assert!(!selector_matches(&selector, &object));
}

#[test]
fn test_name_selector_is_most_specific() {
    let object = deployment("nginx", "default", &[("app", "nginx")]);
    assert_eq!(
        selector_implicit_priority(&name_selector("Deployment", "nginx"), &object),
        3
    );
    assert_eq!(
        selector_implicit_priority(&name_selector("Deployment", "other"), &object),
        0
    );
}

#[test]
fn test_name_selector_ignores_label_selector() {
    // A named selector pins one object; labels do not narrow it further.
    let object = deployment("nginx", "default", &[]);
    let mut selector = name_selector("Deployment", "nginx");
    let mut match_labels = BTreeMap::new();
    match_labels.insert("app".to_string(), "absent".to_string());
    selector.label_selector = Some(LabelSelector {
        match_labels: Some(match_labels),
        match_expressions: None,
    });
    assert_eq!(selector_implicit_priority(&selector, &object), 3);
}

#[test]
fn test_label_selector_priority() {
    let object = deployment("nginx", "default", &[("app", "nginx")]);
    assert_eq!(
        selector_implicit_priority(&label_selector("Deployment", "app", "nginx"), &object),
        2
    );
    assert_eq!(
        selector_implicit_priority(&label_selector("Deployment", "app", "redis"), &object),
        0
    );
}

#[test]
fn test_namespace_narrowing() {
    let object = deployment("nginx", "default", &[]);
    let mut selector = kind_selector("Deployment");
    selector.namespace = Some("default".to_string());
    assert!(selector_matches(&selector, &object));
    selector.namespace = Some("other".to_string());
    assert!(!selector_matches(&selector, &object));
}

#[test]
fn test_empty_selector_list_matches_nothing() {
    let object = deployment("nginx", "default", &[]);
    assert!(!any_selector_matches(&[], &object));

    let empty = policy("empty", None, vec![]);
    assert!(highest_priority_policy(&[empty], &object).is_none());
}

#[test]
fn test_explicit_priority_wins() {
    let object = deployment("nginx", "default", &[]);
    let low = policy("low", Some(0), vec![name_selector("Deployment", "nginx")]);
    let high = policy("high", Some(10), vec![kind_selector("Deployment")]);

    // Explicit priority outranks implicit specificity.
    let selected = highest_priority_policy(&[low, high], &object).unwrap();
    assert_eq!(selected.metadata.name.as_deref(), Some("high"));
}

#[test]
fn test_specificity_breaks_priority_ties() {
    let object = deployment("nginx", "default", &[("app", "nginx")]);
    let by_kind = policy("by-kind", None, vec![kind_selector("Deployment")]);
    let by_label = policy(
        "by-label",
        None,
        vec![label_selector("Deployment", "app", "nginx")],
    );
    let by_name = policy("by-name", None, vec![name_selector("Deployment", "nginx")]);

    let selected =
        highest_priority_policy(&[by_kind.clone(), by_label.clone(), by_name], &object).unwrap();
    assert_eq!(selected.metadata.name.as_deref(), Some("by-name"));

    let selected = highest_priority_policy(&[by_kind, by_label], &object).unwrap();
    assert_eq!(selected.metadata.name.as_deref(), Some("by-label"));
}

#[test]
fn test_name_breaks_full_ties() {
    let object = deployment("nginx", "default", &[]);
    let bravo = policy("bravo", None, vec![kind_selector("Deployment")]);
    let alpha = policy("alpha", None, vec![kind_selector("Deployment")]);

    let selected = highest_priority_policy(&[bravo, alpha], &object).unwrap();
    assert_eq!(selected.metadata.name.as_deref(), Some("alpha"));
}

#[test]
fn test_policy_scores_by_most_specific_matching_selector() {
    let object = deployment("nginx", "default", &[]);
    // Second selector does not match; the policy still scores by the first.
    let mixed = policy(
        "mixed",
        None,
        vec![
            name_selector("Deployment", "nginx"),
            kind_selector("StatefulSet"),
        ],
    );
    let broad = policy("broad", None, vec![kind_selector("Deployment")]);

    let selected = highest_priority_policy(&[broad, mixed], &object).unwrap();
    assert_eq!(selected.metadata.name.as_deref(), Some("mixed"));
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn requirement(key: &str, operator: &str, values: Option<&[&str]>) -> LabelSelectorRequirement {
    LabelSelectorRequirement {
        key: key.to_string(),
        operator: operator.to_string(),
        values: values.map(|vs| vs.iter().map(|v| (*v).to_string()).collect()),
    }
}

#[test]
fn test_empty_label_query_matches_any_labels() {
    let query = LabelSelector::default();
    assert!(labels_match(&query, &labels(&[("app", "nginx")])));
    assert!(labels_match(&query, &BTreeMap::new()));
}

#[test]
fn test_match_labels_require_exact_values() {
    let query = LabelSelector {
        match_labels: Some(labels(&[("app", "nginx"), ("tier", "prod")])),
        match_expressions: None,
    };

    assert!(labels_match(
        &query,
        &labels(&[("app", "nginx"), ("tier", "prod"), ("extra", "x")])
    ));
    // Missing key.
    assert!(!labels_match(&query, &labels(&[("app", "nginx")])));
    // Wrong value.
    assert!(!labels_match(
        &query,
        &labels(&[("app", "nginx"), ("tier", "dev")])
    ));
}

#[test]
fn test_in_requirement() {
    let workload = labels(&[("tier", "prod")]);
    assert!(requirement_holds(
        &requirement("tier", "In", Some(&["prod", "staging"])),
        &workload
    ));
    assert!(!requirement_holds(
        &requirement("tier", "In", Some(&["dev"])),
        &workload
    ));
    // Absent key never belongs to the set; neither does any key for an
    // empty set.
    assert!(!requirement_holds(
        &requirement("missing", "In", Some(&["prod"])),
        &workload
    ));
    assert!(!requirement_holds(&requirement("tier", "In", Some(&[])), &workload));
}

#[test]
fn test_not_in_requirement() {
    let workload = labels(&[("tier", "prod")]);
    assert!(requirement_holds(
        &requirement("tier", "NotIn", Some(&["dev"])),
        &workload
    ));
    assert!(!requirement_holds(
        &requirement("tier", "NotIn", Some(&["prod"])),
        &workload
    ));
    // An absent key trivially avoids the set.
    assert!(requirement_holds(
        &requirement("missing", "NotIn", Some(&["prod"])),
        &workload
    ));
}

#[test]
fn test_existence_requirements() {
    let workload = labels(&[("app", "nginx")]);
    assert!(requirement_holds(&requirement("app", "Exists", None), &workload));
    assert!(!requirement_holds(
        &requirement("missing", "Exists", None),
        &workload
    ));
    assert!(requirement_holds(
        &requirement("missing", "DoesNotExist", None),
        &workload
    ));
    assert!(!requirement_holds(
        &requirement("app", "DoesNotExist", None),
        &workload
    ));
}

#[test]
fn test_unknown_operator_never_matches() {
    let workload = labels(&[("app", "nginx")]);
    assert!(!requirement_holds(
        &requirement("app", "Near", Some(&["nginx"])),
        &workload
    ));
}

#[test]
fn test_match_labels_and_expressions_are_anded() {
    let query = LabelSelector {
        match_labels: Some(labels(&[("app", "nginx")])),
        match_expressions: Some(vec![
            requirement("tier", "In", Some(&["prod", "staging"])),
            requirement("deprecated", "DoesNotExist", None),
        ]),
    };

    assert!(labels_match(&query, &labels(&[("app", "nginx"), ("tier", "prod")])));
    // matchLabels half fails.
    assert!(!labels_match(&query, &labels(&[("app", "redis"), ("tier", "prod")])));
    // One expression fails.
    assert!(!labels_match(&query, &labels(&[("app", "nginx"), ("tier", "dev")])));
    assert!(!labels_match(
        &query,
        &labels(&[("app", "nginx"), ("tier", "prod"), ("deprecated", "true")])
    ));
}

#[test]
fn test_match_is_deterministic() {
    let object = deployment("nginx", "default", &[("app", "nginx")]);
    let candidates = vec![
        policy("one", Some(5), vec![kind_selector("Deployment")]),
        policy("two", Some(5), vec![label_selector("Deployment", "app", "nginx")]),
        policy("three", None, vec![name_selector("Deployment", "nginx")]),
    ];

    let first = highest_priority_policy(&candidates, &object).unwrap();
    for _ in 0..10 {
        let again = highest_priority_policy(&candidates, &object).unwrap();
        assert_eq!(first.metadata.name, again.metadata.name);
    }
}
