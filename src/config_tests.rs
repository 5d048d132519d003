// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for detector configuration.

use super::*;
use kube::core::GroupVersionKind;

fn api_resource(group: &str, version: &str, kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

#[test]
fn test_skip_config_parses_all_granularities() {
    let config =
        SkippedResourceConfig::parse("events.k8s.io; apps/v1; batch/v1/CronJob").unwrap();

    assert!(config.resource_disabled(&api_resource("events.k8s.io", "v1", "Event")));
    assert!(config.resource_disabled(&api_resource("apps", "v1", "Deployment")));
    assert!(config.resource_disabled(&api_resource("batch", "v1", "CronJob")));

    assert!(!config.resource_disabled(&api_resource("batch", "v1", "Job")));
    assert!(!config.resource_disabled(&api_resource("apps", "v2", "Deployment")));
}

#[test]
fn test_skip_config_core_group_kind() {
    // Core-group kinds spell the empty group with a leading slash.
    let config = SkippedResourceConfig::parse("/v1/Secret").unwrap();
    assert!(config.resource_disabled(&api_resource("", "v1", "Secret")));
    assert!(!config.resource_disabled(&api_resource("", "v1", "ConfigMap")));
    // A Secret-shaped kind in a named group is a different resource.
    assert!(!config.resource_disabled(&api_resource("v1", "Secret", "x")));
}

#[test]
fn test_skip_config_core_group_version() {
    let config = SkippedResourceConfig::parse("/v1").unwrap();
    assert!(config.resource_disabled(&api_resource("", "v1", "ConfigMap")));
    assert!(config.resource_disabled(&api_resource("", "v1", "Secret")));
    // Not the same as a group literally named "v1".
    assert!(!config.resource_disabled(&api_resource("v1", "v1", "Thing")));
}

#[test]
fn test_skip_config_rejects_malformed_entries() {
    assert!(SkippedResourceConfig::parse("a/b/c/d").is_err());
}

#[test]
fn test_skip_config_ignores_empty_entries() {
    let config = SkippedResourceConfig::parse(" ; apps ;; ").unwrap();
    assert!(config.resource_disabled(&api_resource("apps", "v1", "Deployment")));
}

#[test]
fn test_default_config_disables_own_group() {
    let config = DetectorConfig::default();
    assert!(config
        .skipped_resources
        .resource_disabled(&api_resource("stratus.io", "v1alpha1", "PropagationPolicy")));
}

#[test]
fn test_default_namespace_skip_pattern() {
    let config = DetectorConfig::default();
    assert!(config.namespace_skipped("kube-system"));
    assert!(config.namespace_skipped("kube-public"));
    assert!(!config.namespace_skipped("default"));
    // Patterns are anchored.
    assert!(!config.namespace_skipped("my-kube-system"));
}

#[test]
fn test_namespace_regex_parsing() {
    let patterns = parse_namespace_regexes("kube-.*, test-ns").unwrap();
    assert_eq!(patterns.len(), 2);
    assert!(patterns[1].is_match("test-ns"));
    assert!(!patterns[1].is_match("test-ns-2"));

    assert!(parse_namespace_regexes("valid, [invalid").is_err());
}
