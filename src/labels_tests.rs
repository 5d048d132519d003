// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for mark and metadata helpers.

use super::*;

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn test_dedupe_and_merge_allocates_missing_map() {
    let mut target = None;
    dedupe_and_merge(&mut target, &map(&[("a", "1")]));
    assert_eq!(target, Some(map(&[("a", "1")])));
}

#[test]
fn test_dedupe_and_merge_overwrites_on_key_collision() {
    let mut target = Some(map(&[("a", "old"), ("keep", "x")]));
    dedupe_and_merge(&mut target, &map(&[("a", "new")]));
    assert_eq!(target, Some(map(&[("a", "new"), ("keep", "x")])));
}

#[test]
fn test_dedupe_and_merge_empty_additions_is_noop() {
    let mut target = None;
    dedupe_and_merge(&mut target, &BTreeMap::new());
    assert_eq!(target, None);
}

#[test]
fn test_remove_marks_strips_labels_and_annotations() {
    let mut meta = ObjectMeta {
        labels: Some(map(&[
            (PROPAGATION_POLICY_PERMANENT_ID_LABEL, "id-1"),
            ("app", "nginx"),
        ])),
        annotations: Some(map(&[
            (PROPAGATION_POLICY_NAMESPACE_ANNOTATION, "default"),
            (PROPAGATION_POLICY_NAME_ANNOTATION, "pp1"),
            ("note", "keep"),
        ])),
        ..Default::default()
    };

    remove_marks(
        &mut meta,
        PROPAGATION_POLICY_MARKED_LABELS,
        PROPAGATION_POLICY_MARKED_ANNOTATIONS,
    );

    assert_eq!(meta.labels, Some(map(&[("app", "nginx")])));
    assert_eq!(meta.annotations, Some(map(&[("note", "keep")])));
}

#[test]
fn test_remove_marks_collapses_empty_maps() {
    let mut meta = ObjectMeta {
        labels: Some(map(&[(PROPAGATION_POLICY_PERMANENT_ID_LABEL, "id-1")])),
        annotations: Some(map(&[(
            CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION,
            "cpp1",
        )])),
        ..Default::default()
    };

    remove_marks(
        &mut meta,
        PROPAGATION_POLICY_MARKED_LABELS,
        CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
    );

    assert_eq!(meta.labels, None);
    assert_eq!(meta.annotations, None);
}

#[test]
fn test_remove_marks_on_bare_metadata() {
    let mut meta = ObjectMeta::default();
    remove_marks(
        &mut meta,
        PROPAGATION_POLICY_MARKED_LABELS,
        PROPAGATION_POLICY_MARKED_ANNOTATIONS,
    );
    assert_eq!(meta.labels, None);
}

#[test]
fn test_exclude_cluster_policy() {
    let mut labels = map(&[
        (CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL, "id-9"),
        ("app", "nginx"),
    ]);
    assert!(exclude_cluster_policy(&mut labels));
    assert!(!labels.contains_key(CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL));

    // Absent label: nothing removed.
    assert!(!exclude_cluster_policy(&mut labels));
}

#[test]
fn test_label_value() {
    let labels = map(&[("a", "1")]);
    assert_eq!(label_value(Some(&labels), "a"), Some("1"));
    assert_eq!(label_value(Some(&labels), "b"), None);
    assert_eq!(label_value(None, "a"), None);
}
