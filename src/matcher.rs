// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Policy matching and selection.
//!
//! Given a resource template and a set of candidate policies, the matcher
//! decides which single policy governs the template. Both policy scopes run
//! through the same engine; only the candidate list differs.
//!
//! Selection is deterministic:
//! 1. Explicit priority descending (`spec.priority`, default 0).
//! 2. Implicit specificity descending. A selector that pins a name is more
//!    specific than one that pins only labels, which is more specific than
//!    one that pins only the kind. Each policy scores by the most specific
//!    of its matching selectors.
//! 3. Name lexicographic ascending.
//!
//! Label queries inside a resource selector follow the Kubernetes label
//! selector semantics: `matchLabels` entries and `matchExpressions`
//! requirements are all ANDed, and a selector with neither matches every
//! label set.

use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::warn;

use crate::crd::{LabelSelector, LabelSelectorRequirement, PolicyObject, ResourceSelector};

/// Implicit specificity of a selector that pins a single object by name.
const PRIORITY_MATCH_NAME: i32 = 3;

/// Implicit specificity of a selector that pins objects by labels.
const PRIORITY_MATCH_LABEL_SELECTOR: i32 = 2;

/// Implicit specificity of a selector that pins only the kind.
const PRIORITY_MATCH_ALL: i32 = 1;

/// No match.
const PRIORITY_MISMATCH: i32 = 0;

/// Score how specifically `selector` matches `object`.
///
/// Returns 0 when the selector does not match at all. A selector with a name
/// pins exactly one object and ignores any label selector, mirroring the
/// semantics documented on [`ResourceSelector`].
#[must_use]
pub fn selector_implicit_priority(selector: &ResourceSelector, object: &DynamicObject) -> i32 {
    let Some(types) = object.types.as_ref() else {
        return PRIORITY_MISMATCH;
    };
    if selector.api_version != types.api_version || selector.kind != types.kind {
        return PRIORITY_MISMATCH;
    }
    if let Some(namespace) = selector.namespace.as_deref() {
        if !namespace.is_empty() && object.namespace().as_deref() != Some(namespace) {
            return PRIORITY_MISMATCH;
        }
    }

    match selector.name.as_deref() {
        Some(name) if !name.is_empty() => {
            if object.name_any() == name {
                PRIORITY_MATCH_NAME
            } else {
                PRIORITY_MISMATCH
            }
        }
        _ => match selector.label_selector.as_ref() {
            None => PRIORITY_MATCH_ALL,
            Some(label_selector) => {
                if labels_match(label_selector, object.labels()) {
                    PRIORITY_MATCH_LABEL_SELECTOR
                } else {
                    PRIORITY_MISMATCH
                }
            }
        },
    }
}

/// Whether `selector` matches `object` at all.
#[must_use]
pub fn selector_matches(selector: &ResourceSelector, object: &DynamicObject) -> bool {
    selector_implicit_priority(selector, object) > PRIORITY_MISMATCH
}

/// Whether any of `selectors` matches `object`. An empty list matches
/// nothing.
#[must_use]
pub fn any_selector_matches(selectors: &[ResourceSelector], object: &DynamicObject) -> bool {
    selectors.iter().any(|s| selector_matches(s, object))
}

/// Evaluate a label query against a label set. Every `matchLabels` entry and
/// every `matchExpressions` requirement must hold.
fn labels_match(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .match_labels
        .iter()
        .flatten()
        .all(|(key, value)| labels.get(key) == Some(value))
        && selector
            .match_expressions
            .iter()
            .flatten()
            .all(|requirement| requirement_holds(requirement, labels))
}

/// Evaluate one `matchExpressions` requirement. An operator outside the four
/// the API defines never matches.
fn requirement_holds(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> bool {
    let value = labels.get(&requirement.key);
    let allowed = requirement.values.as_deref().unwrap_or_default();

    match requirement.operator.as_str() {
        "In" => value.is_some_and(|v| allowed.contains(v)),
        "NotIn" => !value.is_some_and(|v| allowed.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        other => {
            warn!(operator = other, "Unsupported label selector operator");
            false
        }
    }
}

/// Score a policy's eligibility for `object` by its most specific matching
/// selector. Returns 0 when no selector matches.
fn policy_implicit_priority<P: PolicyObject>(policy: &P, object: &DynamicObject) -> i32 {
    policy
        .propagation()
        .resource_selectors
        .iter()
        .map(|s| selector_implicit_priority(s, object))
        .max()
        .unwrap_or(PRIORITY_MISMATCH)
}

/// Select the governing policy for `object` among `candidates`.
///
/// Candidates being deleted must already be filtered out by the caller.
/// Returns `None` when no candidate's selectors match the object.
#[must_use]
pub fn highest_priority_policy<P: PolicyObject + Clone>(
    candidates: &[P],
    object: &DynamicObject,
) -> Option<P> {
    let mut best: Option<(&P, i32, i32, String)> = None;

    for candidate in candidates {
        let implicit = policy_implicit_priority(candidate, object);
        if implicit == PRIORITY_MISMATCH {
            continue;
        }
        let explicit = candidate.propagation().explicit_priority();
        let name = candidate.name_any();

        let wins = match &best {
            None => true,
            Some((_, best_explicit, best_implicit, best_name)) => {
                (explicit, implicit) > (*best_explicit, *best_implicit)
                    || ((explicit, implicit) == (*best_explicit, *best_implicit)
                        && name < *best_name)
            }
        };
        if wins {
            best = Some((candidate, explicit, implicit, name));
        }
    }

    best.map(|(policy, _, _, _)| policy.clone())
}

#[cfg(test)]
#[path = "matcher_tests.rs"]
mod matcher_tests;
