// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Cluster-wide object keys.
//!
//! A [`ClusterWideKey`] identifies any object in the cluster independent of
//! the type registry: `(group, version, kind, namespace, name)`. It is the
//! unit of work on the detector's queues, the membership key of the waiting
//! list, and the lookup key into the informer caches.

use anyhow::{bail, Result};
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use std::fmt;

use crate::crd::ObjectReference;

/// Full identity of an object in the cluster.
///
/// `namespace` is empty for cluster-scoped objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterWideKey {
    /// API group; empty for the core group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Object kind.
    pub kind: String,
    /// Namespace; empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ClusterWideKey {
    /// Build a key from a dynamic object observed on a watch.
    ///
    /// # Errors
    ///
    /// Returns an error when the object carries no type information or no
    /// name, which should not happen for objects served by the API.
    pub fn from_object(object: &DynamicObject) -> Result<Self> {
        let Some(types) = object.types.as_ref() else {
            bail!("object has no type metadata");
        };
        let (group, version) = split_api_version(&types.api_version);
        let name = object.name_any();
        if name.is_empty() {
            bail!("object has no name");
        }
        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: types.kind.clone(),
            namespace: object.namespace().unwrap_or_default(),
            name,
        })
    }

    /// Build a key from the template reference carried by a binding.
    pub fn from_object_reference(reference: &ObjectReference) -> Self {
        let (group, version) = split_api_version(&reference.api_version);
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: reference.kind.clone(),
            namespace: reference.namespace.clone().unwrap_or_default(),
            name: reference.name.clone(),
        }
    }

    /// The `group/version` string, or bare version for the core group.
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The group-version-kind triple of this key.
    #[must_use]
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// Whether the keyed object lives in a namespace.
    #[must_use]
    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }
}

impl fmt::Display for ClusterWideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}, kind={}, {}", self.api_version(), self.kind, self.name)
        } else {
            write!(
                f,
                "{}, kind={}, {}/{}",
                self.api_version(),
                self.kind,
                self.namespace,
                self.name
            )
        }
    }
}

/// A unit of work on the template queue.
///
/// Carries the provenance flag alongside the key: `change_by_stratus` is true
/// when the observed change touched only detector-owned labels and
/// annotations, which lazily-activated policies use to skip binding
/// refreshes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceItem {
    /// Identity of the template to reconcile.
    pub key: ClusterWideKey,
    /// Whether the triggering change originated inside the control plane.
    pub change_by_stratus: bool,
}

/// Split an `apiVersion` string into `(group, version)`.
///
/// Core-group objects carry a bare version ("v1"), which maps to an empty
/// group.
#[must_use]
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[cfg(test)]
#[path = "keys_tests.rs"]
mod keys_tests;
