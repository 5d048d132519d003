// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Waiting list of unmatched resource templates.
//!
//! A template lands here when its most recent reconcile found no matching
//! policy and no third-party claim. Policy reconcilers scan the list on every
//! policy change and pull matching templates back onto the template queue.

use std::collections::HashSet;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::keys::ClusterWideKey;

/// Shared set of templates observed but not yet matched by any policy.
#[derive(Debug, Default)]
pub struct WaitingList {
    objects: RwLock<HashSet<ClusterWideKey>>,
}

impl WaitingList {
    /// Create an empty waiting list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template key to the list.
    pub async fn add(&self, key: ClusterWideKey) {
        let mut objects = self.objects.write().await;
        objects.insert(key.clone());
        debug!(key = %key, length = objects.len(), "Added object to waiting list");
    }

    /// Remove a template key from the list. Removing an absent key is a
    /// no-op.
    pub async fn remove(&self, key: &ClusterWideKey) {
        let mut objects = self.objects.write().await;
        objects.remove(key);
    }

    /// Whether the key is currently waiting.
    pub async fn contains(&self, key: &ClusterWideKey) -> bool {
        self.objects.read().await.contains(key)
    }

    /// Number of waiting templates.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the list is empty.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Take the read lock for the duration of a membership scan.
    ///
    /// Policy reconcilers hold this guard while fetching each member from the
    /// informer caches, so a scan sees a consistent membership snapshot.
    pub async fn read(&self) -> RwLockReadGuard<'_, HashSet<ClusterWideKey>> {
        self.objects.read().await
    }
}

#[cfg(test)]
#[path = "waiting_tests.rs"]
mod waiting_tests;
