// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Detector configuration.
//!
//! All knobs load from environment variables with sensible defaults, so the
//! detector runs unconfigured in development and picks up deployment values
//! from the pod spec in production.

use anyhow::{Context as AnyhowContext, Result};
use kube::discovery::ApiResource;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

use crate::constants::{
    DEFAULT_CONCURRENT_CLUSTER_PROPAGATION_POLICY_SYNCS,
    DEFAULT_CONCURRENT_PROPAGATION_POLICY_SYNCS, DEFAULT_CONCURRENT_RESOURCE_TEMPLATE_SYNCS,
    DEFAULT_SKIPPED_PROPAGATING_NAMESPACES,
};
use crate::worker::RateLimiterOptions;

/// Resource kinds the detector must never watch or propagate.
///
/// Entries disable a whole group (`apps`), a group/version (`apps/v1`), or a
/// single kind (`apps/v1/Deployment`). Core-group entries spell the empty
/// group with a leading slash: `/v1` disables the whole core group-version,
/// `/v1/ConfigMap` a single core kind. Entries are compared field by field
/// against discovered resources, never as formatted strings. The detector's
/// own API group is always disabled so policies and bindings never feed back
/// into the template pipeline.
#[derive(Clone, Debug, Default)]
pub struct SkippedResourceConfig {
    groups: HashSet<String>,
    group_versions: HashSet<(String, String)>,
    group_version_kinds: HashSet<(String, String, String)>,
}

impl SkippedResourceConfig {
    /// Parse a semicolon-separated list of disable entries.
    ///
    /// # Errors
    ///
    /// Returns an error for entries with more than two `/` separators.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut config = Self::default();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let segments: Vec<&str> = entry.split('/').collect();
            match segments.as_slice() {
                [group] => {
                    config.groups.insert((*group).to_string());
                }
                [group, version] => {
                    config
                        .group_versions
                        .insert(((*group).to_string(), (*version).to_string()));
                }
                [group, version, kind] => {
                    config.group_version_kinds.insert((
                        (*group).to_string(),
                        (*version).to_string(),
                        (*kind).to_string(),
                    ));
                }
                _ => anyhow::bail!("invalid skipped resource entry: {entry}"),
            }
        }
        Ok(config)
    }

    /// Disable a whole API group.
    pub fn disable_group(&mut self, group: &str) {
        self.groups.insert(group.to_string());
    }

    /// Whether the given discovered resource is disabled.
    #[must_use]
    pub fn resource_disabled(&self, resource: &ApiResource) -> bool {
        if self.groups.contains(&resource.group) {
            return true;
        }
        if self
            .group_versions
            .contains(&(resource.group.clone(), resource.version.clone()))
        {
            return true;
        }
        self.group_version_kinds.contains(&(
            resource.group.clone(),
            resource.version.clone(),
            resource.kind.clone(),
        ))
    }
}

/// Everything the detector needs to know before starting.
#[derive(Clone)]
pub struct DetectorConfig {
    /// Number of `PropagationPolicy` keys reconciled in parallel.
    pub concurrent_propagation_policy_syncs: usize,
    /// Number of `ClusterPropagationPolicy` keys reconciled in parallel.
    pub concurrent_cluster_propagation_policy_syncs: usize,
    /// Number of resource template keys reconciled in parallel.
    pub concurrent_resource_template_syncs: usize,
    /// Kinds excluded from watching and propagation.
    pub skipped_resources: SkippedResourceConfig,
    /// Namespaces excluded from propagation, as regexes over the namespace
    /// name.
    pub skipped_propagating_namespaces: Vec<Regex>,
    /// Per-key backoff applied by the work queues.
    pub rate_limiter: RateLimiterOptions,
    /// Whether priority-based preemption between policies is active.
    pub policy_preemption_enabled: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let mut skipped_resources = SkippedResourceConfig::default();
        skipped_resources.disable_group(crate::constants::API_GROUP);
        Self {
            concurrent_propagation_policy_syncs: DEFAULT_CONCURRENT_PROPAGATION_POLICY_SYNCS,
            concurrent_cluster_propagation_policy_syncs:
                DEFAULT_CONCURRENT_CLUSTER_PROPAGATION_POLICY_SYNCS,
            concurrent_resource_template_syncs: DEFAULT_CONCURRENT_RESOURCE_TEMPLATE_SYNCS,
            skipped_resources,
            skipped_propagating_namespaces: parse_namespace_regexes(
                DEFAULT_SKIPPED_PROPAGATING_NAMESPACES,
            )
            .unwrap_or_default(),
            rate_limiter: RateLimiterOptions::default(),
            policy_preemption_enabled: false,
        }
    }
}

impl DetectorConfig {
    /// Load configuration from `STRATUS_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns an error when a set variable fails to parse; unset variables
    /// never fail.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = env_usize("STRATUS_CONCURRENT_PROPAGATION_POLICY_SYNCS")? {
            config.concurrent_propagation_policy_syncs = value;
        }
        if let Some(value) = env_usize("STRATUS_CONCURRENT_CLUSTER_PROPAGATION_POLICY_SYNCS")? {
            config.concurrent_cluster_propagation_policy_syncs = value;
        }
        if let Some(value) = env_usize("STRATUS_CONCURRENT_RESOURCE_TEMPLATE_SYNCS")? {
            config.concurrent_resource_template_syncs = value;
        }

        if let Ok(spec) = std::env::var("STRATUS_SKIPPED_RESOURCE_CONFIG") {
            let mut skipped = SkippedResourceConfig::parse(&spec)
                .context("parsing STRATUS_SKIPPED_RESOURCE_CONFIG")?;
            // Own CRDs stay disabled no matter what the operator configures.
            skipped.disable_group(crate::constants::API_GROUP);
            config.skipped_resources = skipped;
        }

        if let Ok(spec) = std::env::var("STRATUS_SKIPPED_PROPAGATING_NAMESPACES") {
            config.skipped_propagating_namespaces = parse_namespace_regexes(&spec)
                .context("parsing STRATUS_SKIPPED_PROPAGATING_NAMESPACES")?;
        }

        if let Some(millis) = env_u64("STRATUS_RATE_LIMITER_BASE_DELAY_MS")? {
            config.rate_limiter.base_delay = Duration::from_millis(millis);
        }
        if let Some(secs) = env_u64("STRATUS_RATE_LIMITER_MAX_DELAY_SECS")? {
            config.rate_limiter.max_delay = Duration::from_secs(secs);
        }
        if let Ok(value) = std::env::var("STRATUS_RATE_LIMITER_QPS") {
            config.rate_limiter.qps = value
                .parse::<f64>()
                .with_context(|| format!("parsing STRATUS_RATE_LIMITER_QPS={value}"))?;
        }
        if let Some(burst) = env_u64("STRATUS_RATE_LIMITER_BURST")? {
            config.rate_limiter.burst =
                u32::try_from(burst).context("STRATUS_RATE_LIMITER_BURST out of range")?;
        }

        if let Ok(value) = std::env::var("STRATUS_FEATURE_POLICY_PREEMPTION") {
            config.policy_preemption_enabled = value.parse::<bool>().unwrap_or_else(|_| {
                warn!(
                    value = %value,
                    "Invalid STRATUS_FEATURE_POLICY_PREEMPTION, defaulting to false"
                );
                false
            });
        }

        Ok(config)
    }

    /// Whether events from `namespace` are excluded by configuration.
    #[must_use]
    pub fn namespace_skipped(&self, namespace: &str) -> bool {
        self.skipped_propagating_namespaces
            .iter()
            .any(|re| re.is_match(namespace))
    }
}

/// Parse a comma-separated list of namespace regexes, anchoring each pattern
/// so `kube-.*` does not match `my-kube-thing`.
fn parse_namespace_regexes(spec: &str) -> Result<Vec<Regex>> {
    spec.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})$"))
                .with_context(|| format!("invalid namespace pattern: {pattern}"))
        })
        .collect()
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .parse::<usize>()
                .with_context(|| format!("parsing {name}={value}"))?;
            anyhow::ensure!(parsed > 0, "{name} must be positive");
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(
            value
                .parse::<u64>()
                .with_context(|| format!("parsing {name}={value}"))?,
        )),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
