// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the Stratus resource detector.
//!
//! This module contains all numeric and string constants used throughout the
//! codebase. Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group for all Stratus CRDs
pub const API_GROUP: &str = "stratus.io";

/// API version for all Stratus CRDs
pub const API_VERSION: &str = "v1alpha1";

/// Fully qualified API version (group/version)
pub const API_GROUP_VERSION: &str = "stratus.io/v1alpha1";

/// Kind name for `PropagationPolicy` resource
pub const KIND_PROPAGATION_POLICY: &str = "PropagationPolicy";

/// Kind name for `ClusterPropagationPolicy` resource
pub const KIND_CLUSTER_PROPAGATION_POLICY: &str = "ClusterPropagationPolicy";

/// Kind name for `ResourceBinding` resource
pub const KIND_RESOURCE_BINDING: &str = "ResourceBinding";

/// Kind name for `ClusterResourceBinding` resource
pub const KIND_CLUSTER_RESOURCE_BINDING: &str = "ClusterResourceBinding";

// ============================================================================
// Reserved Namespaces
// ============================================================================

/// Namespace holding the Stratus control plane itself
pub const RESERVED_NAMESPACE_SYSTEM: &str = "stratus-system";

/// Namespace holding member-cluster registrations
pub const RESERVED_NAMESPACE_CLUSTER: &str = "stratus-cluster";

/// Prefix of the per-cluster execution namespaces
pub const RESERVED_NAMESPACE_EXECUTION_PREFIX: &str = "stratus-es-";

// ============================================================================
// Detector Loop Constants
// ============================================================================

/// Period of the resource discovery loop
pub const DISCOVERY_PERIOD_SECS: u64 = 30;

/// Attempts made by the bounded optimistic-concurrency retry loops used when
/// updating bindings
pub const CONFLICT_RETRY_ATTEMPTS: usize = 5;

/// Default number of concurrent `PropagationPolicy` reconciles
pub const DEFAULT_CONCURRENT_PROPAGATION_POLICY_SYNCS: usize = 1;

/// Default number of concurrent `ClusterPropagationPolicy` reconciles
pub const DEFAULT_CONCURRENT_CLUSTER_PROPAGATION_POLICY_SYNCS: usize = 1;

/// Default number of concurrent resource template reconciles
pub const DEFAULT_CONCURRENT_RESOURCE_TEMPLATE_SYNCS: usize = 5;

/// Default base delay of the per-key exponential backoff (milliseconds)
pub const DEFAULT_RATE_LIMITER_BASE_DELAY_MS: u64 = 5;

/// Default cap of the per-key exponential backoff (seconds)
pub const DEFAULT_RATE_LIMITER_MAX_DELAY_SECS: u64 = 1000;

/// Default sustained dequeue rate of each work queue
pub const DEFAULT_RATE_LIMITER_QPS: f64 = 10.0;

/// Default dequeue burst of each work queue
pub const DEFAULT_RATE_LIMITER_BURST: u32 = 100;

/// Default regex applied to namespaces that should never propagate
pub const DEFAULT_SKIPPED_PROPAGATING_NAMESPACES: &str = "kube-.*";

// ============================================================================
// Event Reasons
// ============================================================================

/// Event reason recorded on a template after a successful policy apply
pub const EVENT_REASON_APPLY_POLICY_SUCCEED: &str = "ApplyPolicySucceed";

/// Event reason recorded on a template after a failed policy apply
pub const EVENT_REASON_APPLY_POLICY_FAILED: &str = "ApplyPolicyFailed";

/// Event reason recorded on a template taken over by a higher-priority policy
pub const EVENT_REASON_PREEMPT_POLICY_SUCCEED: &str = "PreemptPolicySucceed";

/// Event reason recorded on a template a policy failed to take over
pub const EVENT_REASON_PREEMPT_POLICY_FAILED: &str = "PreemptPolicyFailed";

/// Reporter name used when publishing events
pub const EVENT_REPORTER: &str = "stratus-detector";

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Default leader election lease duration (15 seconds)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Default leader election retry period (2 seconds)
pub const DEFAULT_LEASE_RETRY_PERIOD_SECS: u64 = 2;

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

// ============================================================================
// Metrics Server Constants
// ============================================================================

/// Port for Prometheus metrics HTTP server
pub const METRICS_SERVER_PORT: u16 = 8080;

/// Path for Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Bind address for metrics HTTP server
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0";

// ============================================================================
// Kubernetes API Client Constants
// ============================================================================

/// Page size for Kubernetes API list operations.
///
/// Limits each list response to 100 items, keeping memory flat when
/// enumerating large binding sets.
pub const KUBE_LIST_PAGE_SIZE: u32 = 100;
