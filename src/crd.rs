// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions (CRDs) for workload federation.
//!
//! This module defines all Kubernetes Custom Resource Definitions used by the
//! Stratus resource detector to bind workload templates to propagation
//! policies.
//!
//! # Resource Types
//!
//! ## Policies
//!
//! - [`PropagationPolicy`] - Namespace-scoped propagation rule
//! - [`ClusterPropagationPolicy`] - Cluster-scoped variant, also eligible to
//!   match namespaced templates
//! - [`OverridePolicy`] / [`ClusterOverridePolicy`] - Override declarations a
//!   policy may depend on before it takes effect
//!
//! ## Bindings
//!
//! - [`ResourceBinding`] - Scheduling artifact derived from a namespaced
//!   template
//! - [`ClusterResourceBinding`] - Scheduling artifact derived from a
//!   cluster-scoped template
//!
//! # Example: Creating a PropagationPolicy
//!
//! ```rust,no_run
//! use stratus::crd::{Placement, PropagationSpec, ResourceSelector};
//!
//! let spec = PropagationSpec {
//!     resource_selectors: vec![ResourceSelector {
//!         api_version: "apps/v1".to_string(),
//!         kind: "Deployment".to_string(),
//!         namespace: None,
//!         name: Some("nginx".to_string()),
//!         label_selector: None,
//!     }],
//!     placement: Placement::default(),
//!     ..Default::default()
//! };
//! ```

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::{
    CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL, PROPAGATION_POLICY_PERMANENT_ID_LABEL,
};

/// Label selector to match Kubernetes resources.
///
/// A label selector is a label query over a set of resources. The result of
/// matchLabels and matchExpressions are `ANDed`. An empty label selector
/// matches all objects.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Map of {key,value} pairs. A single {key,value} in the matchLabels map
    /// is equivalent to an element of matchExpressions, whose key field is
    /// "key", the operator is "In", and the values array contains only
    /// "value". All requirements must be satisfied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// List of label selector requirements. All requirements must be satisfied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<LabelSelectorRequirement>>,
}

/// A label selector requirement is a selector that contains values, a key,
/// and an operator that relates the key and values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to.
    pub key: String,

    /// Operator represents a key's relationship to a set of values.
    /// Valid operators are In, `NotIn`, Exists and `DoesNotExist`.
    pub operator: String,

    /// An array of string values. If the operator is In or `NotIn`,
    /// the values array must be non-empty. If the operator is Exists or
    /// `DoesNotExist`, the values array must be empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

/// Selects resource templates a policy applies to.
///
/// A selector matches a template when every specified field matches. The
/// `apiVersion` and `kind` fields are mandatory; the rest narrow the match.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// API version of the target resources (e.g., "apps/v1").
    pub api_version: String,

    /// Kind of the target resources (e.g., "Deployment").
    pub kind: String,

    /// Namespace of the target resources. Empty matches any namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of a single target resource. When set, the selector pins exactly
    /// one object and the label selector is ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Label query over target resources. Ignored when `name` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

/// Restricts the clusters a workload may be placed on.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAffinity {
    /// Explicit list of eligible member clusters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_names: Option<Vec<String>>,

    /// Label query over member clusters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    /// Clusters that must never receive the workload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

/// Groups clusters and bounds how widely a workload spreads over the groups.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpreadConstraint {
    /// Cluster field to group by (e.g., "cluster", "region").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_by_field: Option<String>,

    /// Cluster label to group by. Mutually exclusive with `spreadByField`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_by_label: Option<String>,

    /// Maximum number of groups selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_groups: Option<i32>,

    /// Minimum number of groups selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_groups: Option<i32>,
}

/// Controls how replicas divide across selected clusters.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSchedulingStrategy {
    /// "Duplicated" copies the full replica count to every cluster;
    /// "Divided" splits it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_scheduling_type: Option<String>,

    /// How divided replicas are apportioned ("Aggregated" or "Weighted").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_division_preference: Option<String>,
}

/// Where and how a matched workload should land.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// Cluster affinity constraints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_affinity: Option<ClusterAffinity>,

    /// Spread constraints over cluster groups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_constraints: Option<Vec<SpreadConstraint>>,

    /// Replica division strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_scheduling: Option<ReplicaSchedulingStrategy>,
}

/// Conditions gating an automatic application failover.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConditions {
    /// Seconds an application may stay unhealthy before failover triggers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i32>,
}

/// Failover behavior of the application carried by a template.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationFailoverBehavior {
    /// Conditions that must hold before failover triggers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_conditions: Option<DecisionConditions>,

    /// Grace period before the replaced instance is purged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<i32>,

    /// How the evicted workload is purged ("Immediately", "Graciously" or
    /// "Never").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge_mode: Option<String>,
}

/// Failover configuration echoed from policy to binding.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailoverBehavior {
    /// Application-level failover behavior.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationFailoverBehavior>,
}

/// Whether a policy may take templates away from lower-priority policies.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
pub enum PreemptionBehavior {
    /// Never preempt a claim held by another policy.
    #[default]
    Never,
    /// Preempt claims held by lower-priority policies.
    Always,
}

/// When binding refreshes driven by control-plane-originated template changes
/// take effect.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
pub enum ActivationPreference {
    /// Refresh the binding on every template change.
    #[default]
    Immediate,
    /// Suppress binding refreshes for changes made by the control plane
    /// itself; wait for a user edit.
    Lazy,
}

/// How a propagated resource that already exists in a member cluster is
/// handled.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq, JsonSchema)]
pub enum ConflictResolution {
    /// Stop and report the conflict.
    #[default]
    Abort,
    /// Take ownership of the existing resource.
    Overwrite,
}

/// Shared spec of [`PropagationPolicy`] and [`ClusterPropagationPolicy`].
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PropagationSpec {
    /// Templates this policy applies to. An empty list matches nothing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_selectors: Vec<ResourceSelector>,

    /// Explicit priority. Higher wins; defaults to 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Whether this policy preempts claims of lower-priority policies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preemption: Option<PreemptionBehavior>,

    /// Whether binding refreshes are deferred for control-plane-originated
    /// template changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_preference: Option<ActivationPreference>,

    /// Where matched workloads should be placed.
    #[serde(default)]
    pub placement: Placement,

    /// Scheduler responsible for bindings derived from this policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    /// Failover behavior echoed to derived bindings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<FailoverBehavior>,

    /// Conflict handling echoed to derived bindings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictResolution>,

    /// Whether dependencies of matched workloads propagate along with them.
    #[serde(default)]
    pub propagate_deps: bool,

    /// Names of override policies that must exist before this policy takes
    /// effect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependent_overrides: Option<Vec<String>>,
}

impl PropagationSpec {
    /// Explicit priority with the documented default of 0.
    #[must_use]
    pub fn explicit_priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }

    /// Whether lazy activation is configured.
    #[must_use]
    pub fn lazy_activation(&self) -> bool {
        self.activation_preference == Some(ActivationPreference::Lazy)
    }

    /// Whether this policy preempts lower-priority claims.
    #[must_use]
    pub fn preemption_always(&self) -> bool {
        self.preemption == Some(PreemptionBehavior::Always)
    }
}

/// Namespace-scoped rule binding resource templates to a placement.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "stratus.io",
    version = "v1alpha1",
    kind = "PropagationPolicy",
    namespaced,
    shortname = "pp",
    doc = "PropagationPolicy declares which resource templates in its namespace propagate to member clusters and where they land.",
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Preemption","type":"string","jsonPath":".spec.preemption"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PropagationPolicySpec {
    /// Propagation rule body, shared with the cluster-scoped variant.
    #[serde(flatten)]
    pub propagation: PropagationSpec,
}

/// Cluster-scoped rule binding resource templates to a placement.
///
/// Eligible to match cluster-scoped and namespaced templates alike, but only
/// consulted for a template when no `PropagationPolicy` matches it.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "stratus.io",
    version = "v1alpha1",
    kind = "ClusterPropagationPolicy",
    shortname = "cpp",
    doc = "ClusterPropagationPolicy declares which resource templates propagate to member clusters, regardless of namespace.",
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#,
    printcolumn = r#"{"name":"Preemption","type":"string","jsonPath":".spec.preemption"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPropagationPolicySpec {
    /// Propagation rule body, shared with the namespace-scoped variant.
    #[serde(flatten)]
    pub propagation: PropagationSpec,
}

/// Declarative overrides applied before resources reach member clusters.
///
/// The detector only checks presence of these objects (the
/// `dependentOverrides` gate); interpreting the overriders is the override
/// controller's job, so they are carried opaquely here.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "stratus.io",
    version = "v1alpha1",
    kind = "OverridePolicy",
    namespaced,
    shortname = "op",
    doc = "OverridePolicy declares per-cluster mutations applied to propagated resources in its namespace."
)]
#[serde(rename_all = "camelCase")]
pub struct OverridePolicySpec {
    /// Templates the overrides apply to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_selectors: Vec<ResourceSelector>,

    /// Override rules, opaque to the detector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overriders: Option<serde_json::Value>,
}

/// Cluster-scoped variant of [`OverridePolicy`].
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "stratus.io",
    version = "v1alpha1",
    kind = "ClusterOverridePolicy",
    shortname = "cop",
    doc = "ClusterOverridePolicy declares per-cluster mutations applied to propagated resources, regardless of namespace."
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOverridePolicySpec {
    /// Templates the overrides apply to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_selectors: Vec<ResourceSelector>,

    /// Override rules, opaque to the detector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overriders: Option<serde_json::Value>,
}

/// Reference to the resource template a binding was derived from.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referenced template.
    pub api_version: String,

    /// Kind of the referenced template.
    pub kind: String,

    /// Namespace of the referenced template; absent for cluster-scoped ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of the referenced template.
    pub name: String,

    /// UID of the referenced template, captured at binding time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Resource version of the template snapshot the binding reflects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Resources every replica of a workload asks for.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRequirements {
    /// Resource requests per replica, as Kubernetes quantity strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_request: Option<BTreeMap<String, String>>,
}

/// A scheduling decision for one member cluster.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetCluster {
    /// Member cluster name.
    pub name: String,

    /// Replicas assigned to this cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Shared spec of [`ResourceBinding`] and [`ClusterResourceBinding`].
///
/// The `clusters` field is owned by the scheduler; the detector never writes
/// it after the binding exists.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    /// The template this binding was derived from.
    pub resource: ObjectReference,

    /// Total replicas declared by the template, when the resource interpreter
    /// understands its shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Per-replica resource requirements, when interpretable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_requirements: Option<ReplicaRequirements>,

    /// Placement echoed from the governing policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,

    /// Scheduler echoed from the governing policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    /// Failover behavior echoed from the governing policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<FailoverBehavior>,

    /// Conflict handling echoed from the governing policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictResolution>,

    /// Whether dependencies propagate along with the workload.
    #[serde(default)]
    pub propagate_deps: bool,

    /// Scheduling result, written by the scheduler only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clusters: Option<Vec<TargetCluster>>,
}

/// Condition represents an observation of a resource's current state.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g., "Scheduled").
    pub r#type: String,

    /// Condition status ("True", "False", "Unknown").
    pub status: String,

    /// Machine-readable reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 timestamp of the last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Status written by the downstream scheduler, never by the detector.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    /// Scheduling conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last observed by the scheduler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_observed_generation: Option<i64>,
}

/// Scheduling artifact derived from a namespaced resource template.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "stratus.io",
    version = "v1alpha1",
    kind = "ResourceBinding",
    namespaced,
    shortname = "rb",
    doc = "ResourceBinding captures a snapshot of a namespaced resource template and the placement it should follow; the scheduler fills in the target clusters.",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.resource.kind"}"#,
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.resource.name"}"#
)]
#[kube(status = "BindingStatus")]
#[serde(rename_all = "camelCase")]
pub struct ResourceBindingSpec {
    /// Binding body, shared with the cluster-scoped variant.
    #[serde(flatten)]
    pub binding: BindingSpec,
}

/// Scheduling artifact derived from a cluster-scoped resource template.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "stratus.io",
    version = "v1alpha1",
    kind = "ClusterResourceBinding",
    shortname = "crb",
    doc = "ClusterResourceBinding captures a snapshot of a cluster-scoped resource template and the placement it should follow; the scheduler fills in the target clusters.",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.resource.kind"}"#,
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.resource.name"}"#
)]
#[kube(status = "BindingStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceBindingSpec {
    /// Binding body, shared with the namespace-scoped variant.
    #[serde(flatten)]
    pub binding: BindingSpec,
}

/// Shared behavior of the two policy kinds, so matching, claiming and
/// cleanup run through one engine parameterized by scope.
pub trait PolicyObject: kube::ResourceExt {
    /// The shared propagation rule body.
    fn propagation(&self) -> &PropagationSpec;

    /// Stable opaque identity assigned at admission time, carried as a label.
    fn permanent_id(&self) -> Option<String>;

    /// Whether the policy carries a deletion timestamp.
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

impl PolicyObject for PropagationPolicy {
    fn propagation(&self) -> &PropagationSpec {
        &self.spec.propagation
    }

    fn permanent_id(&self) -> Option<String> {
        self.labels()
            .get(PROPAGATION_POLICY_PERMANENT_ID_LABEL)
            .cloned()
    }
}

impl PolicyObject for ClusterPropagationPolicy {
    fn propagation(&self) -> &PropagationSpec {
        &self.spec.propagation
    }

    fn permanent_id(&self) -> Option<String> {
        self.labels()
            .get(CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL)
            .cloned()
    }
}

/// Shared access to the binding body of the two binding kinds.
pub trait BindingObject {
    /// The shared binding body.
    fn binding(&self) -> &BindingSpec;

    /// Mutable access to the shared binding body.
    fn binding_mut(&mut self) -> &mut BindingSpec;
}

impl BindingObject for ResourceBinding {
    fn binding(&self) -> &BindingSpec {
        &self.spec.binding
    }

    fn binding_mut(&mut self) -> &mut BindingSpec {
        &mut self.spec.binding
    }
}

impl BindingObject for ClusterResourceBinding {
    fn binding(&self) -> &BindingSpec {
        &self.spec.binding
    }

    fn binding_mut(&mut self) -> &mut BindingSpec {
        &mut self.spec.binding
    }
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
