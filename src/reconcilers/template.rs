// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-template reconciliation.
//!
//! For each queued template the reconciler fetches the current version,
//! honors third-party claims, resolves the governing policy (sticky claim
//! first, then matching), and drives claim plus binding upsert. Templates
//! nothing matches land on the waiting list until a policy event pulls them
//! back.

use anyhow::{Context as AnyhowContext, Result};
use kube::api::{Api, DynamicObject, PostParams};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::crd::{
    ClusterPropagationPolicy, ClusterResourceBinding, PolicyObject, PropagationPolicy,
    ResourceBinding,
};
use crate::detector::ResourceDetector;
use crate::keys::{ClusterWideKey, ResourceItem};
use crate::labels::{
    exclude_cluster_policy, label_value, CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION,
    CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL, PROPAGATION_POLICY_NAMESPACE_ANNOTATION,
    PROPAGATION_POLICY_NAME_ANNOTATION, PROPAGATION_POLICY_PERMANENT_ID_LABEL,
    RESOURCE_TEMPLATE_CLAIMED_BY_LABEL,
};
use crate::matcher::highest_priority_policy;
use crate::metrics;
use crate::reconcilers::binding::{create_or_update_binding, OperationResult};
use crate::constants::{
    EVENT_REASON_APPLY_POLICY_FAILED, EVENT_REASON_APPLY_POLICY_SUCCEED,
    KIND_CLUSTER_RESOURCE_BINDING, KIND_RESOURCE_BINDING,
};

impl ResourceDetector {
    /// Full reconciliation for one queued template key. Errors requeue the
    /// key with backoff.
    pub(crate) async fn reconcile_template(&self, item: ResourceItem) -> Result<()> {
        info!(key = %item.key, "Reconciling object");
        let result = self.reconcile_template_inner(&item).await;
        metrics::record_reconciliation("resource-template", result.is_ok());
        result
    }

    async fn reconcile_template_inner(&self, item: &ResourceItem) -> Result<()> {
        let Some(object) = self.get_unstructured_object(&item.key).await? else {
            // Gone. Derived bindings follow via their owner reference.
            self.remove_waiting(&item.key).await;
            return Ok(());
        };

        // A template claimed by another controller is out of bounds for
        // policies.
        if label_value(
            object.metadata.labels.as_ref(),
            RESOURCE_TEMPLATE_CLAIMED_BY_LABEL,
        )
        .is_some()
        {
            self.remove_waiting(&item.key).await;
            return Ok(());
        }

        self.propagate_resource(&object, &item.key, item.change_by_stratus)
            .await
    }

    /// Resolve the governing policy for a template and apply it.
    ///
    /// An existing claim is sticky: the claimed policy is re-applied without
    /// re-matching, so higher-priority newcomers only take over through the
    /// explicit preemption path. Unclaimed templates match namespace-scoped
    /// policies first; cluster-scoped policies are only consulted when no
    /// namespace-scoped policy matches.
    async fn propagate_resource(
        &self,
        object: &DynamicObject,
        key: &ClusterWideKey,
        change_by_stratus: bool,
    ) -> Result<()> {
        let labels = object.metadata.labels.as_ref();
        let annotations = object.metadata.annotations.as_ref();

        let claimed_policy_id = label_value(labels, PROPAGATION_POLICY_PERMANENT_ID_LABEL);
        let claimed_namespace = annotations
            .and_then(|map| map.get(PROPAGATION_POLICY_NAMESPACE_ANNOTATION))
            .map(String::as_str);
        let claimed_name = annotations
            .and_then(|map| map.get(PROPAGATION_POLICY_NAME_ANNOTATION))
            .map(String::as_str);
        if let (Some(_), Some(namespace), Some(name)) =
            (claimed_policy_id, claimed_namespace, claimed_name)
        {
            return self
                .apply_claimed_policy(object, key, change_by_stratus, namespace, name)
                .await;
        }

        let claimed_cluster_id =
            label_value(labels, CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL);
        let claimed_cluster_name = annotations
            .and_then(|map| map.get(CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION))
            .map(String::as_str);
        if let (Some(_), Some(name)) = (claimed_cluster_id, claimed_cluster_name) {
            return self
                .apply_claimed_cluster_policy(object, key, change_by_stratus, name)
                .await;
        }

        if key.is_namespaced() {
            let candidates: Vec<PropagationPolicy> = self
                .list_propagation_policies(&key.namespace)
                .into_iter()
                .filter(|policy| !policy.is_deleting())
                .collect();
            if let Some(policy) = highest_priority_policy(&candidates, object) {
                self.remove_waiting(key).await;
                return self
                    .apply_policy(object, key, change_by_stratus, &policy)
                    .await;
            }
        }

        let candidates: Vec<ClusterPropagationPolicy> = self
            .list_cluster_propagation_policies()
            .into_iter()
            .filter(|policy| !policy.is_deleting())
            .collect();
        if let Some(policy) = highest_priority_policy(&candidates, object) {
            self.remove_waiting(key).await;
            return self
                .apply_cluster_policy(object, key, change_by_stratus, &policy)
                .await;
        }

        debug!(key = %key, "No policy matches, adding to waiting list");
        self.add_waiting(key.clone()).await;
        Ok(())
    }

    /// Re-apply the policy a template is already claimed by. A vanished or
    /// deleting policy is left to its own deletion cleanup, which unclaims
    /// the template.
    async fn apply_claimed_policy(
        &self,
        object: &DynamicObject,
        key: &ClusterWideKey,
        change_by_stratus: bool,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let Some(policy) = self.find_propagation_policy(namespace, name) else {
            debug!(key = %key, policy = %format!("{namespace}/{name}"), "Claimed policy is gone, awaiting cleanup");
            return Ok(());
        };
        if policy.is_deleting() {
            return Ok(());
        }
        self.apply_policy(object, key, change_by_stratus, &policy)
            .await
    }

    /// Cluster-scope analogue of [`apply_claimed_policy`](Self::apply_claimed_policy).
    async fn apply_claimed_cluster_policy(
        &self,
        object: &DynamicObject,
        key: &ClusterWideKey,
        change_by_stratus: bool,
        name: &str,
    ) -> Result<()> {
        let Some(policy) = self.find_cluster_propagation_policy(name) else {
            debug!(key = %key, policy = %name, "Claimed cluster policy is gone, awaiting cleanup");
            return Ok(());
        };
        if policy.is_deleting() {
            return Ok(());
        }
        self.apply_cluster_policy(object, key, change_by_stratus, &policy)
            .await
    }

    /// Propagate a template according to a `PropagationPolicy`: claim it,
    /// then create or refresh the derived `ResourceBinding`.
    pub(crate) async fn apply_policy(
        &self,
        object: &DynamicObject,
        key: &ClusterWideKey,
        change_by_stratus: bool,
        policy: &PropagationPolicy,
    ) -> Result<()> {
        let start = Instant::now();
        let policy_ref = format!(
            "{}/{}",
            policy.namespace().unwrap_or_default(),
            policy.name_any()
        );
        info!(policy = %policy_ref, key = %key, "Applying policy");

        let result = self
            .apply_policy_inner(object, key, change_by_stratus, policy)
            .await;
        metrics::observe_apply_policy_attempt_and_latency(result.is_ok(), start);

        match &result {
            Ok(OperationResult::Unchanged) => {}
            Ok(_) => {
                self.publish_event(
                    object,
                    EventType::Normal,
                    EVENT_REASON_APPLY_POLICY_SUCCEED,
                    format!("Apply policy({policy_ref}) succeed"),
                )
                .await;
            }
            Err(err) => {
                self.publish_event(
                    object,
                    EventType::Warning,
                    EVENT_REASON_APPLY_POLICY_FAILED,
                    format!("Apply policy({policy_ref}) failed: {err:#}"),
                )
                .await;
            }
        }

        result.map(|_| ())
    }

    async fn apply_policy_inner(
        &self,
        object: &DynamicObject,
        key: &ClusterWideKey,
        change_by_stratus: bool,
        policy: &PropagationPolicy,
    ) -> Result<OperationResult> {
        let policy_id = self
            .claim_policy_for_object(object, policy)
            .await
            .with_context(|| format!("claiming policy for object {key}"))?;

        // The claim itself mutates the template; a lazily-activated policy
        // waits for a user edit before the binding follows.
        if change_by_stratus && policy.propagation().lazy_activation() {
            info!(
                key = %key,
                policy = %policy.name_any(),
                "Skip refresh of binding, change originated inside the control plane and policy activation is lazy"
            );
            return Ok(OperationResult::Unchanged);
        }

        let mut policy_labels = BTreeMap::new();
        policy_labels.insert(PROPAGATION_POLICY_PERMANENT_ID_LABEL.to_string(), policy_id);
        let mut policy_annotations = BTreeMap::new();
        policy_annotations.insert(
            PROPAGATION_POLICY_NAMESPACE_ANNOTATION.to_string(),
            policy.namespace().unwrap_or_default(),
        );
        policy_annotations.insert(
            PROPAGATION_POLICY_NAME_ANNOTATION.to_string(),
            policy.name_any(),
        );

        let binding = crate::reconcilers::binding::build_resource_binding(
            self.interpreter.as_ref(),
            object,
            policy_labels,
            policy_annotations,
            policy.propagation(),
        )
        .await
        .with_context(|| format!("building binding for object {key}"))?;
        let owner_uid = object.metadata.uid.clone().unwrap_or_default();
        let api: Api<ResourceBinding> =
            Api::namespaced(self.client.clone(), &key.namespace);

        let operation = create_or_update_binding(
            &api,
            &binding,
            &owner_uid,
            &[CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL],
        )
        .await?;
        self.log_binding_operation(KIND_RESOURCE_BINDING, &binding.name_any(), operation);
        Ok(operation)
    }

    /// Propagate a template according to a `ClusterPropagationPolicy`. A
    /// namespaced template still yields a `ResourceBinding`; only a
    /// cluster-scoped template yields a `ClusterResourceBinding`.
    pub(crate) async fn apply_cluster_policy(
        &self,
        object: &DynamicObject,
        key: &ClusterWideKey,
        change_by_stratus: bool,
        policy: &ClusterPropagationPolicy,
    ) -> Result<()> {
        let start = Instant::now();
        let policy_name = policy.name_any();
        info!(policy = %policy_name, key = %key, "Applying cluster policy");

        let result = self
            .apply_cluster_policy_inner(object, key, change_by_stratus, policy)
            .await;
        metrics::observe_apply_policy_attempt_and_latency(result.is_ok(), start);

        match &result {
            Ok(OperationResult::Unchanged) => {}
            Ok(_) => {
                self.publish_event(
                    object,
                    EventType::Normal,
                    EVENT_REASON_APPLY_POLICY_SUCCEED,
                    format!("Apply cluster policy({policy_name}) succeed"),
                )
                .await;
            }
            Err(err) => {
                self.publish_event(
                    object,
                    EventType::Warning,
                    EVENT_REASON_APPLY_POLICY_FAILED,
                    format!("Apply cluster policy({policy_name}) failed: {err:#}"),
                )
                .await;
            }
        }

        result.map(|_| ())
    }

    async fn apply_cluster_policy_inner(
        &self,
        object: &DynamicObject,
        key: &ClusterWideKey,
        change_by_stratus: bool,
        policy: &ClusterPropagationPolicy,
    ) -> Result<OperationResult> {
        let policy_id = self
            .claim_cluster_policy_for_object(object, policy)
            .await
            .with_context(|| format!("claiming cluster policy for object {key}"))?;

        if change_by_stratus && policy.propagation().lazy_activation() {
            info!(
                key = %key,
                policy = %policy.name_any(),
                "Skip refresh of binding, change originated inside the control plane and policy activation is lazy"
            );
            return Ok(OperationResult::Unchanged);
        }

        let mut policy_labels = BTreeMap::new();
        policy_labels.insert(
            CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL.to_string(),
            policy_id,
        );
        let mut policy_annotations = BTreeMap::new();
        policy_annotations.insert(
            CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION.to_string(),
            policy.name_any(),
        );

        let owner_uid = object.metadata.uid.clone().unwrap_or_default();
        let operation = if key.is_namespaced() {
            let binding = crate::reconcilers::binding::build_resource_binding(
                self.interpreter.as_ref(),
                object,
                policy_labels,
                policy_annotations,
                policy.propagation(),
            )
            .await
            .with_context(|| format!("building binding for object {key}"))?;
            let api: Api<ResourceBinding> =
                Api::namespaced(self.client.clone(), &key.namespace);
            let operation = create_or_update_binding(
                &api,
                &binding,
                &owner_uid,
                &[PROPAGATION_POLICY_PERMANENT_ID_LABEL],
            )
            .await?;
            self.log_binding_operation(KIND_RESOURCE_BINDING, &binding.name_any(), operation);
            operation
        } else {
            let binding = crate::reconcilers::binding::build_cluster_resource_binding(
                self.interpreter.as_ref(),
                object,
                policy_labels,
                policy_annotations,
                policy.propagation(),
            )
            .await
            .with_context(|| format!("building cluster binding for object {key}"))?;
            let api: Api<ClusterResourceBinding> = Api::all(self.client.clone());
            let operation = create_or_update_binding(
                &api,
                &binding,
                &owner_uid,
                &[PROPAGATION_POLICY_PERMANENT_ID_LABEL],
            )
            .await?;
            self.log_binding_operation(
                KIND_CLUSTER_RESOURCE_BINDING,
                &binding.name_any(),
                operation,
            );
            operation
        };

        Ok(operation)
    }

    fn log_binding_operation(&self, kind: &str, name: &str, operation: OperationResult) {
        match operation {
            OperationResult::Created => {
                info!(kind, name, "Created binding");
                metrics::record_binding_operation(kind, "created");
            }
            OperationResult::Updated => {
                info!(kind, name, "Updated binding");
                metrics::record_binding_operation(kind, "updated");
            }
            OperationResult::Unchanged => {
                debug!(kind, name, "Binding is up to date");
            }
        }
    }

    // ------------------------------------------------------------------
    // Claim protocol
    // ------------------------------------------------------------------

    /// Write the identity marks of `policy` onto a template.
    ///
    /// Idempotent: when the template already carries this policy's permanent
    /// id and no cluster-scope claim needs clearing, no write is issued. A
    /// concurrent modification surfaces as a conflict error for the queue to
    /// retry.
    pub(crate) async fn claim_policy_for_object(
        &self,
        object: &DynamicObject,
        policy: &PropagationPolicy,
    ) -> Result<String> {
        let policy_id = policy
            .permanent_id()
            .context("propagation policy has no permanent id")?;

        let mut labels = object.metadata.labels.clone().unwrap_or_default();
        let had_cluster_claim = exclude_cluster_policy(&mut labels);
        if !had_cluster_claim
            && labels.get(PROPAGATION_POLICY_PERMANENT_ID_LABEL) == Some(&policy_id)
        {
            return Ok(policy_id);
        }
        labels.insert(
            PROPAGATION_POLICY_PERMANENT_ID_LABEL.to_string(),
            policy_id.clone(),
        );

        let mut annotations = object.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(
            PROPAGATION_POLICY_NAMESPACE_ANNOTATION.to_string(),
            policy.namespace().unwrap_or_default(),
        );
        annotations.insert(
            PROPAGATION_POLICY_NAME_ANNOTATION.to_string(),
            policy.name_any(),
        );

        let mut updated = object.clone();
        updated.metadata.labels = Some(labels);
        updated.metadata.annotations = Some(annotations);

        let key = ClusterWideKey::from_object(object)?;
        self.dynamic_api(&key)
            .replace(&key.name, &PostParams::default(), &updated)
            .await
            .with_context(|| format!("writing claim onto {key}"))?;
        Ok(policy_id)
    }

    /// Cluster-scope claim: permanent-id label plus the policy-name
    /// annotation. Idempotent on a matching existing claim.
    pub(crate) async fn claim_cluster_policy_for_object(
        &self,
        object: &DynamicObject,
        policy: &ClusterPropagationPolicy,
    ) -> Result<String> {
        let policy_id = policy
            .permanent_id()
            .context("cluster propagation policy has no permanent id")?;

        if label_value(
            object.metadata.labels.as_ref(),
            CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL,
        ) == Some(policy_id.as_str())
        {
            return Ok(policy_id);
        }

        let mut updated = object.clone();
        updated
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(
                CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL.to_string(),
                policy_id.clone(),
            );
        updated
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION.to_string(),
                policy.name_any(),
            );

        let key = ClusterWideKey::from_object(object)?;
        self.dynamic_api(&key)
            .replace(&key.name, &PostParams::default(), &updated)
            .await
            .with_context(|| format!("writing cluster claim onto {key}"))?;
        Ok(policy_id)
    }
}
