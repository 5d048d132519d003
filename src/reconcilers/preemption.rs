// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Policy preemption.
//!
//! A policy with `preemption: Always` may take templates away from
//! lower-priority policies of the same scope: the identity marks on the
//! template are overwritten and the template is re-enqueued so its binding
//! follows the new owner.
//!
//! The deprioritized path covers the inverse: when a policy's priority
//! drops, policies whose priority now falls between the old and new value
//! get a chance to preempt. Detection lives in the policy reconciler (via
//! the observed-priority map), so a failed pass retries like any other
//! reconcile step.

use anyhow::{Context as AnyhowContext, Result};
use kube::api::ListParams;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::constants::{EVENT_REASON_PREEMPT_POLICY_FAILED, EVENT_REASON_PREEMPT_POLICY_SUCCEED};
use crate::crd::{BindingObject, ClusterPropagationPolicy, PolicyObject, PropagationPolicy};
use crate::detector::ResourceDetector;
use crate::keys::ClusterWideKey;
use crate::labels::{
    label_value, CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION,
    CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL, PROPAGATION_POLICY_NAMESPACE_ANNOTATION,
    PROPAGATION_POLICY_NAME_ANNOTATION, PROPAGATION_POLICY_PERMANENT_ID_LABEL,
};
use crate::matcher::any_selector_matches;
use crate::reconcilers::cleanup::aggregate_errors;
use crate::reconcilers::pagination::list_all_paginated;

impl ResourceDetector {
    /// Reclaim templates currently held by lower-priority propagation
    /// policies whose selectors this policy also matches.
    pub(crate) async fn handle_propagation_policy_preemption(
        &self,
        policy: &PropagationPolicy,
    ) -> Result<()> {
        let policy_id = policy
            .permanent_id()
            .context("propagation policy has no permanent id")?;
        let namespace = policy.namespace().unwrap_or_default();
        let priority = policy.propagation().explicit_priority();

        let api = kube::Api::<crate::crd::ResourceBinding>::namespaced(
            self.client.clone(),
            &namespace,
        );
        let bindings = list_all_paginated(&api, ListParams::default())
            .await
            .context("listing bindings for preemption")?;

        let mut errors = Vec::new();
        for binding in bindings {
            let labels = binding.meta().labels.as_ref();
            let claimed_id = label_value(labels, PROPAGATION_POLICY_PERMANENT_ID_LABEL);
            match claimed_id {
                None => continue,
                Some(id) if id == policy_id => continue,
                Some(_) => {}
            }

            // Resolve the current claimant to compare priorities.
            let annotations = binding.meta().annotations.as_ref();
            let Some(claimant_namespace) = annotations
                .and_then(|map| map.get(PROPAGATION_POLICY_NAMESPACE_ANNOTATION))
            else {
                continue;
            };
            let Some(claimant_name) =
                annotations.and_then(|map| map.get(PROPAGATION_POLICY_NAME_ANNOTATION))
            else {
                continue;
            };
            let Some(claimant) =
                self.find_propagation_policy(claimant_namespace, claimant_name)
            else {
                continue;
            };
            if claimant.propagation().explicit_priority() >= priority {
                continue;
            }

            let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
            let Some(object) = self.get_unstructured_object(&key).await? else {
                continue;
            };
            if !any_selector_matches(&policy.propagation().resource_selectors, &object) {
                continue;
            }

            match self.claim_policy_for_object(&object, policy).await {
                Ok(_) => {
                    info!(
                        key = %key,
                        policy = %policy.name_any(),
                        preempted = %claimant.name_any(),
                        "Preempted lower-priority policy claim"
                    );
                    self.publish_event(
                        &object,
                        EventType::Normal,
                        EVENT_REASON_PREEMPT_POLICY_SUCCEED,
                        format!(
                            "Policy({namespace}/{}) preempted policy({}/{})",
                            policy.name_any(),
                            claimant_namespace,
                            claimant_name
                        ),
                    )
                    .await;
                    self.enqueue_template(key, true);
                }
                Err(err) => {
                    self.publish_event(
                        &object,
                        EventType::Warning,
                        EVENT_REASON_PREEMPT_POLICY_FAILED,
                        format!(
                            "Policy({namespace}/{}) failed to preempt: {err:#}",
                            policy.name_any()
                        ),
                    )
                    .await;
                    errors.push(err);
                }
            }
        }
        aggregate_errors(errors)
    }

    /// Reclaim templates currently held by lower-priority cluster
    /// propagation policies whose selectors this policy also matches.
    pub(crate) async fn handle_cluster_propagation_policy_preemption(
        &self,
        policy: &ClusterPropagationPolicy,
    ) -> Result<()> {
        let policy_id = policy
            .permanent_id()
            .context("cluster propagation policy has no permanent id")?;
        let priority = policy.propagation().explicit_priority();
        let mut errors = Vec::new();

        let rb_api = kube::Api::<crate::crd::ResourceBinding>::all(self.client.clone());
        let bindings = list_all_paginated(&rb_api, ListParams::default())
            .await
            .context("listing bindings for preemption")?;
        for binding in bindings {
            if let Err(err) = self
                .try_cluster_preempt(policy, &policy_id, priority, &binding)
                .await
            {
                errors.push(err);
            }
        }

        let crb_api = kube::Api::<crate::crd::ClusterResourceBinding>::all(self.client.clone());
        let cluster_bindings = list_all_paginated(&crb_api, ListParams::default())
            .await
            .context("listing cluster bindings for preemption")?;
        for binding in cluster_bindings {
            if let Err(err) = self
                .try_cluster_preempt(policy, &policy_id, priority, &binding)
                .await
            {
                errors.push(err);
            }
        }

        aggregate_errors(errors)
    }

    /// Attempt one cluster-scope preemption against the claimant of
    /// `binding`. Bindings not claimed by a lower-priority cluster policy
    /// are skipped silently.
    async fn try_cluster_preempt<B>(
        &self,
        policy: &ClusterPropagationPolicy,
        policy_id: &str,
        priority: i32,
        binding: &B,
    ) -> Result<()>
    where
        B: BindingObject + kube::Resource,
    {
        let labels = binding.meta().labels.as_ref();
        match label_value(labels, CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL) {
            None => return Ok(()),
            Some(id) if id == policy_id => return Ok(()),
            Some(_) => {}
        }

        let Some(claimant_name) = binding
            .meta()
            .annotations
            .as_ref()
            .and_then(|map| map.get(CLUSTER_PROPAGATION_POLICY_NAME_ANNOTATION))
        else {
            return Ok(());
        };
        let Some(claimant) = self.find_cluster_propagation_policy(claimant_name) else {
            return Ok(());
        };
        if claimant.propagation().explicit_priority() >= priority {
            return Ok(());
        }

        let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
        let Some(object) = self.get_unstructured_object(&key).await? else {
            return Ok(());
        };
        if !any_selector_matches(&policy.propagation().resource_selectors, &object) {
            return Ok(());
        }

        match self.claim_cluster_policy_for_object(&object, policy).await {
            Ok(_) => {
                info!(
                    key = %key,
                    policy = %policy.name_any(),
                    preempted = %claimant.name_any(),
                    "Preempted lower-priority cluster policy claim"
                );
                self.publish_event(
                    &object,
                    EventType::Normal,
                    EVENT_REASON_PREEMPT_POLICY_SUCCEED,
                    format!(
                        "Cluster policy({}) preempted cluster policy({claimant_name})",
                        policy.name_any()
                    ),
                )
                .await;
                self.enqueue_template(key, true);
                Ok(())
            }
            Err(err) => {
                self.publish_event(
                    &object,
                    EventType::Warning,
                    EVENT_REASON_PREEMPT_POLICY_FAILED,
                    format!(
                        "Cluster policy({}) failed to preempt: {err:#}",
                        policy.name_any()
                    ),
                )
                .await;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Deprioritization
    // ------------------------------------------------------------------

    /// A propagation policy's priority dropped: give policies whose priority
    /// now exceeds it a chance to preempt, and re-enqueue the templates it
    /// owns so their state settles.
    pub(crate) async fn handle_deprioritized_propagation_policy(
        &self,
        policy: &PropagationPolicy,
    ) -> Result<()> {
        let policy_id = policy
            .permanent_id()
            .context("propagation policy has no permanent id")?;
        let namespace = policy.namespace().unwrap_or_default();
        let priority = policy.propagation().explicit_priority();
        info!(
            policy = %format!("{namespace}/{}", policy.name_any()),
            priority,
            "Policy deprioritized, rescanning potential preemptors"
        );

        // Preempting policies of now-higher priority re-run their preemption
        // pass through the policy queue.
        for candidate in self.list_propagation_policies(&namespace) {
            if candidate.is_deleting() || !candidate.propagation().preemption_always() {
                continue;
            }
            if candidate.permanent_id().as_deref() == Some(policy_id.as_str()) {
                continue;
            }
            if candidate.propagation().explicit_priority() <= priority {
                continue;
            }
            debug!(candidate = %candidate.name_any(), "Enqueueing potential preemptor");
            self.enqueue_propagation_policy(&candidate);
        }

        let derived = self
            .list_derived_resource_bindings(PROPAGATION_POLICY_PERMANENT_ID_LABEL, &policy_id)
            .await?;
        for binding in &derived {
            let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
            self.enqueue_template(key, true);
        }
        Ok(())
    }

    /// Cluster-scope analogue of
    /// [`handle_deprioritized_propagation_policy`](Self::handle_deprioritized_propagation_policy).
    pub(crate) async fn handle_deprioritized_cluster_propagation_policy(
        &self,
        policy: &ClusterPropagationPolicy,
    ) -> Result<()> {
        let policy_id = policy
            .permanent_id()
            .context("cluster propagation policy has no permanent id")?;
        let priority = policy.propagation().explicit_priority();
        info!(
            policy = %policy.name_any(),
            priority,
            "Cluster policy deprioritized, rescanning potential preemptors"
        );

        for candidate in self.list_cluster_propagation_policies() {
            if candidate.is_deleting() || !candidate.propagation().preemption_always() {
                continue;
            }
            if candidate.permanent_id().as_deref() == Some(policy_id.as_str()) {
                continue;
            }
            if candidate.propagation().explicit_priority() <= priority {
                continue;
            }
            debug!(candidate = %candidate.name_any(), "Enqueueing potential preemptor");
            self.enqueue_cluster_propagation_policy(&candidate);
        }

        let derived = self
            .list_derived_resource_bindings(
                CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL,
                &policy_id,
            )
            .await?;
        for binding in &derived {
            let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
            self.enqueue_template(key, true);
        }
        let derived_cluster = self
            .list_derived_cluster_resource_bindings(&policy_id)
            .await?;
        for binding in &derived_cluster {
            let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
            self.enqueue_template(key, true);
        }
        Ok(())
    }
}
