// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-policy reconciliation for both policy scopes.
//!
//! A policy event triggers one pass over everything the policy touches:
//! templates that stopped matching are unclaimed, templates already bound are
//! re-enqueued so non-selector changes (placement, scheduler) reach their
//! bindings, waiting templates that now match are pulled back onto the
//! template queue, and, when enabled, preemption reclaims templates from
//! lower-priority policies. Deletion runs the mark cleanup and then releases
//! the detector finalizer.

use anyhow::{Context as AnyhowContext, Result};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{
    BindingObject, ClusterOverridePolicy, ClusterPropagationPolicy, ClusterResourceBinding,
    OverridePolicy, PolicyObject, PropagationPolicy, ResourceBinding, ResourceSelector,
};
use crate::detector::ResourceDetector;
use crate::keys::ClusterWideKey;
use crate::labels::{
    CLUSTER_PROPAGATION_POLICY_CONTROLLER_FINALIZER, CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
    CLUSTER_PROPAGATION_POLICY_MARKED_LABELS, CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL,
    PROPAGATION_POLICY_CONTROLLER_FINALIZER, PROPAGATION_POLICY_MARKED_ANNOTATIONS,
    PROPAGATION_POLICY_MARKED_LABELS, PROPAGATION_POLICY_PERMANENT_ID_LABEL,
};
use crate::matcher::any_selector_matches;
use crate::metrics;
use crate::reconcilers::cleanup::{aggregate_errors, cleanup_binding_marks};
use crate::reconcilers::pagination::list_all_paginated;

impl ResourceDetector {
    /// Full reconciliation for one queued `PropagationPolicy` key.
    pub(crate) async fn reconcile_propagation_policy(&self, key: ClusterWideKey) -> Result<()> {
        let result = self.reconcile_propagation_policy_inner(&key).await;
        metrics::record_reconciliation("propagation-policy", result.is_ok());
        result
    }

    async fn reconcile_propagation_policy_inner(&self, key: &ClusterWideKey) -> Result<()> {
        let Some(policy) = self.find_propagation_policy(&key.namespace, &key.name) else {
            return Ok(());
        };

        if policy.is_deleting() {
            info!(policy = %key, "PropagationPolicy is being deleted");
            let policy_id = policy.permanent_id().unwrap_or_default();
            self.handle_propagation_policy_deletion(&policy_id).await?;
            self.observed_policy_priorities
                .lock()
                .expect("priority map poisoned")
                .remove(&policy_id);
            let api: Api<PropagationPolicy> =
                Api::namespaced(self.client.clone(), &key.namespace);
            remove_policy_finalizer(&api, &policy, PROPAGATION_POLICY_CONTROLLER_FINALIZER)
                .await?;
            return Ok(());
        }

        info!(policy = %key, "PropagationPolicy has been added or updated");
        self.handle_propagation_policy_creation_or_update(&policy)
            .await
    }

    /// Full reconciliation for one queued `ClusterPropagationPolicy` key.
    pub(crate) async fn reconcile_cluster_propagation_policy(
        &self,
        key: ClusterWideKey,
    ) -> Result<()> {
        let result = self.reconcile_cluster_propagation_policy_inner(&key).await;
        metrics::record_reconciliation("cluster-propagation-policy", result.is_ok());
        result
    }

    async fn reconcile_cluster_propagation_policy_inner(
        &self,
        key: &ClusterWideKey,
    ) -> Result<()> {
        let Some(policy) = self.find_cluster_propagation_policy(&key.name) else {
            return Ok(());
        };

        if policy.is_deleting() {
            info!(policy = %key.name, "ClusterPropagationPolicy is being deleted");
            let policy_id = policy.permanent_id().unwrap_or_default();
            self.handle_cluster_propagation_policy_deletion(&policy_id)
                .await?;
            self.observed_cluster_policy_priorities
                .lock()
                .expect("priority map poisoned")
                .remove(&policy_id);
            let api: Api<ClusterPropagationPolicy> = Api::all(self.client.clone());
            remove_policy_finalizer(
                &api,
                &policy,
                CLUSTER_PROPAGATION_POLICY_CONTROLLER_FINALIZER,
            )
            .await?;
            return Ok(());
        }

        info!(policy = %key.name, "ClusterPropagationPolicy has been added or updated");
        self.handle_cluster_propagation_policy_creation_or_update(&policy)
            .await
    }

    // ------------------------------------------------------------------
    // Deletion paths
    // ------------------------------------------------------------------

    /// Unclaim everything a deleted `PropagationPolicy` touched.
    ///
    /// Marks come off each resource template before its binding: were the
    /// binding cleaned first and the template write failed, the next retry
    /// would no longer list the binding and the template would stay claimed
    /// forever. Bindings themselves persist until their template is gone.
    pub(crate) async fn handle_propagation_policy_deletion(&self, policy_id: &str) -> Result<()> {
        let api: Api<ResourceBinding> = Api::all(self.client.clone());
        let params = ListParams::default()
            .labels(&format!("{PROPAGATION_POLICY_PERMANENT_ID_LABEL}={policy_id}"));
        let bindings = list_all_paginated(&api, params)
            .await
            .context("listing bindings for deleted policy")?;

        let mut errors = Vec::new();
        for binding in bindings {
            if let Err(err) = self
                .cleanup_resource_template_marks(
                    &binding.binding().resource,
                    PROPAGATION_POLICY_MARKED_LABELS,
                    PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                )
                .await
            {
                errors.push(err);
                // The binding keeps its marks so the retry loop lists it
                // again and gets another shot at the template.
                continue;
            }

            let namespace = binding.namespace().unwrap_or_default();
            let namespaced: Api<ResourceBinding> =
                Api::namespaced(self.client.clone(), &namespace);
            if let Err(err) = cleanup_binding_marks(
                &namespaced,
                &binding,
                PROPAGATION_POLICY_MARKED_LABELS,
                PROPAGATION_POLICY_MARKED_ANNOTATIONS,
            )
            .await
            {
                errors.push(err);
            }
        }
        aggregate_errors(errors)
    }

    /// Unclaim everything a deleted `ClusterPropagationPolicy` touched:
    /// cluster bindings and, for the namespaced templates it claimed,
    /// resource bindings.
    pub(crate) async fn handle_cluster_propagation_policy_deletion(
        &self,
        policy_id: &str,
    ) -> Result<()> {
        let selector =
            format!("{CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL}={policy_id}");
        let mut errors = Vec::new();

        let crb_api: Api<ClusterResourceBinding> = Api::all(self.client.clone());
        match list_all_paginated(&crb_api, ListParams::default().labels(&selector)).await {
            Ok(bindings) => {
                for binding in bindings {
                    if let Err(err) = self
                        .cleanup_resource_template_marks(
                            &binding.binding().resource,
                            CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                            CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                        )
                        .await
                    {
                        errors.push(err);
                        continue;
                    }
                    if let Err(err) = cleanup_binding_marks(
                        &crb_api,
                        &binding,
                        CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                        CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                    )
                    .await
                    {
                        errors.push(err);
                    }
                }
            }
            Err(err) => errors.push(err.context("listing cluster bindings for deleted policy")),
        }

        let rb_api: Api<ResourceBinding> = Api::all(self.client.clone());
        match list_all_paginated(&rb_api, ListParams::default().labels(&selector)).await {
            Ok(bindings) => {
                for binding in bindings {
                    if let Err(err) = self
                        .cleanup_resource_template_marks(
                            &binding.binding().resource,
                            CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                            CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                        )
                        .await
                    {
                        errors.push(err);
                        continue;
                    }
                    let namespace = binding.namespace().unwrap_or_default();
                    let namespaced: Api<ResourceBinding> =
                        Api::namespaced(self.client.clone(), &namespace);
                    if let Err(err) = cleanup_binding_marks(
                        &namespaced,
                        &binding,
                        CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                        CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                    )
                    .await
                    {
                        errors.push(err);
                    }
                }
            }
            Err(err) => errors.push(err.context("listing bindings for deleted cluster policy")),
        }

        aggregate_errors(errors)
    }

    // ------------------------------------------------------------------
    // Upsert paths
    // ------------------------------------------------------------------

    /// React to a created or updated `PropagationPolicy`.
    pub(crate) async fn handle_propagation_policy_creation_or_update(
        &self,
        policy: &PropagationPolicy,
    ) -> Result<()> {
        let namespace = policy.namespace().unwrap_or_default();
        let api: Api<PropagationPolicy> = Api::namespaced(self.client.clone(), &namespace);
        ensure_policy_finalizer(&api, policy, PROPAGATION_POLICY_CONTROLLER_FINALIZER).await?;

        let policy_id = policy
            .permanent_id()
            .context("propagation policy has no permanent id")?;
        let selectors = &policy.propagation().resource_selectors;

        // Priority drops are detected here rather than in the event handler,
        // so a failure is retried like any other reconcile step.
        let deprioritized = self.note_observed_priority(
            &self.observed_policy_priorities,
            &policy_id,
            policy.propagation().explicit_priority(),
        );
        if deprioritized && self.config.policy_preemption_enabled {
            self.handle_deprioritized_propagation_policy(policy).await?;
        }

        // Templates that stopped matching get their marks removed so another
        // policy may claim them.
        self.clean_unmatched_resource_bindings(&policy_id, selectors)
            .await?;

        // Non-selector changes (placement, scheduler, failover) reach the
        // bindings by re-enqueueing every template this policy derived.
        let derived = self
            .list_derived_resource_bindings(
                PROPAGATION_POLICY_PERMANENT_ID_LABEL,
                &policy_id,
            )
            .await?;
        for binding in &derived {
            let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
            self.enqueue_template(key, true);
        }

        let matched = self.get_matching(selectors).await;
        info!(
            matched = matched.len(),
            policy = %format!("{namespace}/{}", policy.name_any()),
            "Matched resources in waiting list"
        );

        if !matched.is_empty() {
            self.ensure_dependent_overrides_present(policy).await?;
        }

        for key in matched {
            self.remove_waiting(&key).await;
            self.enqueue_template(key, true);
        }

        if self.config.policy_preemption_enabled && policy.propagation().preemption_always() {
            return self.handle_propagation_policy_preemption(policy).await;
        }

        Ok(())
    }

    /// React to a created or updated `ClusterPropagationPolicy`.
    pub(crate) async fn handle_cluster_propagation_policy_creation_or_update(
        &self,
        policy: &ClusterPropagationPolicy,
    ) -> Result<()> {
        let api: Api<ClusterPropagationPolicy> = Api::all(self.client.clone());
        ensure_policy_finalizer(&api, policy, CLUSTER_PROPAGATION_POLICY_CONTROLLER_FINALIZER)
            .await?;

        let policy_id = policy
            .permanent_id()
            .context("cluster propagation policy has no permanent id")?;
        let selectors = &policy.propagation().resource_selectors;

        let deprioritized = self.note_observed_priority(
            &self.observed_cluster_policy_priorities,
            &policy_id,
            policy.propagation().explicit_priority(),
        );
        if deprioritized && self.config.policy_preemption_enabled {
            self.handle_deprioritized_cluster_propagation_policy(policy)
                .await?;
        }

        self.clean_unmatched_cluster_policy_bindings(&policy_id, selectors)
            .await?;

        let derived_bindings = self
            .list_derived_resource_bindings(
                CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL,
                &policy_id,
            )
            .await?;
        for binding in &derived_bindings {
            let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
            self.enqueue_template(key, true);
        }
        let derived_cluster_bindings = self
            .list_derived_cluster_resource_bindings(&policy_id)
            .await?;
        for binding in &derived_cluster_bindings {
            let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
            self.enqueue_template(key, true);
        }

        let matched = self.get_matching(selectors).await;
        info!(
            matched = matched.len(),
            policy = %policy.name_any(),
            "Matched resources in waiting list"
        );

        if !matched.is_empty() {
            self.ensure_dependent_cluster_overrides_present(policy).await?;
        }

        for key in matched {
            self.remove_waiting(&key).await;
            self.enqueue_template(key, true);
        }

        if self.config.policy_preemption_enabled && policy.propagation().preemption_always() {
            return self
                .handle_cluster_propagation_policy_preemption(policy)
                .await;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared pieces
    // ------------------------------------------------------------------

    /// Record the currently observed priority of a policy; returns whether
    /// the priority dropped since the previous observation.
    fn note_observed_priority(
        &self,
        map: &std::sync::Mutex<std::collections::HashMap<String, i32>>,
        policy_id: &str,
        priority: i32,
    ) -> bool {
        let mut observed = map.lock().expect("priority map poisoned");
        match observed.insert(policy_id.to_string(), priority) {
            Some(previous) => priority < previous,
            None => false,
        }
    }

    /// Strip marks from templates (and their bindings) that a changed
    /// `PropagationPolicy` no longer selects.
    async fn clean_unmatched_resource_bindings(
        &self,
        policy_id: &str,
        selectors: &[ResourceSelector],
    ) -> Result<()> {
        let bindings = self
            .list_derived_resource_bindings(PROPAGATION_POLICY_PERMANENT_ID_LABEL, policy_id)
            .await?;
        let mut errors = Vec::new();

        for binding in bindings {
            if self.binding_still_matches(&binding, selectors).await? {
                continue;
            }
            debug!(
                binding = %binding.name_any(),
                "Template no longer matches policy selectors, removing marks"
            );
            if let Err(err) = self
                .cleanup_resource_template_marks(
                    &binding.binding().resource,
                    PROPAGATION_POLICY_MARKED_LABELS,
                    PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                )
                .await
            {
                errors.push(err);
                continue;
            }
            let namespace = binding.namespace().unwrap_or_default();
            let namespaced: Api<ResourceBinding> =
                Api::namespaced(self.client.clone(), &namespace);
            if let Err(err) = cleanup_binding_marks(
                &namespaced,
                &binding,
                PROPAGATION_POLICY_MARKED_LABELS,
                PROPAGATION_POLICY_MARKED_ANNOTATIONS,
            )
            .await
            {
                errors.push(err);
            }
        }
        aggregate_errors(errors)
    }

    /// Strip marks from templates that a changed `ClusterPropagationPolicy`
    /// no longer selects, across both binding kinds.
    async fn clean_unmatched_cluster_policy_bindings(
        &self,
        policy_id: &str,
        selectors: &[ResourceSelector],
    ) -> Result<()> {
        let mut errors = Vec::new();

        let bindings = self
            .list_derived_resource_bindings(
                CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL,
                policy_id,
            )
            .await?;
        for binding in bindings {
            if self.binding_still_matches(&binding, selectors).await? {
                continue;
            }
            if let Err(err) = self
                .cleanup_resource_template_marks(
                    &binding.binding().resource,
                    CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                    CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                )
                .await
            {
                errors.push(err);
                continue;
            }
            let namespace = binding.namespace().unwrap_or_default();
            let namespaced: Api<ResourceBinding> =
                Api::namespaced(self.client.clone(), &namespace);
            if let Err(err) = cleanup_binding_marks(
                &namespaced,
                &binding,
                CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
            )
            .await
            {
                errors.push(err);
            }
        }

        let cluster_bindings = self.list_derived_cluster_resource_bindings(policy_id).await?;
        let crb_api: Api<ClusterResourceBinding> = Api::all(self.client.clone());
        for binding in cluster_bindings {
            if self.binding_still_matches(&binding, selectors).await? {
                continue;
            }
            if let Err(err) = self
                .cleanup_resource_template_marks(
                    &binding.binding().resource,
                    CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                    CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
                )
                .await
            {
                errors.push(err);
                continue;
            }
            if let Err(err) = cleanup_binding_marks(
                &crb_api,
                &binding,
                CLUSTER_PROPAGATION_POLICY_MARKED_LABELS,
                CLUSTER_PROPAGATION_POLICY_MARKED_ANNOTATIONS,
            )
            .await
            {
                errors.push(err);
            }
        }

        aggregate_errors(errors)
    }

    /// Whether the template a binding references still satisfies the policy
    /// selectors. A vanished template counts as matching; garbage collection
    /// owns it from here.
    async fn binding_still_matches<B: BindingObject>(
        &self,
        binding: &B,
        selectors: &[ResourceSelector],
    ) -> Result<bool> {
        let key = ClusterWideKey::from_object_reference(&binding.binding().resource);
        match self.get_unstructured_object(&key).await? {
            Some(object) => Ok(any_selector_matches(selectors, &object)),
            None => Ok(true),
        }
    }

    /// All `ResourceBinding`s labeled with a policy permanent id.
    pub(crate) async fn list_derived_resource_bindings(
        &self,
        id_label: &str,
        policy_id: &str,
    ) -> Result<Vec<ResourceBinding>> {
        let api: Api<ResourceBinding> = Api::all(self.client.clone());
        list_all_paginated(&api, ListParams::default().labels(&format!("{id_label}={policy_id}")))
            .await
            .context("listing derived bindings")
    }

    /// All `ClusterResourceBinding`s labeled with a cluster policy permanent
    /// id.
    pub(crate) async fn list_derived_cluster_resource_bindings(
        &self,
        policy_id: &str,
    ) -> Result<Vec<ClusterResourceBinding>> {
        let api: Api<ClusterResourceBinding> = Api::all(self.client.clone());
        list_all_paginated(
            &api,
            ListParams::default().labels(&format!(
                "{CLUSTER_PROPAGATION_POLICY_PERMANENT_ID_LABEL}={policy_id}"
            )),
        )
        .await
        .context("listing derived cluster bindings")
    }

    /// Fail the reconcile until every override policy named in
    /// `dependentOverrides` exists, so bindings never materialize before
    /// their overrides.
    async fn ensure_dependent_overrides_present(&self, policy: &PropagationPolicy) -> Result<()> {
        let Some(names) = policy.propagation().dependent_overrides.as_ref() else {
            return Ok(());
        };
        let namespace = policy.namespace().unwrap_or_default();
        let api: Api<OverridePolicy> = Api::namespaced(self.client.clone(), &namespace);
        for name in names {
            if api.get_opt(name).await?.is_none() {
                anyhow::bail!("waiting for dependent override {namespace}/{name}");
            }
        }
        Ok(())
    }

    /// Cluster-scope analogue of
    /// [`ensure_dependent_overrides_present`](Self::ensure_dependent_overrides_present).
    async fn ensure_dependent_cluster_overrides_present(
        &self,
        policy: &ClusterPropagationPolicy,
    ) -> Result<()> {
        let Some(names) = policy.propagation().dependent_overrides.as_ref() else {
            return Ok(());
        };
        let api: Api<ClusterOverridePolicy> = Api::all(self.client.clone());
        for name in names {
            if api.get_opt(name).await?.is_none() {
                anyhow::bail!("waiting for dependent cluster override {name}");
            }
        }
        Ok(())
    }
}

/// Add the detector finalizer to a policy if not already present.
async fn ensure_policy_finalizer<K>(api: &Api<K>, policy: &K, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned,
{
    if policy
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
    {
        return Ok(());
    }

    let name = policy.meta().name.clone().context("policy has no name")?;
    let mut finalizers = policy.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());

    info!(policy = %name, finalizer, "Adding finalizer");
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("adding finalizer to policy {name}"))?;
    Ok(())
}

/// Remove the detector finalizer from a policy once cleanup has finished.
async fn remove_policy_finalizer<K>(api: &Api<K>, policy: &K, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned,
{
    let Some(finalizers) = policy.meta().finalizers.as_ref() else {
        return Ok(());
    };
    if !finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }

    let name = policy.meta().name.clone().context("policy has no name")?;
    let remaining: Vec<String> = finalizers
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();

    info!(policy = %name, finalizer, "Removing finalizer");
    let patch = json!({ "metadata": { "finalizers": remaining } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("removing finalizer from policy {name}"))?;
    Ok(())
}
