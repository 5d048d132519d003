// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The resource detector.
//!
//! [`ResourceDetector`] is the coordination point between three rate-limited
//! queues (resource templates, `PropagationPolicy`, `ClusterPropagationPolicy`),
//! the dynamic informer caches, and the shared waiting list of unmatched
//! templates. The reconcile logic itself lives in [`crate::reconcilers`];
//! this module owns the plumbing: startup wiring, event ingress, cache-first
//! fetches and event publishing.

use anyhow::{Context as AnyhowContext, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference as CoreObjectReference;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;
use crate::constants::EVENT_REPORTER;
use crate::crd::{ClusterPropagationPolicy, PropagationPolicy};
use crate::discovery::discover_resources;
use crate::eventfilter::{event_filter, resource_change_by_stratus, specification_changed};
use crate::informers::{InformerManager, RawEvent};
use crate::interpreter::ResourceInterpreter;
use crate::keys::{ClusterWideKey, ResourceItem};
use crate::metrics;
use crate::waiting::WaitingList;
use crate::worker::AsyncWorker;

/// Watches every propagatable resource kind and reconciles templates against
/// propagation policies, producing bindings for the scheduler.
///
/// Constructed once, started once; read-only after
/// [`start`](ResourceDetector::start).
pub struct ResourceDetector {
    /// Typed and dynamic API access.
    pub client: Client,
    /// Detector configuration, loaded at startup.
    pub config: DetectorConfig,
    /// Knows replica semantics of workload kinds.
    pub interpreter: Arc<dyn ResourceInterpreter>,
    /// Watches for dynamically discovered template kinds.
    pub informers: InformerManager,

    recorder: Recorder,
    waiting: WaitingList,

    template_worker: OnceLock<AsyncWorker<ResourceItem>>,
    policy_worker: OnceLock<AsyncWorker<ClusterWideKey>>,
    cluster_policy_worker: OnceLock<AsyncWorker<ClusterWideKey>>,

    policy_store: OnceLock<Store<PropagationPolicy>>,
    cluster_policy_store: OnceLock<Store<ClusterPropagationPolicy>>,

    // Priorities last seen by the policy reconcilers, keyed by permanent id.
    // A drop between two observations triggers the deprioritized rescan.
    pub(crate) observed_policy_priorities: Mutex<HashMap<String, i32>>,
    pub(crate) observed_cluster_policy_priorities: Mutex<HashMap<String, i32>>,
}

impl ResourceDetector {
    /// Create a detector. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        client: Client,
        config: DetectorConfig,
        interpreter: Arc<dyn ResourceInterpreter>,
    ) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: EVENT_REPORTER.to_string(),
                instance: None,
            },
        );
        Self {
            informers: InformerManager::new(client.clone()),
            client,
            config,
            interpreter,
            recorder,
            waiting: WaitingList::new(),
            template_worker: OnceLock::new(),
            policy_worker: OnceLock::new(),
            cluster_policy_worker: OnceLock::new(),
            policy_store: OnceLock::new(),
            cluster_policy_store: OnceLock::new(),
            observed_policy_priorities: Mutex::new(HashMap::new()),
            observed_cluster_policy_priorities: Mutex::new(HashMap::new()),
        }
    }

    /// Run the detector: start the three worker pools, attach the policy
    /// watches, and drive the resource discovery loop. Never returns under
    /// normal operation.
    ///
    /// # Errors
    ///
    /// Returns an error only when startup wiring fails.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!("Starting resource detector");

        // Template queue.
        let detector = self.clone();
        let template_worker = AsyncWorker::new(
            "resource-template",
            self.config.rate_limiter,
            Arc::new(move |item: ResourceItem| {
                let detector = detector.clone();
                Box::pin(async move { detector.reconcile_template(item).await })
            }),
        );
        template_worker.run(self.config.concurrent_resource_template_syncs);
        self.template_worker
            .set(template_worker)
            .map_err(|_| anyhow::anyhow!("detector started twice"))?;

        // PropagationPolicy queue.
        let detector = self.clone();
        let policy_worker = AsyncWorker::new(
            "propagation-policy",
            self.config.rate_limiter,
            Arc::new(move |key: ClusterWideKey| {
                let detector = detector.clone();
                Box::pin(async move { detector.reconcile_propagation_policy(key).await })
            }),
        );
        policy_worker.run(self.config.concurrent_propagation_policy_syncs);
        self.policy_worker
            .set(policy_worker.clone())
            .map_err(|_| anyhow::anyhow!("detector started twice"))?;

        // ClusterPropagationPolicy queue.
        let detector = self.clone();
        let cluster_policy_worker = AsyncWorker::new(
            "cluster-propagation-policy",
            self.config.rate_limiter,
            Arc::new(move |key: ClusterWideKey| {
                let detector = detector.clone();
                Box::pin(async move { detector.reconcile_cluster_propagation_policy(key).await })
            }),
        );
        cluster_policy_worker.run(self.config.concurrent_cluster_propagation_policy_syncs);
        self.cluster_policy_worker
            .set(cluster_policy_worker.clone())
            .map_err(|_| anyhow::anyhow!("detector started twice"))?;

        // Policy watches feed the policy queues and back the policy listers.
        let policy_store =
            spawn_policy_watch::<PropagationPolicy>(self.client.clone(), policy_worker);
        self.policy_store
            .set(policy_store)
            .map_err(|_| anyhow::anyhow!("detector started twice"))?;

        let cluster_policy_store = spawn_policy_watch::<ClusterPropagationPolicy>(
            self.client.clone(),
            cluster_policy_worker,
        );
        self.cluster_policy_store
            .set(cluster_policy_store)
            .map_err(|_| anyhow::anyhow!("detector started twice"))?;

        // Template events from every discovered kind funnel through here.
        let detector = self.clone();
        self.informers
            .set_handler(Arc::new(move |event| detector.on_event(event)));

        discover_resources(self.clone()).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event ingress
    // ------------------------------------------------------------------

    /// Handle one raw informer event: filter, classify, enqueue.
    fn on_event(&self, event: RawEvent) {
        match event {
            RawEvent::Added(object) => self.enqueue_object(&object, false),
            RawEvent::Deleted(object) => {
                // The reconciler learns of the deletion when its fetch
                // returns not-found.
                self.enqueue_object(&object, false);
            }
            RawEvent::Updated(old, new) => {
                if !specification_changed(&old, &new) {
                    debug!(
                        name = %new.name_any(),
                        "Ignoring update event, specification unchanged"
                    );
                    return;
                }
                let change_by_stratus = resource_change_by_stratus(&old, &new);
                self.enqueue_object(&new, change_by_stratus);
            }
        }
    }

    fn enqueue_object(&self, object: &DynamicObject, change_by_stratus: bool) {
        let key = match ClusterWideKey::from_object(object) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "Dropping event for unkeyable object");
                return;
            }
        };
        if !event_filter(&key, &self.config) {
            return;
        }
        self.enqueue_template(key, change_by_stratus);
    }

    /// Put a template key on the template queue.
    pub(crate) fn enqueue_template(&self, key: ClusterWideKey, change_by_stratus: bool) {
        self.template_worker().add(ResourceItem {
            key,
            change_by_stratus,
        });
    }

    fn template_worker(&self) -> &AsyncWorker<ResourceItem> {
        // Set during start(); reconcilers only run afterwards.
        self.template_worker.get().expect("detector not started")
    }

    /// Put a propagation policy back on its queue.
    pub(crate) fn enqueue_propagation_policy(&self, policy: &PropagationPolicy) {
        if let Some(worker) = self.policy_worker.get() {
            worker.add(policy_key(policy));
        }
    }

    /// Put a cluster propagation policy back on its queue.
    pub(crate) fn enqueue_cluster_propagation_policy(&self, policy: &ClusterPropagationPolicy) {
        if let Some(worker) = self.cluster_policy_worker.get() {
            worker.add(policy_key(policy));
        }
    }

    // ------------------------------------------------------------------
    // Policy listers
    // ------------------------------------------------------------------

    /// All propagation policies in `namespace`, from the watch cache.
    pub(crate) fn list_propagation_policies(&self, namespace: &str) -> Vec<PropagationPolicy> {
        let Some(store) = self.policy_store.get() else {
            return Vec::new();
        };
        store
            .state()
            .iter()
            .filter(|policy| policy.namespace().as_deref() == Some(namespace))
            .map(|policy| (**policy).clone())
            .collect()
    }

    /// All cluster propagation policies, from the watch cache.
    pub(crate) fn list_cluster_propagation_policies(&self) -> Vec<ClusterPropagationPolicy> {
        let Some(store) = self.cluster_policy_store.get() else {
            return Vec::new();
        };
        store.state().iter().map(|policy| (**policy).clone()).collect()
    }

    /// Fetch one propagation policy from the watch cache.
    pub(crate) fn find_propagation_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<PropagationPolicy> {
        let store = self.policy_store.get()?;
        store
            .get(&ObjectRef::new(name).within(namespace))
            .map(|policy| (*policy).clone())
    }

    /// Fetch one cluster propagation policy from the watch cache.
    pub(crate) fn find_cluster_propagation_policy(
        &self,
        name: &str,
    ) -> Option<ClusterPropagationPolicy> {
        let store = self.cluster_policy_store.get()?;
        store.get(&ObjectRef::new(name)).map(|policy| (*policy).clone())
    }

    // ------------------------------------------------------------------
    // Template fetch
    // ------------------------------------------------------------------

    /// Resolve the watched [`ApiResource`] for a key, falling back to the
    /// conventional plural when the kind is not (or no longer) watched.
    pub(crate) fn api_resource_for(&self, key: &ClusterWideKey) -> ApiResource {
        self.informers
            .resource_for(&key.gvk())
            .unwrap_or_else(|| ApiResource::from_gvk(&key.gvk()))
    }

    /// Dynamic API for the kind of `key`, namespaced when the key is.
    pub(crate) fn dynamic_api(&self, key: &ClusterWideKey) -> Api<DynamicObject> {
        let resource = self.api_resource_for(key);
        if key.is_namespaced() {
            Api::namespaced_with(self.client.clone(), &key.namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        }
    }

    /// Fetch a resource template, reading the informer cache first and
    /// falling back to a live read on a miss.
    ///
    /// Cached objects may be shared with other reconcilers; callers must
    /// deep-copy before mutating.
    ///
    /// Returns `Ok(None)` when the object does not exist.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors other than not-found.
    pub(crate) async fn get_unstructured_object(
        &self,
        key: &ClusterWideKey,
    ) -> Result<Option<DynamicObject>> {
        if let Some(cached) = self.informers.get_cached(key) {
            return Ok(Some((*cached).clone()));
        }

        match self.dynamic_api(key).get(&key.name).await {
            Ok(object) => Ok(Some(object)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("fetching object {key}")),
        }
    }

    // ------------------------------------------------------------------
    // Waiting list
    // ------------------------------------------------------------------

    /// Record a template as unmatched.
    pub(crate) async fn add_waiting(&self, key: ClusterWideKey) {
        self.waiting.add(key).await;
        metrics::set_waiting_resources(self.waiting.len().await);
    }

    /// Drop a template from the waiting list, if present.
    pub(crate) async fn remove_waiting(&self, key: &ClusterWideKey) {
        self.waiting.remove(key).await;
        metrics::set_waiting_resources(self.waiting.len().await);
    }

    /// Waiting templates matched by any of `selectors`.
    ///
    /// Holds the waiting-list read lock across the cache fetches so the scan
    /// sees a consistent membership snapshot. Individual fetch misses are
    /// logged and skipped.
    pub(crate) async fn get_matching(
        &self,
        selectors: &[crate::crd::ResourceSelector],
    ) -> Vec<ClusterWideKey> {
        let members = self.waiting.read().await;
        let mut matched = Vec::new();

        for key in members.iter() {
            match self.get_unstructured_object(key).await {
                Ok(Some(object)) => {
                    if crate::matcher::any_selector_matches(selectors, &object) {
                        matched.push(key.clone());
                    }
                }
                Ok(None) => {
                    // Everything on the waiting list should exist.
                    warn!(key = %key, "Waiting object disappeared, skipping");
                }
                Err(err) => {
                    error!(key = %key, error = %format!("{err:#}"), "Failed to fetch waiting object");
                }
            }
        }

        matched
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Publish a Kubernetes event onto a resource template. Failures are
    /// logged, never propagated.
    pub(crate) async fn publish_event(
        &self,
        object: &DynamicObject,
        event_type: EventType,
        reason: &str,
        note: String,
    ) {
        let reference = CoreObjectReference {
            api_version: object.types.as_ref().map(|t| t.api_version.clone()),
            kind: object.types.as_ref().map(|t| t.kind.clone()),
            name: object.metadata.name.clone(),
            namespace: object.metadata.namespace.clone(),
            uid: object.metadata.uid.clone(),
            ..Default::default()
        };
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note),
            action: "ApplyPolicy".to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!(
                reason,
                error = %err,
                "Failed to publish event"
            );
        }
    }
}

/// Whether a kube error is the API's not-found answer.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Whether a kube error is an optimistic-concurrency conflict.
pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// Watch one policy kind: keep a reflector store current and enqueue every
/// added or updated policy. Deletions are not enqueued; the reconciler acts
/// on the deletion timestamp while the finalizer holds the object.
fn spawn_policy_watch<K>(client: Client, worker: AsyncWorker<ClusterWideKey>) -> Store<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(client);
    let (store, mut writer) = reflector::store::<K>();

    tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    writer.apply_watcher_event(&event);
                    match &event {
                        watcher::Event::Apply(policy) | watcher::Event::InitApply(policy) => {
                            worker.add(policy_key(policy));
                        }
                        watcher::Event::Delete(_)
                        | watcher::Event::Init
                        | watcher::Event::InitDone => {}
                    }
                }
                Err(error) => {
                    warn!(
                        kind = %K::kind(&()),
                        error = %error,
                        "Policy watch stream error, watcher will re-establish"
                    );
                }
            }
        }
    });

    store
}

/// Queue key of a typed policy object.
fn policy_key<K: Resource<DynamicType = ()>>(policy: &K) -> ClusterWideKey {
    ClusterWideKey {
        group: K::group(&()).into_owned(),
        version: K::version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        namespace: policy.meta().namespace.clone().unwrap_or_default(),
        name: policy.meta().name.clone().unwrap_or_default(),
    }
}
