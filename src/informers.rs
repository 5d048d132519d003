// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Dynamic informer management.
//!
//! The detector watches an open-ended set of resource kinds discovered at
//! runtime. For each kind the [`InformerManager`] runs one watch task backed
//! by a reflector store, so reconcilers read templates from memory and fall
//! back to the API server only on cache misses.
//!
//! Raw add/update/delete events are fanned out to a single registered
//! handler; the previous version of an updated object is looked up in the
//! store before the event is applied, so the handler sees `(old, new)` pairs.

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::keys::ClusterWideKey;

/// A raw change observed on some watched kind.
#[derive(Clone, Debug)]
pub enum RawEvent {
    /// Object appeared (including objects seen on the initial list).
    Added(DynamicObject),
    /// Object changed; carries the previously cached version and the new one.
    Updated(Box<DynamicObject>, Box<DynamicObject>),
    /// Object disappeared.
    Deleted(DynamicObject),
}

/// Callback receiving every raw event from every watched kind.
pub type EventHandler = Arc<dyn Fn(RawEvent) + Send + Sync>;

struct WatchEntry {
    resource: ApiResource,
    store: Store<DynamicObject>,
    task: JoinHandle<()>,
}

/// Attaches and owns watches for dynamically discovered resource kinds.
pub struct InformerManager {
    client: Client,
    handler: OnceLock<EventHandler>,
    entries: RwLock<HashMap<String, WatchEntry>>,
}

impl InformerManager {
    /// Create a manager with no watches attached.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            handler: OnceLock::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register the event handler. Must happen before the first
    /// [`for_resource`](Self::for_resource) call; later calls are ignored.
    pub fn set_handler(&self, handler: EventHandler) {
        let _ = self.handler.set(handler);
    }

    /// Whether a watch for the given kind is already attached.
    #[must_use]
    pub fn is_watched(&self, resource: &ApiResource) -> bool {
        self.entries
            .read()
            .expect("informer registry poisoned")
            .contains_key(&gvk_key_of(resource))
    }

    /// Attach a watch for the given kind. Idempotent: re-attaching a watched
    /// kind is a no-op.
    pub fn for_resource(&self, resource: ApiResource) {
        let key = gvk_key_of(&resource);
        let Some(handler) = self.handler.get().cloned() else {
            warn!(resource = %key, "No event handler registered, ignoring watch request");
            return;
        };

        let mut entries = self.entries.write().expect("informer registry poisoned");
        if entries.contains_key(&key) {
            return;
        }

        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let writer = Writer::new(resource.clone());
        let store = writer.as_reader();
        let task = tokio::spawn(run_watch(api, writer, store.clone(), resource.clone(), handler));

        entries.insert(
            key,
            WatchEntry {
                resource,
                store,
                task,
            },
        );
    }

    /// Resolve the discovered [`ApiResource`] for a group-version-kind, if
    /// the kind is watched.
    #[must_use]
    pub fn resource_for(&self, gvk: &GroupVersionKind) -> Option<ApiResource> {
        self.entries
            .read()
            .expect("informer registry poisoned")
            .get(&gvk_key(gvk))
            .map(|entry| entry.resource.clone())
    }

    /// Look up a template in the informer cache.
    #[must_use]
    pub fn get_cached(&self, key: &ClusterWideKey) -> Option<Arc<DynamicObject>> {
        let entries = self.entries.read().expect("informer registry poisoned");
        let entry = entries.get(&gvk_key(&key.gvk()))?;
        entry.store.get(&object_ref(&entry.resource, key))
    }

    /// Abort all watch tasks.
    pub fn shutdown(&self) {
        let entries = self.entries.read().expect("informer registry poisoned");
        for entry in entries.values() {
            entry.task.abort();
        }
    }
}

impl Drop for InformerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build a store lookup key for a cluster-wide key.
fn object_ref(resource: &ApiResource, key: &ClusterWideKey) -> ObjectRef<DynamicObject> {
    let mut reference = ObjectRef::new_with(&key.name, resource.clone());
    if !key.namespace.is_empty() {
        reference = reference.within(&key.namespace);
    }
    reference
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

fn gvk_key_of(resource: &ApiResource) -> String {
    format!("{}/{}/{}", resource.group, resource.version, resource.kind)
}

/// Drive one watch: keep the reflector store current and fan events out to
/// the handler. The watcher re-lists and retries transparently on stream
/// errors.
async fn run_watch(
    api: Api<DynamicObject>,
    mut writer: Writer<DynamicObject>,
    store: Store<DynamicObject>,
    resource: ApiResource,
    handler: EventHandler,
) {
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                match &event {
                    watcher::Event::Apply(object) | watcher::Event::InitApply(object) => {
                        let previous = previous_version(&store, &resource, object);
                        writer.apply_watcher_event(&event);
                        match previous {
                            Some(old) => handler(RawEvent::Updated(
                                Box::new(old),
                                Box::new(object.clone()),
                            )),
                            None => handler(RawEvent::Added(object.clone())),
                        }
                    }
                    watcher::Event::Delete(object) => {
                        writer.apply_watcher_event(&event);
                        handler(RawEvent::Deleted(object.clone()));
                    }
                    watcher::Event::Init | watcher::Event::InitDone => {
                        writer.apply_watcher_event(&event);
                    }
                }
            }
            Err(error) => {
                warn!(
                    kind = %resource.kind,
                    error = %error,
                    "Watch stream error, watcher will re-establish"
                );
            }
        }
    }
    debug!(kind = %resource.kind, "Watch stream ended");
}

/// Fetch the currently cached version of an object, if any.
fn previous_version(
    store: &Store<DynamicObject>,
    resource: &ApiResource,
    object: &DynamicObject,
) -> Option<DynamicObject> {
    let name = object.metadata.name.as_deref()?;
    let mut reference = ObjectRef::new_with(name, resource.clone());
    if let Some(namespace) = object.metadata.namespace.as_deref() {
        reference = reference.within(namespace);
    }
    store.get(&reference).map(|cached| (*cached).clone())
}
