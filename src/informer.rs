//! Local object caches hydrated from watch streams
//!
//! A [`SharedInformer`] owns a [`Store`] of the latest observed objects of
//! one resource type and fans events out to subscribed (filter, queue)
//! pairs. Every event is applied to the store *before* any filter sees it,
//! so a sync triggered by an event always observes at least that event's
//! state when reading through the store.
//!
//! In production a driver task feeds the informer from a `kube` watcher
//! stream; unit tests feed events directly through [`SharedInformer::apply`]
//! and [`SharedInformer::delete`].

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event as WatchEvent};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::{Filter, WorkQueue};

/// Identity of an object within one resource type
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    /// Namespace; empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectRef {
    fn from_obj<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

/// An event delivered by an informer
pub enum Event<K> {
    /// The object was observed for the first time
    Added(Arc<K>),
    /// The object changed from `old` to `new`
    Updated {
        /// Previously cached version
        old: Arc<K>,
        /// Newly observed version
        new: Arc<K>,
    },
    /// The object was removed
    Deleted(Arc<K>),
}

/// Read view over an informer's cache
///
/// Cheap to clone; all clones share the same underlying map.
pub struct Store<K> {
    objects: Arc<RwLock<BTreeMap<ObjectRef, Arc<K>>>>,
    last_sync_resource_version: Arc<RwLock<String>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            last_sync_resource_version: Arc::clone(&self.last_sync_resource_version),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            last_sync_resource_version: Arc::new(RwLock::new(String::new())),
        }
    }
}

impl<K> Store<K> {
    /// Get the cached object at (namespace, name), if any
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let objects = self.objects.read().expect("store lock poisoned");
        objects
            .get(&ObjectRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .cloned()
    }

    /// List all cached objects, ordered by (namespace, name)
    pub fn list(&self) -> Vec<Arc<K>> {
        let objects = self.objects.read().expect("store lock poisoned");
        objects.values().cloned().collect()
    }

    /// The resource version of the most recently applied event
    ///
    /// Lets callers wait deterministically until a specific update has
    /// become visible through the store.
    pub fn last_sync_resource_version(&self) -> String {
        self.last_sync_resource_version
            .read()
            .expect("store lock poisoned")
            .clone()
    }
}

struct Subscription<K> {
    filter: Arc<dyn Filter<K>>,
    queue: Arc<WorkQueue>,
}

/// A store plus its event subscribers for one resource type
pub struct SharedInformer<K> {
    store: Store<K>,
    subscriptions: RwLock<Vec<Subscription<K>>>,
}

impl<K> Default for SharedInformer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> SharedInformer<K> {
    /// Create an informer with an empty store and no subscribers
    pub fn new() -> Self {
        Self {
            store: Store::default(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Obtain a read view over the informer's cache
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Register a (filter, queue) pair to receive events
    pub fn subscribe(&self, filter: Arc<dyn Filter<K>>, queue: Arc<WorkQueue>) {
        self.subscriptions
            .write()
            .expect("informer lock poisoned")
            .push(Subscription { filter, queue });
    }
}

impl<K: Resource<DynamicType = ()>> SharedInformer<K> {
    /// Apply an observed object, dispatching an add or update event
    pub fn apply(&self, obj: K) {
        let obj = Arc::new(obj);
        let key = ObjectRef::from_obj(obj.as_ref());
        let previous = {
            let mut objects = self.store.objects.write().expect("store lock poisoned");
            objects.insert(key, Arc::clone(&obj))
        };
        self.record_sync(obj.as_ref());

        match previous {
            Some(old) => self.dispatch(&Event::Updated { old, new: obj }),
            None => self.dispatch(&Event::Added(obj)),
        }
    }

    /// Remove an object, dispatching a delete event
    pub fn delete(&self, obj: K) {
        let obj = Arc::new(obj);
        let key = ObjectRef::from_obj(obj.as_ref());
        {
            let mut objects = self.store.objects.write().expect("store lock poisoned");
            objects.remove(&key);
        }
        self.record_sync(obj.as_ref());
        self.dispatch(&Event::Deleted(obj));
    }

    fn record_sync(&self, obj: &K) {
        if let Some(version) = obj.resource_version() {
            let mut last = self
                .store
                .last_sync_resource_version
                .write()
                .expect("store lock poisoned");
            *last = version;
        }
    }

    fn dispatch(&self, event: &Event<K>) {
        let subscriptions = self.subscriptions.read().expect("informer lock poisoned");
        for sub in subscriptions.iter() {
            let (triggered, current) = match event {
                Event::Added(obj) => (sub.filter.add(obj), obj),
                Event::Updated { old, new } => (sub.filter.update(old, new), new),
                Event::Deleted(obj) => (sub.filter.delete(obj), obj),
            };
            if triggered {
                sub.queue.add(sub.filter.parent(current));
            }
        }
    }
}

/// Feed an informer from a `kube` watch stream until cancelled
///
/// Watch errors are logged and the stream resumes after a short pause; the
/// store keeps serving its last known state in the meantime.
pub async fn run_informer<K>(
    api: Api<K>,
    informer: Arc<SharedInformer<K>>,
    cancel: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut stream = std::pin::pin!(watcher(api, WatcherConfig::default()));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.try_next() => next,
        };
        match next {
            Ok(Some(WatchEvent::Apply(obj)) | Some(WatchEvent::InitApply(obj))) => {
                informer.apply(obj);
            }
            Ok(Some(WatchEvent::Delete(obj))) => informer.delete(obj),
            Ok(Some(WatchEvent::Init)) => debug!("watch stream (re)listing"),
            Ok(Some(WatchEvent::InitDone)) => debug!("watch stream caught up"),
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "watch stream error, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }
}
