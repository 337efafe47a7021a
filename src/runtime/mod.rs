//! Controller runtime: queues, filters, and sync dispatch
//!
//! A [`Controller`] binds informer event sources to a serialized work
//! queue and drives a [`Syncer`] implementation. The runtime guarantees:
//!
//! - syncs for the same key never overlap; an event observed during a
//!   running sync schedules exactly one follow-up run
//! - a sync returning [`Action::Requeue`] is re-run after exponential
//!   backoff (a "synthetic requeue")
//! - a sync returning an error is retried with backoff a bounded number of
//!   times, after which the failure is logged and the key waits for the
//!   next event
//! - the configured initial event is injected once at startup so the
//!   reconciler runs even when its watched object does not exist yet
//! - shutdown cancels the context threaded through in-flight syncs

mod filter;
mod queue;

pub use filter::{Filter, MatchAnything, MatchExactName, MatchSecretsOfType};
pub use queue::WorkQueue;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::informer::SharedInformer;
use crate::Error;

/// Work-queue key identifying the object a sync runs for
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    /// Namespace of the object; empty for cluster-scoped objects
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl Key {
    /// Create a key for the object at (namespace, name)
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The well-known key used by reconcilers that observe a set of
    /// objects rather than a single one
    pub fn singleton() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Outcome of a successful sync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// The sync converged; wait for the next event
    Done,
    /// Synthetic requeue: run again after a backoff even though no error
    /// occurred (e.g. an upstream was observed in a not-yet-valid state)
    Requeue,
}

/// Per-invocation context handed to a [`Syncer`]
pub struct SyncContext {
    /// The queue key this sync runs for
    pub key: Key,
    /// Cancelled when the runtime shuts down; handlers must observe this
    /// at every suspension point
    pub cancel: CancellationToken,
}

/// A reconciler's sync handler
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Drive observed state toward desired state for the context's key
    async fn sync(&self, ctx: &SyncContext) -> Result<Action, Error>;
}

/// A named reconciler bound to its event sources
pub struct Controller {
    name: String,
    syncer: Arc<dyn Syncer>,
    queue: Arc<WorkQueue>,
    initial_event: Option<Key>,
    max_retries: u32,
}

impl Controller {
    /// Create a controller with the given name and sync handler
    pub fn new(name: impl Into<String>, syncer: Arc<dyn Syncer>) -> Self {
        Self {
            name: name.into(),
            syncer,
            queue: Arc::new(WorkQueue::new()),
            initial_event: None,
            max_retries: 3,
        }
    }

    /// Subscribe this controller's queue to an informer through a filter
    pub fn with_informer<K>(
        self,
        informer: &SharedInformer<K>,
        filter: impl Filter<K> + 'static,
    ) -> Self
    where
        K: kube::Resource<DynamicType = ()> + Send + Sync + 'static,
    {
        informer.subscribe(Arc::new(filter), self.queue.clone());
        self
    }

    /// Inject one event for `key` at startup, before any informer delivers
    pub fn with_initial_event(mut self, key: Key) -> Self {
        self.initial_event = Some(key);
        self
    }

    /// Override the bounded retry count for erroring syncs
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The controller's name, used in log events
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run workers until `shutdown` is cancelled
    ///
    /// In-flight syncs observe the cancellation through their
    /// [`SyncContext`] and are drained before this returns.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) {
        let controller = Arc::new(self);
        info!(controller = %controller.name, workers, "starting controller");

        if let Some(key) = controller.initial_event.clone() {
            debug!(controller = %controller.name, %key, "injecting initial event");
            controller.queue.add(key);
        }

        let mut handles = Vec::new();
        for _ in 0..workers.max(1) {
            let controller = Arc::clone(&controller);
            let cancel = shutdown.clone();
            handles.push(tokio::spawn(async move {
                while let Some(key) = controller.queue.get().await {
                    controller.process(key, &cancel).await;
                }
            }));
        }

        shutdown.cancelled().await;
        controller.queue.shut_down();
        for handle in handles {
            let _ = handle.await;
        }
        info!(controller = %controller.name, "controller stopped");
    }

    async fn process(&self, key: Key, cancel: &CancellationToken) {
        let ctx = SyncContext {
            key: key.clone(),
            cancel: cancel.child_token(),
        };

        match self.syncer.sync(&ctx).await {
            Ok(Action::Done) => {
                self.queue.forget(&key);
            }
            Ok(Action::Requeue) => {
                debug!(controller = %self.name, %key, "synthetic requeue");
                self.queue.add_rate_limited(key.clone());
            }
            Err(err) if cancel.is_cancelled() => {
                // A sync interrupted by shutdown is not retried.
                debug!(controller = %self.name, %key, error = %err, "sync cancelled");
                self.queue.forget(&key);
            }
            Err(err) => {
                if self.queue.failures(&key) < self.max_retries {
                    warn!(controller = %self.name, %key, error = %err, "sync failed, will retry");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(
                        controller = %self.name,
                        %key,
                        error = %err,
                        "sync failed too many times, waiting for the next event"
                    );
                    self.queue.forget(&key);
                }
            }
        }

        self.queue.done(&key);
    }
}
