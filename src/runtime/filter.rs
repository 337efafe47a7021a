//! Event filters mapping informer events onto work-queue keys
//!
//! A filter decides whether an add/update/delete event should trigger a
//! sync, and which queue key the sync runs under. Reconcilers that watch a
//! single well-known object use [`MatchExactName`]; reconcilers that
//! observe a whole set of objects collapse every event onto the singleton
//! key with [`MatchAnything`] or [`MatchSecretsOfType`].

use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};

use super::Key;

/// Gates informer events and assigns them to queue keys
pub trait Filter<K>: Send + Sync {
    /// Whether an add of `obj` should trigger a sync
    fn add(&self, obj: &K) -> bool;
    /// Whether an update from `old` to `new` should trigger a sync
    fn update(&self, old: &K, new: &K) -> bool;
    /// Whether a delete of `obj` should trigger a sync
    fn delete(&self, obj: &K) -> bool;
    /// The queue key a triggering event for `obj` is enqueued under
    fn parent(&self, obj: &K) -> Key;
}

/// Triggers on every event and collapses all of them onto the singleton key
pub struct MatchAnything;

impl<K> Filter<K> for MatchAnything {
    fn add(&self, _obj: &K) -> bool {
        true
    }

    fn update(&self, _old: &K, _new: &K) -> bool {
        true
    }

    fn delete(&self, _obj: &K) -> bool {
        true
    }

    fn parent(&self, _obj: &K) -> Key {
        Key::singleton()
    }
}

/// Triggers only for the object with an exact namespace and name
pub struct MatchExactName {
    namespace: String,
    name: String,
}

impl MatchExactName {
    /// Create a filter matching only the object at (namespace, name)
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn matches<K: Resource<DynamicType = ()>>(&self, obj: &K) -> bool {
        obj.name_any() == self.name && obj.namespace().unwrap_or_default() == self.namespace
    }
}

impl<K: Resource<DynamicType = ()>> Filter<K> for MatchExactName {
    fn add(&self, obj: &K) -> bool {
        self.matches(obj)
    }

    fn update(&self, old: &K, new: &K) -> bool {
        // Either side matching counts, so a rename away from the target
        // still triggers a convergence pass.
        self.matches(old) || self.matches(new)
    }

    fn delete(&self, obj: &K) -> bool {
        self.matches(obj)
    }

    fn parent(&self, _obj: &K) -> Key {
        Key::new(self.namespace.clone(), self.name.clone())
    }
}

/// Triggers for secrets of one type, collapsing onto the singleton key
pub struct MatchSecretsOfType {
    secret_type: String,
}

impl MatchSecretsOfType {
    /// Create a filter matching secrets whose `type` equals `secret_type`
    pub fn new(secret_type: impl Into<String>) -> Self {
        Self {
            secret_type: secret_type.into(),
        }
    }

    fn matches(&self, secret: &Secret) -> bool {
        secret.type_.as_deref() == Some(self.secret_type.as_str())
    }
}

impl Filter<Secret> for MatchSecretsOfType {
    fn add(&self, obj: &Secret) -> bool {
        self.matches(obj)
    }

    fn update(&self, old: &Secret, new: &Secret) -> bool {
        self.matches(old) || self.matches(new)
    }

    fn delete(&self, obj: &Secret) -> bool {
        self.matches(obj)
    }

    fn parent(&self, _obj: &Secret) -> Key {
        Key::singleton()
    }
}
