//! Thread-safe cache of validated upstream identity providers
//!
//! The cache is written by exactly one reconciler per provider kind and
//! read concurrently by the authentication request path. Publication is
//! whole-snapshot replacement: readers clone an `Arc` to the current
//! snapshot and never observe a partially updated set, and no locks are
//! held while a snapshot is in use.

use std::sync::{Arc, RwLock};

use super::ldap::UpstreamIdentityProvider;

/// Snapshot cache of validated providers, by kind
///
/// LDAP is the only kind today; OIDC and JWT slices live alongside when
/// those reconcilers land. Each reconciler replaces only its own slice.
#[derive(Default)]
pub struct UpstreamCache {
    ldap: RwLock<Arc<Vec<Arc<dyn UpstreamIdentityProvider>>>>,
}

impl UpstreamCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the LDAP provider snapshot wholesale
    pub fn set_ldap_providers(&self, providers: Vec<Arc<dyn UpstreamIdentityProvider>>) {
        let mut slot = self.ldap.write().expect("upstream cache lock poisoned");
        *slot = Arc::new(providers);
    }

    /// The current LDAP provider snapshot
    ///
    /// The returned `Arc` stays valid (and unchanged) for as long as the
    /// caller holds it, regardless of later publications.
    pub fn ldap_providers(&self) -> Arc<Vec<Arc<dyn UpstreamIdentityProvider>>> {
        let slot = self.ldap.read().expect("upstream cache lock poisoned");
        Arc::clone(&slot)
    }
}
