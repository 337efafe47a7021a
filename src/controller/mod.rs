//! Reconcilers for the Pinniped control plane
//!
//! - [`upstream_watcher`] - validates LDAPIdentityProvider resources and
//!   publishes the validated set to the upstream cache
//! - [`impersonator`] - drives the impersonation proxy listener, its
//!   load balancer, and its TLS material toward the declared configuration

pub mod impersonator;
pub mod upstream_watcher;

pub use impersonator::ImpersonatorConfigController;
pub use upstream_watcher::LdapUpstreamWatcher;
