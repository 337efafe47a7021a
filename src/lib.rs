//! Pinniped - authentication and identity brokerage for Kubernetes
//!
//! Pinniped brokers cluster authentication against external identity
//! providers. This crate holds the reconciling control plane: controllers
//! that watch declaratively-defined identity-provider and
//! impersonator-configuration resources and drive the running
//! authentication data plane into agreement with them.
//!
//! # Architecture
//!
//! Watch streams hydrate local informer caches; informers push filtered
//! events onto per-controller work queues; workers invoke sync handlers
//! that converge observed state toward declared state. The LDAP upstream
//! watcher publishes validated providers into a snapshot cache read by
//! the login path; the impersonator controller owns a TLS proxy
//! listener plus its cluster-side Service and Secret.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (LDAPIdentityProvider)
//! - [`runtime`] - controller runtime: work queues, filters, dispatch
//! - [`informer`] - local caches hydrated from watch streams
//! - [`kube_client`] - typed object-store client capabilities
//! - [`controller`] - the reconcilers themselves
//! - [`upstream`] - LDAP provider config, dialing, and the validated-IDP cache
//! - [`impersonator`] - impersonation proxy config and TLS listener plumbing
//! - [`pki`] - in-process CA issuing the proxy's serving certificates
//! - [`error`] - error types for the control plane

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod impersonator;
pub mod informer;
pub mod kube_client;
pub mod pki;
pub mod runtime;
pub mod upstream;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
