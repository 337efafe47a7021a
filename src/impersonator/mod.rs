//! Impersonation proxy: configuration and TLS listener plumbing
//!
//! The impersonation proxy is a TLS server that replays client requests
//! against the cluster API under a service-account identity. This module
//! holds the pieces owned by the proxy itself: the declarative
//! configuration format ([`config`]) and the listener lifecycle with its
//! dynamically swappable serving certificate ([`server`]). The
//! reconciler that decides *when* the proxy runs lives in
//! [`crate::controller::impersonator`].

pub mod config;
pub mod server;

pub use config::{ImpersonationProxyConfig, ImpersonationProxyMode, CONFIG_MAP_KEY};
pub use server::{
    AxumServerStarter, HandlerFactory, ProxyServerHandle, ProxyServerStarter, ServingCertStore,
    IMPERSONATOR_PORT,
};

#[cfg(test)]
pub use server::{MockProxyServerHandle, MockProxyServerStarter};
