//! TLS listener lifecycle for the impersonation proxy
//!
//! The listener must start before any serving certificate exists: the
//! proxy's address is only known once the cluster assigns a load-balancer
//! ingress IP. The serving certificate therefore lives in a
//! [`ServingCertStore`] that the running listener consults on every TLS
//! handshake; the reconciler swaps certificates in and out without
//! restarting the listener. Until a certificate is installed, handshakes
//! fail and clients cannot verify the proxy.
//!
//! Starting and stopping are behind the [`ProxyServerStarter`] and
//! [`ProxyServerHandle`] traits so reconciler tests can observe listener
//! lifecycle without binding sockets.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::Router;
use rustls::crypto::aws_lc_rs;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Fixed TCP port the impersonation proxy listens on
pub const IMPERSONATOR_PORT: u16 = 8444;

/// Builds the HTTP handler served by the proxy listener
///
/// Invoked once each time the listener starts; a factory error aborts the
/// start before any socket is bound.
pub type HandlerFactory = Arc<dyn Fn() -> Result<Router, Error> + Send + Sync>;

/// Shared slot holding the listener's current serving certificate
///
/// Cloned handles all point at the same slot; the reconciler writes,
/// the listener's cert resolver reads.
#[derive(Clone, Debug, Default)]
pub struct ServingCertStore {
    current: Arc<RwLock<Option<Arc<CertifiedKey>>>>,
}

impl ServingCertStore {
    /// Create an empty store; handshakes fail until a cert is installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a PEM-encoded certificate chain and private key
    pub fn set(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), Error> {
        let certs = rustls_pemfile::certs(&mut &*cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::tls(format!("invalid serving certificate: {e}")))?;
        if certs.is_empty() {
            return Err(Error::tls("serving certificate PEM held no certificates"));
        }
        let key = rustls_pemfile::private_key(&mut &*key_pem)
            .map_err(|e| Error::tls(format!("invalid serving key: {e}")))?
            .ok_or_else(|| Error::tls("serving key PEM held no private key"))?;
        let signing_key = aws_lc_rs::sign::any_supported_type(&key)
            .map_err(|e| Error::tls(format!("unsupported serving key: {e}")))?;

        let mut slot = self.current.write().expect("serving cert lock poisoned");
        *slot = Some(Arc::new(CertifiedKey::new(certs, signing_key)));
        Ok(())
    }

    /// Remove the current certificate, returning to the cert-less state
    pub fn clear(&self) {
        let mut slot = self.current.write().expect("serving cert lock poisoned");
        *slot = None;
    }

    /// Whether a certificate is currently installed
    pub fn is_set(&self) -> bool {
        self.current
            .read()
            .expect("serving cert lock poisoned")
            .is_some()
    }
}

/// rustls resolver reading the serving cert store on every handshake
#[derive(Debug)]
struct DynamicCertResolver {
    store: ServingCertStore,
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.store
            .current
            .read()
            .expect("serving cert lock poisoned")
            .clone()
    }
}

/// Handle to a started proxy listener
#[cfg_attr(test, automock)]
pub trait ProxyServerHandle: Send + Sync {
    /// The address the listener is bound to
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting connections and release the port
    fn shutdown(&self) -> Result<(), Error>;
}

/// Starts the impersonation proxy's TLS listener
#[cfg_attr(test, automock)]
pub trait ProxyServerStarter: Send + Sync {
    /// Bind `port` and serve `handler` over TLS, resolving certificates
    /// through `certs` on each handshake
    fn start(
        &self,
        port: u16,
        certs: ServingCertStore,
        handler: Router,
    ) -> Result<Box<dyn ProxyServerHandle>, Error>;
}

/// Production listener built on axum-server with rustls
pub struct AxumServerStarter;

impl ProxyServerStarter for AxumServerStarter {
    fn start(
        &self,
        port: u16,
        certs: ServingCertStore,
        handler: Router,
    ) -> Result<Box<dyn ProxyServerHandle>, Error> {
        let mut server_config = ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(DynamicCertResolver { store: certs }));
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        // Bind synchronously so an unavailable port fails the calling sync
        // instead of a background task.
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| Error::tls(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::tls(format!("failed to read listener address: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::tls(format!("failed to configure listener: {e}")))?;

        let tls_config =
            axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(server_config));
        let handle = axum_server::Handle::new();
        let server = axum_server::from_tcp_rustls(listener, tls_config)
            .handle(handle.clone());

        info!(addr = %local_addr, "impersonation proxy listener starting");
        tokio::spawn(async move {
            if let Err(e) = server.serve(handler.into_make_service()).await {
                error!(error = %e, "impersonation proxy listener failed");
            }
        });

        Ok(Box::new(AxumServerHandle { handle, local_addr }))
    }
}

struct AxumServerHandle {
    handle: axum_server::Handle,
    local_addr: SocketAddr,
}

impl ProxyServerHandle for AxumServerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn shutdown(&self) -> Result<(), Error> {
        info!("impersonation proxy listener stopping");
        self.handle.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::CertificateAuthority;

    #[test]
    fn test_store_starts_empty_and_clears() {
        let store = ServingCertStore::new();
        assert!(!store.is_set());

        let ca = CertificateAuthority::new("test CA").unwrap();
        let cert = ca
            .issue_server_cert(&["127.0.0.1".parse().unwrap()])
            .unwrap();
        store
            .set(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
            .unwrap();
        assert!(store.is_set());

        store.clear();
        assert!(!store.is_set());
    }

    #[test]
    fn test_clones_share_the_same_slot() {
        let store = ServingCertStore::new();
        let clone = store.clone();

        let ca = CertificateAuthority::new("test CA").unwrap();
        let cert = ca
            .issue_server_cert(&["127.0.0.1".parse().unwrap()])
            .unwrap();
        store
            .set(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())
            .unwrap();
        assert!(clone.is_set());
    }

    #[test]
    fn test_set_rejects_garbage_pem() {
        let store = ServingCertStore::new();
        assert!(store.set(b"not a cert", b"not a key").is_err());
        assert!(!store.is_set());
    }

    #[test]
    fn test_set_rejects_mismatched_inputs() {
        let ca = CertificateAuthority::new("test CA").unwrap();
        let cert = ca
            .issue_server_cert(&["127.0.0.1".parse().unwrap()])
            .unwrap();

        let store = ServingCertStore::new();
        // Cert PEM where the key should be: no private key present.
        let err = store
            .set(cert.cert_pem.as_bytes(), cert.cert_pem.as_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("key"));
    }
}
