//! Impersonator configuration controller
//!
//! Owns the lifecycle of the impersonation proxy in response to its
//! declarative configuration: the TLS listener itself, the LoadBalancer
//! Service that exposes it, and the Secret holding its serving
//! certificate material. Every convergence action is idempotent; the
//! controller re-runs on any event touching the ConfigMap, the managed
//! Service, or the TLS Secret, plus once at startup since the ConfigMap
//! may not exist at all.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use tracing::{debug, info, instrument};

use crate::impersonator::{
    HandlerFactory, ImpersonationProxyConfig, ImpersonationProxyMode, ProxyServerHandle,
    ProxyServerStarter, ServingCertStore, IMPERSONATOR_PORT,
};
use crate::informer::{SharedInformer, Store};
use crate::kube_client::{NodesApi, SecretsApi, ServicesApi};
use crate::pki::{cert_covers_ip, CertificateAuthority};
use crate::runtime::{Action, Controller, Key, MatchExactName, SyncContext, Syncer};
use crate::Error;

/// Name of this controller in logs
pub const CONTROLLER_NAME: &str = "impersonator-config-controller";

/// Node label carrying the node's cluster role
const NODE_ROLE_LABEL: &str = "kubernetes.io/node-role";

/// Role label value identifying a control-plane node
const CONTROL_PLANE_NODE_ROLE: &str = "control-plane";

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const CA_CERT_KEY: &str = "ca.crt";
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// Mutable pieces owned by the reconciler across syncs
struct State {
    /// Handle to the running listener, when one is running
    server: Option<Box<dyn ProxyServerHandle>>,
    /// CA generated on first certificate issuance, kept for the process
    /// lifetime so reissued certs verify against the same bundle
    ca: Option<CertificateAuthority>,
    /// Cluster topology, checked once per process: nodes do not change
    /// role under a running cluster
    has_control_plane: Option<bool>,
}

/// Controller state for the impersonator configuration reconciler
pub struct ImpersonatorConfigController {
    namespace: String,
    config_map_name: String,
    service_name: String,
    secret_name: String,
    labels: BTreeMap<String, String>,
    nodes: Arc<dyn NodesApi>,
    services: Arc<dyn ServicesApi>,
    secrets: Arc<dyn SecretsApi>,
    config_map_store: Store<ConfigMap>,
    service_store: Store<Service>,
    secret_store: Store<Secret>,
    handler_factory: HandlerFactory,
    starter: Arc<dyn ProxyServerStarter>,
    serving_certs: ServingCertStore,
    state: Mutex<State>,
}

impl ImpersonatorConfigController {
    /// Build the reconciler and bind it to its informers
    ///
    /// Each informer is filtered to the exact managed object; the initial
    /// event runs the first sync even when the ConfigMap is absent.
    #[allow(clippy::too_many_arguments)]
    pub fn new_controller(
        namespace: impl Into<String>,
        config_map_name: impl Into<String>,
        service_name: impl Into<String>,
        secret_name: impl Into<String>,
        labels: BTreeMap<String, String>,
        nodes: Arc<dyn NodesApi>,
        services: Arc<dyn ServicesApi>,
        secrets: Arc<dyn SecretsApi>,
        config_map_informer: &SharedInformer<ConfigMap>,
        service_informer: &SharedInformer<Service>,
        secret_informer: &SharedInformer<Secret>,
        handler_factory: HandlerFactory,
        starter: Arc<dyn ProxyServerStarter>,
        serving_certs: ServingCertStore,
    ) -> Controller {
        let namespace = namespace.into();
        let config_map_name = config_map_name.into();
        let service_name = service_name.into();
        let secret_name = secret_name.into();

        let reconciler = Arc::new(Self {
            namespace: namespace.clone(),
            config_map_name: config_map_name.clone(),
            service_name: service_name.clone(),
            secret_name: secret_name.clone(),
            labels,
            nodes,
            services,
            secrets,
            config_map_store: config_map_informer.store(),
            service_store: service_informer.store(),
            secret_store: secret_informer.store(),
            handler_factory,
            starter,
            serving_certs,
            state: Mutex::new(State {
                server: None,
                ca: None,
                has_control_plane: None,
            }),
        });

        Controller::new(CONTROLLER_NAME, reconciler)
            .with_informer(
                config_map_informer,
                MatchExactName::new(namespace.clone(), config_map_name.clone()),
            )
            .with_informer(
                service_informer,
                MatchExactName::new(namespace.clone(), service_name),
            )
            .with_informer(
                secret_informer,
                MatchExactName::new(namespace.clone(), secret_name),
            )
            .with_initial_event(Key::new(namespace, config_map_name))
    }

    /// Whether any node in the cluster carries the control-plane role
    ///
    /// The answer is cached after the first successful check.
    async fn cluster_has_control_plane(&self) -> Result<bool, Error> {
        if let Some(cached) = self.state.lock().expect("state lock poisoned").has_control_plane {
            return Ok(cached);
        }

        let nodes = self.nodes.list_nodes().await?;
        if nodes.is_empty() {
            return Err(Error::validation("no nodes found"));
        }
        let has_control_plane = nodes.iter().any(|node| {
            node.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(NODE_ROLE_LABEL))
                .map(String::as_str)
                == Some(CONTROL_PLANE_NODE_ROLE)
        });

        self.state
            .lock()
            .expect("state lock poisoned")
            .has_control_plane = Some(has_control_plane);
        Ok(has_control_plane)
    }

    /// Start or stop the TLS listener to match the desired state
    fn ensure_listener(&self, want_impersonator: bool) -> Result<(), Error> {
        let mut state = self.state.lock().expect("state lock poisoned");

        if want_impersonator && state.server.is_none() {
            // Build the handler first: a factory error must abort the sync
            // before any socket is bound.
            let handler = (self.handler_factory)()?;
            info!(port = IMPERSONATOR_PORT, "starting impersonation proxy");
            let server =
                self.starter
                    .start(IMPERSONATOR_PORT, self.serving_certs.clone(), handler)?;
            state.server = Some(server);
        } else if !want_impersonator {
            if let Some(server) = state.server.take() {
                info!("stopping impersonation proxy");
                self.serving_certs.clear();
                // The listener counts as stopped either way, but a close
                // error must still surface from this sync.
                server.shutdown()?;
            }
        }

        Ok(())
    }

    /// Create or delete the managed LoadBalancer Service
    async fn ensure_load_balancer(&self, want_load_balancer: bool) -> Result<(), Error> {
        let exists = self
            .service_store
            .get(&self.namespace, &self.service_name)
            .is_some();

        if want_load_balancer && !exists {
            info!(service = %self.service_name, "creating load balancer for impersonation proxy");
            self.services
                .create_service(self.desired_load_balancer())
                .await?;
        } else if !want_load_balancer && exists {
            info!(service = %self.service_name, "deleting load balancer for impersonation proxy");
            self.services
                .delete_service(&self.namespace, &self.service_name)
                .await?;
        }

        Ok(())
    }

    fn desired_load_balancer(&self) -> Service {
        let app = self.labels.get("app").cloned().unwrap_or_default();
        Service {
            metadata: ObjectMeta {
                name: Some(self.service_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                selector: Some(BTreeMap::from([("app".to_string(), app)])),
                ports: Some(vec![ServicePort {
                    port: 443,
                    target_port: Some(IntOrString::Int(i32::from(IMPERSONATOR_PORT))),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The IP address the proxy is reachable at, when one is known
    ///
    /// A configured endpoint wins over the load balancer; a hostname
    /// endpoint yields no IP and the listener stays cert-less.
    fn serving_ip(&self, config: &ImpersonationProxyConfig) -> Option<IpAddr> {
        if config.endpoint().is_some() {
            return config.endpoint_ip();
        }
        let service = self.service_store.get(&self.namespace, &self.service_name)?;
        let ingress_ip = service
            .status
            .as_ref()?
            .load_balancer
            .as_ref()?
            .ingress
            .as_ref()?
            .first()?
            .ip
            .clone()?;
        ingress_ip.parse().ok()
    }

    /// Converge the TLS material for the current serving address
    ///
    /// Reuses the stored secret when its certificate still covers the
    /// serving IP; otherwise regenerates it. With no known IP the
    /// listener keeps running without a verifiable certificate.
    async fn ensure_tls_material(&self, config: &ImpersonationProxyConfig) -> Result<(), Error> {
        let Some(ip) = self.serving_ip(config) else {
            debug!("no serving IP known yet, impersonation proxy runs without certs");
            return Ok(());
        };

        if let Some(secret) = self.secret_store.get(&self.namespace, &self.secret_name) {
            if let Some((cert_pem, key_pem)) = tls_material_covering_ip(&secret, ip) {
                if self.serving_certs.set(&cert_pem, &key_pem).is_ok() {
                    debug!(%ip, "reusing stored TLS material");
                    return Ok(());
                }
            }
            info!(%ip, "stored TLS material does not match serving IP, regenerating");
            self.secrets
                .delete_secret(&self.namespace, &self.secret_name)
                .await?;
        }

        let (cert, ca_bundle) = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if state.ca.is_none() {
                state.ca = Some(CertificateAuthority::new("Pinniped Impersonation Proxy CA")?);
            }
            let ca = state.ca.as_ref().expect("CA was just initialized");
            (ca.issue_server_cert(&[ip])?, ca.bundle_pem().to_string())
        };

        self.serving_certs
            .set(cert.cert_pem.as_bytes(), cert.key_pem.as_bytes())?;

        info!(%ip, secret = %self.secret_name, "issued TLS material for impersonation proxy");
        self.secrets
            .create_secret(Secret {
                metadata: ObjectMeta {
                    name: Some(self.secret_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(self.labels.clone()),
                    ..Default::default()
                },
                type_: Some(TLS_SECRET_TYPE.to_string()),
                data: Some(BTreeMap::from([
                    (
                        CA_CERT_KEY.to_string(),
                        ByteString(ca_bundle.into_bytes()),
                    ),
                    (
                        TLS_CERT_KEY.to_string(),
                        ByteString(cert.cert_pem.into_bytes()),
                    ),
                    (
                        TLS_KEY_KEY.to_string(),
                        ByteString(cert.key_pem.into_bytes()),
                    ),
                ])),
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// Remove the TLS secret when the impersonator is not wanted
    async fn delete_tls_material_if_present(&self) -> Result<(), Error> {
        self.serving_certs.clear();
        if self
            .secret_store
            .get(&self.namespace, &self.secret_name)
            .is_some()
        {
            info!(secret = %self.secret_name, "deleting TLS material for stopped impersonation proxy");
            self.secrets
                .delete_secret(&self.namespace, &self.secret_name)
                .await?;
        }
        Ok(())
    }
}

/// Extract (tls.crt, tls.key) from the secret iff the certificate covers
/// the given IP
fn tls_material_covering_ip(secret: &Secret, ip: IpAddr) -> Option<(Vec<u8>, Vec<u8>)> {
    let data = secret.data.as_ref()?;
    let cert_pem = data.get(TLS_CERT_KEY)?.0.clone();
    let key_pem = data.get(TLS_KEY_KEY)?.0.clone();
    if cert_covers_ip(&cert_pem, ip) {
        Some((cert_pem, key_pem))
    } else {
        None
    }
}

#[async_trait]
impl Syncer for ImpersonatorConfigController {
    #[instrument(name = "impersonator_config_sync", skip_all)]
    async fn sync(&self, _ctx: &SyncContext) -> Result<Action, Error> {
        let config_map = self
            .config_map_store
            .get(&self.namespace, &self.config_map_name);
        let config = ImpersonationProxyConfig::from_config_map(config_map.as_deref())?;

        let has_control_plane = self.cluster_has_control_plane().await?;
        let (want_impersonator, want_load_balancer) = match config.mode {
            ImpersonationProxyMode::Disabled => (false, false),
            ImpersonationProxyMode::Enabled => (true, config.endpoint().is_none()),
            ImpersonationProxyMode::Auto => (
                !has_control_plane,
                !has_control_plane && config.endpoint().is_none(),
            ),
        };
        debug!(
            mode = ?config.mode,
            has_control_plane,
            want_impersonator,
            want_load_balancer,
            "computed desired impersonation proxy state"
        );

        self.ensure_listener(want_impersonator)?;
        self.ensure_load_balancer(want_load_balancer).await?;

        if want_impersonator {
            self.ensure_tls_material(&config).await?;
        } else {
            self.delete_tls_material_if_present().await?;
        }

        Ok(Action::Done)
    }
}
