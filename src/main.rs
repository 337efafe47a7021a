//! Pinniped control plane - identity-provider validation and
//! impersonation proxy lifecycle management

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pinniped::controller::{ImpersonatorConfigController, LdapUpstreamWatcher};
use pinniped::crd::LDAPIdentityProvider;
use pinniped::impersonator::{AxumServerStarter, ServingCertStore};
use pinniped::informer::{run_informer, SharedInformer};
use pinniped::kube_client::KubeApi;
use pinniped::upstream::ldap::Ldap3Dialer;
use pinniped::upstream::UpstreamCache;

/// Pinniped - authentication control plane for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "pinniped", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace this control plane is installed in
    #[arg(long, env = "PINNIPED_NAMESPACE", default_value = "pinniped-concierge")]
    namespace: String,

    /// Name of the ConfigMap holding the impersonation proxy configuration
    #[arg(long, default_value = "pinniped-impersonation-proxy-config")]
    impersonation_config_map: String,

    /// Name of the generated load balancer Service for the proxy
    #[arg(long, default_value = "pinniped-impersonation-proxy-load-balancer")]
    impersonation_service: String,

    /// Name of the Secret holding the proxy's TLS material
    #[arg(long, default_value = "pinniped-impersonation-proxy-tls")]
    impersonation_tls_secret: String,

    /// Value of the "app" label stamped on managed objects
    #[arg(long, default_value = "pinniped-concierge")]
    app_label: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&LDAPIdentityProvider::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controllers(cli).await
}

async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let kube_api = Arc::new(KubeApi::new(client.clone()));
    let shutdown = CancellationToken::new();

    // Informers, one per watched resource type. Secrets are shared by
    // both controllers.
    let provider_informer = Arc::new(SharedInformer::<LDAPIdentityProvider>::new());
    let secret_informer = Arc::new(SharedInformer::<Secret>::new());
    let config_map_informer = Arc::new(SharedInformer::<ConfigMap>::new());
    let service_informer = Arc::new(SharedInformer::<Service>::new());

    let upstream_cache = Arc::new(UpstreamCache::new());
    let ldap_watcher = LdapUpstreamWatcher::new_controller(
        upstream_cache.clone(),
        Arc::new(Ldap3Dialer),
        kube_api.clone(),
        &provider_informer,
        &secret_informer,
    );

    let serving_certs = ServingCertStore::new();
    let labels = BTreeMap::from([("app".to_string(), cli.app_label.clone())]);
    let impersonator = ImpersonatorConfigController::new_controller(
        cli.namespace.clone(),
        cli.impersonation_config_map.clone(),
        cli.impersonation_service.clone(),
        cli.impersonation_tls_secret.clone(),
        labels,
        kube_api.clone(),
        kube_api.clone(),
        kube_api,
        &config_map_informer,
        &service_informer,
        &secret_informer,
        // The request-replay handler plugs in here; until it does, the
        // listener only answers health probes.
        Arc::new(|| Ok(Router::new().route("/healthz", get(|| async { StatusCode::OK })))),
        Arc::new(AxumServerStarter),
        serving_certs,
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_informer(
        Api::<LDAPIdentityProvider>::namespaced(client.clone(), &cli.namespace),
        provider_informer,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(run_informer(
        Api::<Secret>::namespaced(client.clone(), &cli.namespace),
        secret_informer,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(run_informer(
        Api::<ConfigMap>::namespaced(client.clone(), &cli.namespace),
        config_map_informer,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(run_informer(
        Api::<Service>::namespaced(client.clone(), &cli.namespace),
        service_informer,
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(ldap_watcher.run(1, shutdown.clone())));
    tasks.push(tokio::spawn(impersonator.run(1, shutdown.clone())));

    info!(namespace = %cli.namespace, "pinniped control plane started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining controllers");
    shutdown.cancel();

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
