//! Typed object-store client capabilities
//!
//! Reconcilers talk to the cluster through these narrow traits instead of
//! a concrete client, so tests can substitute `mockall` doubles and count
//! exactly which mutations a sync performed. [`KubeApi`] is the one real
//! implementation, wrapping a `kube::Client`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::LDAPIdentityProvider;
use crate::Error;

/// Read access to the cluster's nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodesApi: Send + Sync {
    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
}

/// Mutations on Service objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServicesApi: Send + Sync {
    /// Create a service in its metadata's namespace
    async fn create_service(&self, service: Service) -> Result<Service, Error>;

    /// Delete the service at (namespace, name)
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Mutations on Secret objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsApi: Send + Sync {
    /// Create a secret in its metadata's namespace
    async fn create_secret(&self, secret: Secret) -> Result<Secret, Error>;

    /// Delete the secret at (namespace, name)
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Status writes for LDAPIdentityProvider objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LdapIdentityProvidersApi: Send + Sync {
    /// Replace the status subresource of the given provider
    async fn update_status(
        &self,
        provider: &LDAPIdentityProvider,
    ) -> Result<LDAPIdentityProvider, Error>;
}

/// Real Kubernetes client implementation of every capability trait
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    /// Create a new KubeApi wrapping the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodesApi for KubeApi {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items)
    }
}

#[async_trait]
impl ServicesApi for KubeApi {
    async fn create_service(&self, service: Service) -> Result<Service, Error> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), &service).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl SecretsApi for KubeApi {
    async fn create_secret(&self, secret: Secret) -> Result<Secret, Error> {
        let namespace = secret.namespace().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), &secret).await?)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl LdapIdentityProvidersApi for KubeApi {
    async fn update_status(
        &self,
        provider: &LDAPIdentityProvider,
    ) -> Result<LDAPIdentityProvider, Error> {
        let namespace = provider.namespace().unwrap_or_default();
        let api: Api<LDAPIdentityProvider> = Api::namespaced(self.client.clone(), &namespace);
        let body = serde_json::to_vec(provider)
            .map_err(|e| Error::serialization(format!("encode status update: {e}")))?;
        Ok(api
            .replace_status(&provider.name_any(), &PostParams::default(), body)
            .await?)
    }
}
