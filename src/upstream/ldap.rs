//! LDAP upstream provider: connection configuration and dialing
//!
//! The watcher controller builds a [`ProviderConfig`] from each
//! LDAPIdentityProvider resource, validates it through an [`LdapDialer`],
//! and on success publishes an immutable [`LdapUpstream`] record to the
//! cache. The dialer is a trait so validation can be exercised in tests
//! without a directory server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Network timeout for establishing the LDAP connection itself; the
/// caller bounds the whole validation with its own deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings needed to talk to one upstream LDAP server
#[derive(Clone, Debug, Default)]
pub struct ProviderConfig {
    /// Resource name of the provider
    pub name: String,
    /// Host and optional port, e.g. "ldap.example.com:636"
    pub host: String,
    /// PEM bundle of CA certificates to trust; system roots when absent
    pub ca_bundle: Option<Vec<u8>>,
    /// Service account DN used to bind before searching
    pub bind_username: String,
    /// Service account password
    pub bind_password: String,
    /// How to find end users in the directory
    pub user_search: UserSearchConfig,
}

/// User search settings resolved from the provider spec
#[derive(Clone, Debug, Default)]
pub struct UserSearchConfig {
    /// Search base DN
    pub base: String,
    /// Search filter; "{}" is replaced by the escaped username. When
    /// empty, an equality match on the username attribute is used.
    pub filter: String,
    /// Attribute whose value becomes the downstream username
    pub username_attribute: String,
    /// Attribute whose value becomes the downstream user UID
    pub uid_attribute: String,
}

impl UserSearchConfig {
    /// Render the search filter for one username
    pub fn filter_for(&self, username: &str) -> String {
        let escaped = ldap_escape(username);
        if self.filter.is_empty() {
            return format!("({}={})", self.username_attribute, escaped);
        }
        let expanded = self.filter.replace("{}", &escaped);
        if expanded.starts_with('(') {
            expanded
        } else {
            format!("({expanded})")
        }
    }
}

/// A user entry resolved from the directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Value of the configured username attribute
    pub username: String,
    /// Value of the configured UID attribute
    pub uid: String,
}

/// Dials upstream LDAP servers
///
/// `None` results mean "the directory answered, but no such user";
/// errors mean the directory could not be reached or rejected us.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LdapDialer: Send + Sync {
    /// Connect to the host and bind with the service account credentials
    async fn test_connection(&self, config: &ProviderConfig) -> Result<(), Error>;

    /// Search for `username` without verifying any end-user password
    async fn dry_run_authenticate_user(
        &self,
        config: &ProviderConfig,
        username: &str,
    ) -> Result<Option<AuthenticatedUser>, Error>;

    /// Fully authenticate an end user: search for them, then bind as them
    async fn authenticate_user(
        &self,
        config: &ProviderConfig,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedUser>, Error>;
}

/// Production dialer speaking LDAPS via `ldap3`
pub struct Ldap3Dialer;

impl Ldap3Dialer {
    async fn connect(&self, config: &ProviderConfig) -> Result<ldap3::Ldap, Error> {
        let url = format!("ldaps://{}", config.host);
        let mut settings = LdapConnSettings::new().set_conn_timeout(DIAL_TIMEOUT);

        if let Some(bundle) = &config.ca_bundle {
            let mut builder = native_tls::TlsConnector::builder();
            builder.disable_built_in_roots(true);
            let certs = ::pem::parse_many(bundle)
                .map_err(|e| Error::tls(format!("invalid CA bundle: {e}")))?;
            for cert in &certs {
                let cert = native_tls::Certificate::from_der(cert.contents())
                    .map_err(|e| Error::tls(format!("invalid CA certificate: {e}")))?;
                builder.add_root_certificate(cert);
            }
            let connector = builder
                .build()
                .map_err(|e| Error::tls(format!("failed to build TLS connector: {e}")))?;
            settings = settings.set_connector(connector);
        }

        let (conn, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| Error::ldap(format!("failed to connect to {}: {e}", config.host)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });
        Ok(ldap)
    }

    async fn bind(&self, ldap: &mut ldap3::Ldap, config: &ProviderConfig) -> Result<(), Error> {
        ldap.simple_bind(&config.bind_username, &config.bind_password)
            .await
            .map_err(|e| Error::ldap(format!("bind request failed: {e}")))?
            .success()
            .map_err(|e| Error::ldap(format!("bind rejected: {e}")))?;
        Ok(())
    }

    async fn find_user(
        &self,
        ldap: &mut ldap3::Ldap,
        config: &ProviderConfig,
        username: &str,
    ) -> Result<Option<(String, AuthenticatedUser)>, Error> {
        let search = &config.user_search;
        let filter = search.filter_for(username);
        let attrs = vec![
            search.username_attribute.as_str(),
            search.uid_attribute.as_str(),
        ];

        let (entries, _) = ldap
            .search(&search.base, Scope::Subtree, &filter, attrs)
            .await
            .map_err(|e| Error::ldap(format!("search request failed: {e}")))?
            .success()
            .map_err(|e| Error::ldap(format!("search rejected: {e}")))?;

        if entries.is_empty() {
            return Ok(None);
        }
        if entries.len() > 1 {
            return Err(Error::ldap(format!(
                "search for user {username:?} matched {} entries, expected at most one",
                entries.len()
            )));
        }

        let entry = SearchEntry::construct(entries.into_iter().next().expect("one entry"));
        let single_value = |attribute: &str| -> Result<String, Error> {
            let values = entry.attrs.get(attribute).cloned().unwrap_or_default();
            match values.as_slice() {
                [value] => Ok(value.clone()),
                [] => Err(Error::ldap(format!(
                    "user entry {:?} has no value for attribute {attribute:?}",
                    entry.dn
                ))),
                _ => Err(Error::ldap(format!(
                    "user entry {:?} has multiple values for attribute {attribute:?}",
                    entry.dn
                ))),
            }
        };

        let user = AuthenticatedUser {
            username: single_value(&search.username_attribute)?,
            uid: single_value(&search.uid_attribute)?,
        };
        Ok(Some((entry.dn, user)))
    }
}

#[async_trait]
impl LdapDialer for Ldap3Dialer {
    async fn test_connection(&self, config: &ProviderConfig) -> Result<(), Error> {
        let mut ldap = self.connect(config).await?;
        self.bind(&mut ldap, config).await?;
        let _ = ldap.unbind().await;
        Ok(())
    }

    async fn dry_run_authenticate_user(
        &self,
        config: &ProviderConfig,
        username: &str,
    ) -> Result<Option<AuthenticatedUser>, Error> {
        let mut ldap = self.connect(config).await?;
        self.bind(&mut ldap, config).await?;
        let found = self.find_user(&mut ldap, config, username).await?;
        let _ = ldap.unbind().await;
        Ok(found.map(|(_dn, user)| user))
    }

    async fn authenticate_user(
        &self,
        config: &ProviderConfig,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedUser>, Error> {
        let mut ldap = self.connect(config).await?;
        self.bind(&mut ldap, config).await?;

        let Some((dn, user)) = self.find_user(&mut ldap, config, username).await? else {
            let _ = ldap.unbind().await;
            return Ok(None);
        };

        // Re-bind as the end user to verify their password.
        let bind_result = ldap
            .simple_bind(&dn, password)
            .await
            .map_err(|e| Error::ldap(format!("user bind request failed: {e}")))?;
        let _ = ldap.unbind().await;

        match bind_result.success() {
            Ok(_) => Ok(Some(user)),
            Err(_) => Ok(None),
        }
    }
}

/// Common capabilities every validated identity provider publishes
#[async_trait]
pub trait UpstreamIdentityProvider: Send + Sync {
    /// Resource name of the provider
    fn name(&self) -> &str;

    /// Authenticate an end user against the upstream; `None` when the
    /// user was not found or the password was rejected
    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedUser>, Error>;
}

/// A validated LDAP provider, immutable after publication
pub struct LdapUpstream {
    config: ProviderConfig,
    dialer: Arc<dyn LdapDialer>,
}

impl LdapUpstream {
    /// Wrap a validated configuration and the dialer that validated it
    pub fn new(config: ProviderConfig, dialer: Arc<dyn LdapDialer>) -> Self {
        Self { config, dialer }
    }

    /// The validated configuration
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[async_trait]
impl UpstreamIdentityProvider for LdapUpstream {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedUser>, Error> {
        self.dialer
            .authenticate_user(&self.config, username, password)
            .await
    }
}
