//! LDAP upstream watcher controller
//!
//! Observes every LDAPIdentityProvider in the installation namespace,
//! validates each one (bind secret, TLS trust bundle, live connectivity),
//! reports the outcome through status conditions, and publishes the set
//! of fully validated providers to the upstream cache consumed by the
//! login path.
//!
//! The controller runs under the singleton queue key: any provider or
//! bind-secret event triggers one pass over the whole set. Network
//! validation is expensive, so a successful LDAPConnectionValid condition
//! records the bind secret's resource version inside its message; future
//! passes skip the network check while the spec generation and secret
//! version both still match.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use crate::crd::{
    Condition, ConditionStatus, LDAPIdentityProvider, LdapIdentityProviderPhase,
};
use crate::informer::{SharedInformer, Store};
use crate::kube_client::LdapIdentityProvidersApi;
use crate::runtime::{
    Action, Controller, Key, MatchAnything, MatchSecretsOfType, SyncContext, Syncer,
};
use crate::upstream::{
    LdapDialer, LdapUpstream, ProviderConfig, UpstreamCache, UpstreamIdentityProvider,
    UserSearchConfig,
};
use crate::Error;

/// Name of this controller in logs
pub const CONTROLLER_NAME: &str = "ldap-upstream-observer";

/// Secret type required for bind credentials
const LDAP_BIND_SECRET_TYPE: &str = "kubernetes.io/basic-auth";

/// Bound on each provider's network validation, not on the whole sync
const TEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

const TYPE_BIND_SECRET_VALID: &str = "BindSecretValid";
const TYPE_TLS_CONFIGURATION_VALID: &str = "TLSConfigurationValid";
const TYPE_LDAP_CONNECTION_VALID: &str = "LDAPConnectionValid";

const REASON_SUCCESS: &str = "Success";
const REASON_NOT_FOUND: &str = "SecretNotFound";
const REASON_WRONG_TYPE: &str = "SecretWrongType";
const REASON_MISSING_KEYS: &str = "SecretMissingKeys";
const REASON_INVALID_TLS_CONFIG: &str = "InvalidTLSConfig";
const REASON_LDAP_CONNECTION_ERROR: &str = "LDAPConnectionError";
const REASON_DRY_RUN_ERROR: &str = "AuthenticationDryRunError";

const NO_TLS_CONFIGURATION_MESSAGE: &str = "no TLS configuration provided";
const LOADED_TLS_CONFIGURATION_MESSAGE: &str = "loaded TLS configuration";

const VALIDATED_TRAILER_PREFIX: &str = " [validated with Secret \"";
const VALIDATED_TRAILER_MIDDLE: &str = "\" at version \"";

/// Render the proof-of-validation trailer appended to successful
/// LDAPConnectionValid messages
fn validated_trailer(secret_name: &str, secret_version: &str) -> String {
    format!("{VALIDATED_TRAILER_PREFIX}{secret_name}{VALIDATED_TRAILER_MIDDLE}{secret_version}\"]")
}

/// Parse the secret resource version back out of a condition message
///
/// Inverse of [`validated_trailer`]; `None` when the message carries no
/// well-formed trailer.
fn validated_secret_version(message: &str) -> Option<&str> {
    let rest = message.strip_suffix("\"]")?;
    let start = rest.rfind(VALIDATED_TRAILER_PREFIX)?;
    let trailer = &rest[start + VALIDATED_TRAILER_PREFIX.len()..];
    let (_secret_name, version) = trailer.split_once(VALIDATED_TRAILER_MIDDLE)?;
    Some(version)
}

/// Merge freshly computed conditions into an object's stored conditions
///
/// Replaces same-typed entries, stamps `observed_generation`, preserves
/// `last_transition_time` when the status did not flip, and keeps the
/// list sorted by type. Returns whether any computed condition was
/// non-True.
fn merge_conditions(
    computed: Vec<Condition>,
    generation: i64,
    existing: &mut Vec<Condition>,
) -> bool {
    let mut had_error = false;
    for mut condition in computed {
        if condition.status != ConditionStatus::True {
            had_error = true;
        }
        condition.observed_generation = generation;
        match existing.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(old) => {
                if old.status == condition.status {
                    condition.last_transition_time = old.last_transition_time;
                }
                *old = condition;
            }
            None => existing.push(condition),
        }
    }
    existing.sort_by(|a, b| a.type_.cmp(&b.type_));
    had_error
}

/// Whether a previous sync already validated connectivity for this exact
/// spec generation and bind-secret version
fn has_previous_successful_validation(
    upstream: &LDAPIdentityProvider,
    current_secret_version: &str,
) -> bool {
    let generation = upstream.metadata.generation.unwrap_or_default();
    let Some(status) = &upstream.status else {
        return false;
    };
    status.conditions.iter().any(|c| {
        c.type_ == TYPE_LDAP_CONNECTION_VALID
            && c.status == ConditionStatus::True
            && c.observed_generation == generation
            && validated_secret_version(&c.message) == Some(current_secret_version)
    })
}

/// Controller state for the LDAP upstream watcher
pub struct LdapUpstreamWatcher {
    cache: Arc<UpstreamCache>,
    dialer: Arc<dyn LdapDialer>,
    client: Arc<dyn LdapIdentityProvidersApi>,
    providers: Store<LDAPIdentityProvider>,
    secrets: Store<Secret>,
}

impl LdapUpstreamWatcher {
    /// Build the watcher and bind it to its informers
    ///
    /// Provider events and basic-auth secret events both collapse onto
    /// the singleton key; the initial event makes the first sync publish
    /// an (empty) snapshot even before any provider exists.
    pub fn new_controller(
        cache: Arc<UpstreamCache>,
        dialer: Arc<dyn LdapDialer>,
        client: Arc<dyn LdapIdentityProvidersApi>,
        provider_informer: &SharedInformer<LDAPIdentityProvider>,
        secret_informer: &SharedInformer<Secret>,
    ) -> Controller {
        let watcher = Arc::new(Self {
            cache,
            dialer,
            client,
            providers: provider_informer.store(),
            secrets: secret_informer.store(),
        });
        Controller::new(CONTROLLER_NAME, watcher)
            .with_informer(provider_informer, MatchAnything)
            .with_informer(
                secret_informer,
                MatchSecretsOfType::new(LDAP_BIND_SECRET_TYPE),
            )
            .with_initial_event(Key::singleton())
    }

    /// Validate one provider, returning its cache record when everything
    /// checked out
    ///
    /// `Ok(None)` means at least one condition was non-True and the
    /// provider must stay out of the cache. `Err` is reserved for
    /// shutdown cancellation.
    async fn validate_upstream(
        &self,
        ctx: &SyncContext,
        upstream: &LDAPIdentityProvider,
    ) -> Result<Option<Arc<dyn UpstreamIdentityProvider>>, Error> {
        let spec = &upstream.spec;
        let mut config = ProviderConfig {
            name: upstream.name_any(),
            host: spec.host.clone(),
            ca_bundle: None,
            bind_username: String::new(),
            bind_password: String::new(),
            user_search: UserSearchConfig {
                base: spec.user_search.base.clone(),
                filter: spec.user_search.filter.clone(),
                username_attribute: spec.user_search.attributes.username.clone(),
                uid_attribute: spec.user_search.attributes.uid.clone(),
            },
        };

        let (secret_condition, current_secret_version) =
            self.validate_secret(upstream, &mut config);
        let tls_condition = self.validate_tls(upstream, &mut config);

        let mut conditions = vec![secret_condition, tls_condition];

        // No point dialing the server when the local config is already
        // known to be bad.
        if conditions
            .iter()
            .all(|c| c.status == ConditionStatus::True)
        {
            if let Some(condition) = self
                .validate_finished_config(ctx, upstream, &config, &current_secret_version)
                .await?
            {
                conditions.push(condition);
            }
        }

        let had_error = self.update_status(upstream, conditions).await;
        if had_error {
            return Ok(None);
        }

        Ok(Some(Arc::new(LdapUpstream::new(
            config,
            Arc::clone(&self.dialer),
        ))))
    }

    fn validate_secret(
        &self,
        upstream: &LDAPIdentityProvider,
        config: &mut ProviderConfig,
    ) -> (Condition, String) {
        let namespace = upstream.namespace().unwrap_or_default();
        let secret_name = &upstream.spec.bind.secret_name;

        let Some(secret) = self.secrets.get(&namespace, secret_name) else {
            return (
                Condition::new(
                    TYPE_BIND_SECRET_VALID,
                    ConditionStatus::False,
                    REASON_NOT_FOUND,
                    format!("secret \"{namespace}/{secret_name}\" not found"),
                ),
                String::new(),
            );
        };
        let secret_version = secret.resource_version().unwrap_or_default();

        if secret.type_.as_deref() != Some(LDAP_BIND_SECRET_TYPE) {
            return (
                Condition::new(
                    TYPE_BIND_SECRET_VALID,
                    ConditionStatus::False,
                    REASON_WRONG_TYPE,
                    format!(
                        "referenced Secret {secret_name:?} has wrong type {:?} (should be {LDAP_BIND_SECRET_TYPE:?})",
                        secret.type_.as_deref().unwrap_or_default()
                    ),
                ),
                secret_version,
            );
        }

        let field = |key: &str| -> String {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .unwrap_or_default()
        };
        let username = field("username");
        let password = field("password");
        if username.is_empty() || password.is_empty() {
            return (
                Condition::new(
                    TYPE_BIND_SECRET_VALID,
                    ConditionStatus::False,
                    REASON_MISSING_KEYS,
                    format!(
                        "referenced Secret {secret_name:?} is missing required keys [\"username\", \"password\"]"
                    ),
                ),
                secret_version,
            );
        }

        config.bind_username = username;
        config.bind_password = password;
        (
            Condition::new(
                TYPE_BIND_SECRET_VALID,
                ConditionStatus::True,
                REASON_SUCCESS,
                "loaded bind secret",
            ),
            secret_version,
        )
    }

    fn validate_tls(
        &self,
        upstream: &LDAPIdentityProvider,
        config: &mut ProviderConfig,
    ) -> Condition {
        let valid = |message: &str| {
            Condition::new(
                TYPE_TLS_CONFIGURATION_VALID,
                ConditionStatus::True,
                REASON_SUCCESS,
                message,
            )
        };
        let invalid = |message: String| {
            Condition::new(
                TYPE_TLS_CONFIGURATION_VALID,
                ConditionStatus::False,
                REASON_INVALID_TLS_CONFIG,
                message,
            )
        };

        let Some(tls) = &upstream.spec.tls else {
            return valid(NO_TLS_CONFIGURATION_MESSAGE);
        };
        let Some(ca_data) = tls
            .certificate_authority_data
            .as_deref()
            .filter(|data| !data.is_empty())
        else {
            return valid(LOADED_TLS_CONFIGURATION_MESSAGE);
        };

        let bundle = match BASE64_STANDARD.decode(ca_data) {
            Ok(bundle) => bundle,
            Err(e) => return invalid(format!("certificateAuthorityData is invalid: {e}")),
        };

        let contains_certificate = ::pem::parse_many(&bundle)
            .map(|blocks| blocks.iter().any(|block| block.tag() == "CERTIFICATE"))
            .unwrap_or(false);
        if !contains_certificate {
            return invalid(
                "certificateAuthorityData is invalid: no certificates found".to_string(),
            );
        }

        config.ca_bundle = Some(bundle);
        valid(LOADED_TLS_CONFIGURATION_MESSAGE)
    }

    /// Run the network validation unless an earlier pass already proved
    /// this exact (generation, secret version) pair
    async fn validate_finished_config(
        &self,
        ctx: &SyncContext,
        upstream: &LDAPIdentityProvider,
        config: &ProviderConfig,
        current_secret_version: &str,
    ) -> Result<Option<Condition>, Error> {
        if has_previous_successful_validation(upstream, current_secret_version) {
            debug!(
                provider = %config.name,
                "skipping connection check, already validated at this generation and secret version"
            );
            return Ok(None);
        }

        let condition = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(Error::validation("sync cancelled during shutdown"));
            }
            condition = self.run_connection_check(upstream, config, current_secret_version) => {
                condition
            }
        };
        Ok(Some(condition))
    }

    async fn run_connection_check(
        &self,
        upstream: &LDAPIdentityProvider,
        config: &ProviderConfig,
        current_secret_version: &str,
    ) -> Condition {
        let secret_name = &upstream.spec.bind.secret_name;

        if let Some(username) = &upstream.spec.dry_run_authentication_username {
            let outcome = tokio::time::timeout(
                TEST_CONNECTION_TIMEOUT,
                self.dialer.dry_run_authenticate_user(config, username),
            )
            .await
            .unwrap_or_else(|_| {
                Err(Error::ldap(format!(
                    "timed out after {}s",
                    TEST_CONNECTION_TIMEOUT.as_secs()
                )))
            });

            return match outcome {
                Err(e) => Condition::new(
                    TYPE_LDAP_CONNECTION_VALID,
                    ConditionStatus::False,
                    REASON_DRY_RUN_ERROR,
                    format!("failed authentication dry run for end user {username:?}: {e}"),
                ),
                // The dry run carries no password, so an unauthenticated
                // answer without an error can only mean a wrong username.
                Ok(None) => Condition::new(
                    TYPE_LDAP_CONNECTION_VALID,
                    ConditionStatus::False,
                    REASON_DRY_RUN_ERROR,
                    format!("failed authentication dry run for end user {username:?}: user not found"),
                ),
                Ok(Some(user)) => Condition::new(
                    TYPE_LDAP_CONNECTION_VALID,
                    ConditionStatus::True,
                    REASON_SUCCESS,
                    format!(
                        "successful authentication dry run for end user {username:?}: selected username \"{}\" and UID \"{}\"{}",
                        user.username,
                        user.uid,
                        validated_trailer(secret_name, current_secret_version)
                    ),
                ),
            };
        }

        let outcome = tokio::time::timeout(
            TEST_CONNECTION_TIMEOUT,
            self.dialer.test_connection(config),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::ldap(format!(
                "timed out after {}s",
                TEST_CONNECTION_TIMEOUT.as_secs()
            )))
        });

        match outcome {
            Err(e) => Condition::new(
                TYPE_LDAP_CONNECTION_VALID,
                ConditionStatus::False,
                REASON_LDAP_CONNECTION_ERROR,
                format!(
                    "could not successfully connect to \"{}\" and bind as user \"{}\": {e}",
                    config.host, config.bind_username
                ),
            ),
            Ok(()) => Condition::new(
                TYPE_LDAP_CONNECTION_VALID,
                ConditionStatus::True,
                REASON_SUCCESS,
                format!(
                    "successfully able to connect to \"{}\" and bind as user \"{}\"{}",
                    config.host,
                    config.bind_username,
                    validated_trailer(secret_name, current_secret_version)
                ),
            ),
        }
    }

    /// Merge conditions into the object status and write it back iff it
    /// changed; returns whether any computed condition was non-True
    async fn update_status(
        &self,
        upstream: &LDAPIdentityProvider,
        conditions: Vec<Condition>,
    ) -> bool {
        let generation = upstream.metadata.generation.unwrap_or_default();
        let mut updated = upstream.clone();
        let mut status = updated.status.take().unwrap_or_default();

        let had_error = merge_conditions(conditions, generation, &mut status.conditions);
        status.phase = if had_error {
            LdapIdentityProviderPhase::Error
        } else {
            LdapIdentityProviderPhase::Ready
        };
        updated.status = Some(status);

        if updated.status == upstream.status {
            return had_error;
        }

        if let Err(e) = self.client.update_status(&updated).await {
            warn!(
                namespace = %upstream.namespace().unwrap_or_default(),
                name = %upstream.name_any(),
                error = %e,
                "failed to update status"
            );
        }

        had_error
    }
}

#[async_trait]
impl Syncer for LdapUpstreamWatcher {
    #[instrument(name = "ldap_upstream_sync", skip_all)]
    async fn sync(&self, ctx: &SyncContext) -> Result<Action, Error> {
        let upstreams = self.providers.list();
        debug!(count = upstreams.len(), "validating LDAP upstreams");

        let mut requeue = false;
        let mut validated: Vec<Arc<dyn UpstreamIdentityProvider>> =
            Vec::with_capacity(upstreams.len());
        for upstream in &upstreams {
            if ctx.cancel.is_cancelled() {
                return Err(Error::validation("sync cancelled during shutdown"));
            }
            match self.validate_upstream(ctx, upstream).await? {
                Some(provider) => validated.push(provider),
                None => requeue = true,
            }
        }

        // Snapshot replacement: even an empty set is published so deleted
        // or newly invalid providers stop being served immediately.
        self.cache.set_ldap_providers(validated);

        if requeue {
            Ok(Action::Requeue)
        } else {
            Ok(Action::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        BindSpec, LdapIdentityProviderSpec, LdapIdentityProviderStatus, TlsSpec,
        UserSearchAttributes, UserSearchSpec,
    };
    use crate::kube_client::MockLdapIdentityProvidersApi;
    use crate::upstream::ldap::AuthenticatedUser;
    use crate::upstream::MockLdapDialer;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    const NAMESPACE: &str = "ns";
    const PROVIDER_NAME: &str = "upstream";
    const SECRET_NAME: &str = "bind-secret";
    const SECRET_VERSION: &str = "4242";
    const GENERATION: i64 = 12;

    fn sync_context() -> SyncContext {
        SyncContext {
            key: Key::singleton(),
            cancel: CancellationToken::new(),
        }
    }

    fn provider_spec(dry_run_username: Option<&str>, tls: Option<TlsSpec>) -> LdapIdentityProviderSpec {
        LdapIdentityProviderSpec {
            host: "ldap.example.com:636".to_string(),
            user_search: UserSearchSpec {
                base: "ou=users,dc=example,dc=com".to_string(),
                filter: String::new(),
                attributes: UserSearchAttributes {
                    username: "uid".to_string(),
                    uid: "uidNumber".to_string(),
                },
            },
            tls,
            bind: BindSpec {
                secret_name: SECRET_NAME.to_string(),
            },
            dry_run_authentication_username: dry_run_username.map(str::to_string),
        }
    }

    fn provider(dry_run_username: Option<&str>, tls: Option<TlsSpec>) -> LDAPIdentityProvider {
        let mut provider = LDAPIdentityProvider::new(PROVIDER_NAME, provider_spec(dry_run_username, tls));
        provider.metadata = ObjectMeta {
            name: Some(PROVIDER_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            generation: Some(GENERATION),
            ..Default::default()
        };
        provider
    }

    fn bind_secret(version: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(SECRET_NAME.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            type_: Some(LDAP_BIND_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([
                (
                    "username".to_string(),
                    ByteString(b"cn=admin,dc=example,dc=com".to_vec()),
                ),
                ("password".to_string(), ByteString(b"hunter2".to_vec())),
            ])),
            ..Default::default()
        }
    }

    /// Mock status API that records every written status
    fn capturing_client(
        captured: Arc<Mutex<Vec<LDAPIdentityProvider>>>,
    ) -> MockLdapIdentityProvidersApi {
        let mut client = MockLdapIdentityProvidersApi::new();
        client.expect_update_status().returning(move |p| {
            captured.lock().unwrap().push(p.clone());
            Ok(p.clone())
        });
        client
    }

    struct Fixture {
        watcher: LdapUpstreamWatcher,
        cache: Arc<UpstreamCache>,
        providers: SharedInformer<LDAPIdentityProvider>,
        secrets: SharedInformer<Secret>,
        captured: Arc<Mutex<Vec<LDAPIdentityProvider>>>,
    }

    fn fixture(dialer: MockLdapDialer) -> Fixture {
        let captured = Arc::new(Mutex::new(Vec::new()));
        fixture_with_client(dialer, capturing_client(captured.clone()), captured)
    }

    fn fixture_with_client(
        dialer: MockLdapDialer,
        client: MockLdapIdentityProvidersApi,
        captured: Arc<Mutex<Vec<LDAPIdentityProvider>>>,
    ) -> Fixture {
        let cache = Arc::new(UpstreamCache::new());
        let providers = SharedInformer::new();
        let secrets = SharedInformer::new();
        let watcher = LdapUpstreamWatcher {
            cache: cache.clone(),
            dialer: Arc::new(dialer),
            client: Arc::new(client),
            providers: providers.store(),
            secrets: secrets.store(),
        };
        Fixture {
            watcher,
            cache,
            providers,
            secrets,
            captured,
        }
    }

    fn written_conditions(fixture: &Fixture) -> Vec<Condition> {
        let captured = fixture.captured.lock().unwrap();
        captured
            .last()
            .expect("a status should have been written")
            .status
            .clone()
            .expect("written status is present")
            .conditions
    }

    fn find<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
        conditions
            .iter()
            .find(|c| c.type_ == type_)
            .unwrap_or_else(|| panic!("missing condition {type_}"))
    }

    #[tokio::test]
    async fn test_happy_path_dry_run_publishes_provider() {
        let mut dialer = MockLdapDialer::new();
        dialer
            .expect_dry_run_authenticate_user()
            .withf(|config, username| config.host == "ldap.example.com:636" && username == "pinny")
            .times(1)
            .returning(|_, _| {
                Ok(Some(AuthenticatedUser {
                    username: "pinny".to_string(),
                    uid: "1000".to_string(),
                }))
            });
        dialer.expect_test_connection().never();

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(Some("pinny"), None));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Done);

        let snapshot = fixture.cache.ldap_providers();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), PROVIDER_NAME);

        let captured = fixture.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let status = captured[0].status.clone().unwrap();
        assert_eq!(status.phase, LdapIdentityProviderPhase::Ready);
        drop(captured);

        let conditions = written_conditions(&fixture);
        assert_eq!(conditions.len(), 3);
        // Merged conditions are kept sorted by type.
        assert_eq!(
            conditions.iter().map(|c| c.type_.as_str()).collect::<Vec<_>>(),
            vec![
                TYPE_BIND_SECRET_VALID,
                TYPE_LDAP_CONNECTION_VALID,
                TYPE_TLS_CONFIGURATION_VALID
            ]
        );
        assert!(conditions
            .iter()
            .all(|c| c.status == ConditionStatus::True && c.observed_generation == GENERATION));

        let connection = find(&conditions, TYPE_LDAP_CONNECTION_VALID);
        assert_eq!(
            connection.message,
            format!(
                "successful authentication dry run for end user \"pinny\": \
                 selected username \"pinny\" and UID \"1000\" \
                 [validated with Secret \"{SECRET_NAME}\" at version \"{SECRET_VERSION}\"]"
            )
        );
        assert_eq!(
            validated_secret_version(&connection.message),
            Some(SECRET_VERSION)
        );
    }

    #[tokio::test]
    async fn test_happy_path_bind_check_when_no_dry_run_user() {
        let mut dialer = MockLdapDialer::new();
        dialer
            .expect_test_connection()
            .times(1)
            .returning(|_| Ok(()));
        dialer.expect_dry_run_authenticate_user().never();

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(None, None));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Done);

        let conditions = written_conditions(&fixture);
        let connection = find(&conditions, TYPE_LDAP_CONNECTION_VALID);
        assert_eq!(
            connection.message,
            format!(
                "successfully able to connect to \"ldap.example.com:636\" and bind as user \
                 \"cn=admin,dc=example,dc=com\" \
                 [validated with Secret \"{SECRET_NAME}\" at version \"{SECRET_VERSION}\"]"
            )
        );
    }

    #[tokio::test]
    async fn test_missing_secret_excludes_provider_and_requeues() {
        let mut dialer = MockLdapDialer::new();
        dialer.expect_test_connection().never();
        dialer.expect_dry_run_authenticate_user().never();

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(None, None));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Requeue);
        assert!(fixture.cache.ldap_providers().is_empty());

        let conditions = written_conditions(&fixture);
        // The connection check is omitted entirely when prerequisites fail.
        assert_eq!(conditions.len(), 2);
        let secret = find(&conditions, TYPE_BIND_SECRET_VALID);
        assert_eq!(secret.status, ConditionStatus::False);
        assert_eq!(secret.reason, REASON_NOT_FOUND);
        assert_eq!(
            secret.message,
            format!("secret \"{NAMESPACE}/{SECRET_NAME}\" not found")
        );

        let captured = fixture.captured.lock().unwrap();
        assert_eq!(
            captured[0].status.as_ref().unwrap().phase,
            LdapIdentityProviderPhase::Error
        );
    }

    #[tokio::test]
    async fn test_wrong_secret_type_is_rejected() {
        let mut dialer = MockLdapDialer::new();
        dialer.expect_test_connection().never();
        dialer.expect_dry_run_authenticate_user().never();

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(None, None));
        let mut secret = bind_secret(SECRET_VERSION);
        secret.type_ = Some("Opaque".to_string());
        fixture.secrets.apply(secret);

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Requeue);

        let conditions = written_conditions(&fixture);
        let secret = find(&conditions, TYPE_BIND_SECRET_VALID);
        assert_eq!(secret.reason, REASON_WRONG_TYPE);
        assert_eq!(
            secret.message,
            format!(
                "referenced Secret \"{SECRET_NAME}\" has wrong type \"Opaque\" \
                 (should be \"{LDAP_BIND_SECRET_TYPE}\")"
            )
        );
    }

    #[tokio::test]
    async fn test_missing_keys_are_rejected() {
        let mut dialer = MockLdapDialer::new();
        dialer.expect_test_connection().never();
        dialer.expect_dry_run_authenticate_user().never();

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(None, None));
        let mut secret = bind_secret(SECRET_VERSION);
        secret
            .data
            .as_mut()
            .unwrap()
            .remove("password");
        fixture.secrets.apply(secret);

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Requeue);

        let conditions = written_conditions(&fixture);
        let secret = find(&conditions, TYPE_BIND_SECRET_VALID);
        assert_eq!(secret.reason, REASON_MISSING_KEYS);
        assert_eq!(
            secret.message,
            format!(
                "referenced Secret \"{SECRET_NAME}\" is missing required keys \
                 [\"username\", \"password\"]"
            )
        );
    }

    #[tokio::test]
    async fn test_invalid_base64_ca_data_is_rejected() {
        let mut dialer = MockLdapDialer::new();
        dialer.expect_test_connection().never();
        dialer.expect_dry_run_authenticate_user().never();

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(
            None,
            Some(TlsSpec {
                certificate_authority_data: Some("%%% not base64 %%%".to_string()),
            }),
        ));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Requeue);
        assert!(fixture.cache.ldap_providers().is_empty());

        let conditions = written_conditions(&fixture);
        let tls = find(&conditions, TYPE_TLS_CONFIGURATION_VALID);
        assert_eq!(tls.status, ConditionStatus::False);
        assert_eq!(tls.reason, REASON_INVALID_TLS_CONFIG);
        assert!(tls.message.starts_with("certificateAuthorityData is invalid:"));
    }

    #[tokio::test]
    async fn test_base64_without_certificates_is_rejected() {
        let mut dialer = MockLdapDialer::new();
        dialer.expect_test_connection().never();
        dialer.expect_dry_run_authenticate_user().never();

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(
            None,
            Some(TlsSpec {
                certificate_authority_data: Some(BASE64_STANDARD.encode("just some text")),
            }),
        ));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        fixture.watcher.sync(&sync_context()).await.unwrap();
        let conditions = written_conditions(&fixture);
        let tls = find(&conditions, TYPE_TLS_CONFIGURATION_VALID);
        assert_eq!(
            tls.message,
            "certificateAuthorityData is invalid: no certificates found"
        );
    }

    #[tokio::test]
    async fn test_valid_ca_bundle_is_attached_to_the_provider_config() {
        let ca = crate::pki::CertificateAuthority::new("test CA").unwrap();
        let encoded = BASE64_STANDARD.encode(ca.bundle_pem());

        let mut dialer = MockLdapDialer::new();
        dialer
            .expect_test_connection()
            .withf(|config| config.ca_bundle.is_some())
            .times(1)
            .returning(|_| Ok(()));

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(
            None,
            Some(TlsSpec {
                certificate_authority_data: Some(encoded),
            }),
        ));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Done);

        let conditions = written_conditions(&fixture);
        let tls = find(&conditions, TYPE_TLS_CONFIGURATION_VALID);
        assert_eq!(tls.message, LOADED_TLS_CONFIGURATION_MESSAGE);
    }

    #[tokio::test]
    async fn test_connection_error_reports_condition_and_requeues() {
        let mut dialer = MockLdapDialer::new();
        dialer
            .expect_test_connection()
            .times(1)
            .returning(|_| Err(Error::ldap("connection refused")));

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(None, None));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Requeue);
        assert!(fixture.cache.ldap_providers().is_empty());

        let conditions = written_conditions(&fixture);
        let connection = find(&conditions, TYPE_LDAP_CONNECTION_VALID);
        assert_eq!(connection.status, ConditionStatus::False);
        assert_eq!(connection.reason, REASON_LDAP_CONNECTION_ERROR);
        assert!(connection.message.starts_with(
            "could not successfully connect to \"ldap.example.com:636\" and bind as user"
        ));
    }

    #[tokio::test]
    async fn test_dry_run_user_not_found_is_distinguished_from_errors() {
        let mut dialer = MockLdapDialer::new();
        dialer
            .expect_dry_run_authenticate_user()
            .times(1)
            .returning(|_, _| Ok(None));

        let fixture = fixture(dialer);
        fixture.providers.apply(provider(Some("pinny"), None));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Requeue);

        let conditions = written_conditions(&fixture);
        let connection = find(&conditions, TYPE_LDAP_CONNECTION_VALID);
        assert_eq!(connection.reason, REASON_DRY_RUN_ERROR);
        assert_eq!(
            connection.message,
            "failed authentication dry run for end user \"pinny\": user not found"
        );
    }

    /// Conditions the reconciler would have written on a previous
    /// successful pass, stamped with a recognizable old timestamp
    fn previously_successful_status(secret_version: &str) -> LdapIdentityProviderStatus {
        let old_time = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let mut conditions = vec![
            Condition {
                type_: TYPE_BIND_SECRET_VALID.to_string(),
                status: ConditionStatus::True,
                reason: REASON_SUCCESS.to_string(),
                message: "loaded bind secret".to_string(),
                last_transition_time: old_time,
                observed_generation: GENERATION,
            },
            Condition {
                type_: TYPE_LDAP_CONNECTION_VALID.to_string(),
                status: ConditionStatus::True,
                reason: REASON_SUCCESS.to_string(),
                message: format!(
                    "successfully able to connect to \"ldap.example.com:636\" and bind as user \
                     \"cn=admin,dc=example,dc=com\"{}",
                    validated_trailer(SECRET_NAME, secret_version)
                ),
                last_transition_time: old_time,
                observed_generation: GENERATION,
            },
            Condition {
                type_: TYPE_TLS_CONFIGURATION_VALID.to_string(),
                status: ConditionStatus::True,
                reason: REASON_SUCCESS.to_string(),
                message: NO_TLS_CONFIGURATION_MESSAGE.to_string(),
                last_transition_time: old_time,
                observed_generation: GENERATION,
            },
        ];
        conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
        LdapIdentityProviderStatus {
            phase: LdapIdentityProviderPhase::Ready,
            conditions,
        }
    }

    #[tokio::test]
    async fn test_already_validated_provider_skips_the_network_check() {
        let mut dialer = MockLdapDialer::new();
        dialer.expect_test_connection().never();
        dialer.expect_dry_run_authenticate_user().never();

        let mut client = MockLdapIdentityProvidersApi::new();
        // Nothing changed, so no status write may happen.
        client.expect_update_status().never();

        let fixture = fixture_with_client(dialer, client, Arc::new(Mutex::new(Vec::new())));
        let mut upstream = provider(None, None);
        upstream.status = Some(previously_successful_status(SECRET_VERSION));
        fixture.providers.apply(upstream);
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Done);

        // Still published even though no check ran.
        assert_eq!(fixture.cache.ldap_providers().len(), 1);
    }

    #[tokio::test]
    async fn test_rotated_secret_version_forces_revalidation() {
        let rotated_version = "4243";
        let mut dialer = MockLdapDialer::new();
        dialer
            .expect_test_connection()
            .times(1)
            .returning(|_| Ok(()));

        let fixture = fixture(dialer);
        let mut upstream = provider(None, None);
        upstream.status = Some(previously_successful_status(SECRET_VERSION));
        fixture.providers.apply(upstream);
        fixture.secrets.apply(bind_secret(rotated_version));

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Done);

        let conditions = written_conditions(&fixture);
        let connection = find(&conditions, TYPE_LDAP_CONNECTION_VALID);
        assert_eq!(
            validated_secret_version(&connection.message),
            Some(rotated_version)
        );
        // Status stayed True across the rewrite, so the transition time
        // must be preserved from the original condition.
        let old_time = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(connection.last_transition_time, old_time);
    }

    #[tokio::test]
    async fn test_empty_provider_list_publishes_empty_snapshot_without_requeue() {
        let mut dialer = MockLdapDialer::new();
        dialer.expect_test_connection().never();
        dialer.expect_dry_run_authenticate_user().never();

        let mut client = MockLdapIdentityProvidersApi::new();
        client.expect_update_status().never();

        let fixture = fixture_with_client(dialer, client, Arc::new(Mutex::new(Vec::new())));

        // Pre-populate the cache to prove the empty set replaces it.
        fixture.cache.set_ldap_providers(vec![Arc::new(LdapUpstream::new(
            ProviderConfig {
                name: "stale".to_string(),
                ..Default::default()
            },
            Arc::new(MockLdapDialer::new()),
        ))]);

        let action = fixture.watcher.sync(&sync_context()).await.unwrap();
        assert_eq!(action, Action::Done);
        assert!(fixture.cache.ldap_providers().is_empty());
    }

    #[tokio::test]
    async fn test_second_sync_on_unchanged_state_writes_nothing() {
        let mut dialer = MockLdapDialer::new();
        dialer
            .expect_test_connection()
            .times(1)
            .returning(|_| Ok(()));

        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockLdapIdentityProvidersApi::new();
        let capture = captured.clone();
        client
            .expect_update_status()
            .times(1)
            .returning(move |p| {
                capture.lock().unwrap().push(p.clone());
                Ok(p.clone())
            });

        let fixture = fixture_with_client(dialer, client, captured.clone());
        fixture.providers.apply(provider(None, None));
        fixture.secrets.apply(bind_secret(SECRET_VERSION));

        assert_eq!(fixture.watcher.sync(&sync_context()).await.unwrap(), Action::Done);

        // Feed the written status back through the informer, as the watch
        // stream would after the update.
        let updated = captured.lock().unwrap().last().unwrap().clone();
        fixture.providers.apply(updated);

        // Second sync: trailer matches, status unchanged, so the dialer is
        // not called again and no further status write happens.
        assert_eq!(fixture.watcher.sync(&sync_context()).await.unwrap(), Action::Done);
        assert_eq!(fixture.cache.ldap_providers().len(), 1);
    }

    #[test]
    fn test_trailer_round_trips() {
        let message = format!(
            "successfully able to connect{}",
            validated_trailer("my-secret", "123")
        );
        assert_eq!(validated_secret_version(&message), Some("123"));
    }

    #[test]
    fn test_trailer_parse_rejects_malformed_messages() {
        assert_eq!(validated_secret_version("no trailer here"), None);
        assert_eq!(
            validated_secret_version(" [validated with Secret \"x\" at version \"1\""),
            None
        );
        assert_eq!(validated_secret_version(""), None);
    }

    #[test]
    fn test_merge_replaces_same_type_and_sorts() {
        let mut existing = vec![Condition::new(
            TYPE_LDAP_CONNECTION_VALID,
            ConditionStatus::False,
            REASON_LDAP_CONNECTION_ERROR,
            "old failure",
        )];
        let had_error = merge_conditions(
            vec![
                Condition::new(
                    TYPE_TLS_CONFIGURATION_VALID,
                    ConditionStatus::True,
                    REASON_SUCCESS,
                    NO_TLS_CONFIGURATION_MESSAGE,
                ),
                Condition::new(
                    TYPE_LDAP_CONNECTION_VALID,
                    ConditionStatus::True,
                    REASON_SUCCESS,
                    "connected",
                ),
            ],
            7,
            &mut existing,
        );

        assert!(!had_error);
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[0].type_, TYPE_LDAP_CONNECTION_VALID);
        assert_eq!(existing[1].type_, TYPE_TLS_CONFIGURATION_VALID);
        assert!(existing.iter().all(|c| c.observed_generation == 7));
        // No duplicate types may survive a merge.
        let mut types: Vec<_> = existing.iter().map(|c| c.type_.clone()).collect();
        types.dedup();
        assert_eq!(types.len(), existing.len());
    }

    #[test]
    fn test_merge_updates_transition_time_only_on_status_flips() {
        let old_time = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let mut existing = vec![Condition {
            type_: TYPE_BIND_SECRET_VALID.to_string(),
            status: ConditionStatus::True,
            reason: REASON_SUCCESS.to_string(),
            message: "loaded bind secret".to_string(),
            last_transition_time: old_time,
            observed_generation: 1,
        }];

        // Same status: time preserved even though the message changed.
        merge_conditions(
            vec![Condition::new(
                TYPE_BIND_SECRET_VALID,
                ConditionStatus::True,
                REASON_SUCCESS,
                "loaded bind secret again",
            )],
            2,
            &mut existing,
        );
        assert_eq!(existing[0].last_transition_time, old_time);
        assert_eq!(existing[0].observed_generation, 2);

        // Status flip: time moves forward.
        merge_conditions(
            vec![Condition::new(
                TYPE_BIND_SECRET_VALID,
                ConditionStatus::False,
                REASON_NOT_FOUND,
                "gone",
            )],
            3,
            &mut existing,
        );
        assert!(existing[0].last_transition_time > old_time);
    }
}
