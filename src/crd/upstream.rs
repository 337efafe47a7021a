//! LDAPIdentityProvider Custom Resource Definition
//!
//! An LDAPIdentityProvider declares an upstream LDAP directory that end
//! users may authenticate against. The upstream watcher controller
//! validates each declaration (bind secret, TLS trust bundle, live
//! connectivity) and reports the outcome through status conditions.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LdapIdentityProviderPhase};

/// Specification for an LDAPIdentityProvider
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "idp.pinniped.dev",
    version = "v1alpha1",
    kind = "LDAPIdentityProvider",
    plural = "ldapidentityproviders",
    shortname = "ldapidp",
    status = "LdapIdentityProviderStatus",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LdapIdentityProviderSpec {
    /// Host and optional port of the LDAP server, e.g. "ldap.example.com:636"
    pub host: String,

    /// How to search for end users in the directory
    pub user_search: UserSearchSpec,

    /// TLS configuration for connecting to the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    /// Reference to the secret holding the service account bind credentials
    pub bind: BindSpec,

    /// When set, validation searches for this end user instead of only binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_authentication_username: Option<String>,
}

/// User search configuration for an LDAP upstream
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSearchSpec {
    /// Search base DN, e.g. "ou=users,dc=example,dc=com"
    pub base: String,

    /// Search filter; "{}" is replaced by the end user's username.
    /// Defaults to an equality match on the username attribute.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,

    /// Entry attributes to read from a matched user
    pub attributes: UserSearchAttributes,
}

/// Attribute names resolved from a matched user entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSearchAttributes {
    /// Attribute whose value becomes the downstream username
    pub username: String,

    /// Attribute whose value becomes the downstream user UID
    pub uid: String,
}

/// TLS configuration for the upstream connection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Base64-encoded PEM bundle of CA certificates to trust
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// Reference to the bind credentials secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindSpec {
    /// Name of a kubernetes.io/basic-auth secret in the provider's namespace
    pub secret_name: String,
}

/// Status for an LDAPIdentityProvider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LdapIdentityProviderStatus {
    /// Current validation phase
    #[serde(default)]
    pub phase: LdapIdentityProviderPhase,

    /// Conditions representing the outcome of each validation check
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
