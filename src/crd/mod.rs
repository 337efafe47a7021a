//! Custom Resource Definitions for Pinniped
//!
//! This module contains the CRD types consumed by the controllers:
//! the LDAPIdentityProvider resource plus the shared condition and
//! phase types carried in resource statuses.

mod types;
mod upstream;

pub use types::{Condition, ConditionStatus, LdapIdentityProviderPhase};
pub use upstream::{
    BindSpec, LDAPIdentityProvider, LdapIdentityProviderSpec, LdapIdentityProviderStatus, TlsSpec,
    UserSearchAttributes, UserSearchSpec,
};
