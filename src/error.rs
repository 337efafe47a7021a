//! Error types for the Pinniped control plane

use thiserror::Error;

/// Main error type for control-plane operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for declarative input
    #[error("validation error: {0}")]
    Validation(String),

    /// LDAP connection or search error
    #[error("ldap error: {0}")]
    Ldap(String),

    /// Certificate authority or certificate issuance error
    #[error("pki error: {0}")]
    Pki(String),

    /// TLS configuration or listener error
    #[error("tls error: {0}")]
    Tls(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an LDAP error with the given message
    pub fn ldap(msg: impl Into<String>) -> Self {
        Self::Ldap(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
