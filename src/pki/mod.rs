//! In-process certificate authority for the impersonation proxy
//!
//! The impersonator serves TLS on whatever address the cluster hands its
//! load balancer, so certificates cannot be provisioned ahead of time.
//! Instead the proxy owns a private CA, generated in memory on first use
//! and kept for the process lifetime, and issues short-lived server
//! certificates bound to the currently observed serving IPs. Clients are
//! expected to trust the CA bundle published alongside the certificates.

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::Error;

/// Server certificates are valid for one day; the reconciler reissues
/// whenever the serving address changes.
const SERVER_CERT_VALIDITY: TimeDuration = TimeDuration::hours(24);

/// The CA outlives any server cert it signs; ten years is effectively
/// "the process lifetime and then some".
const CA_VALIDITY: TimeDuration = TimeDuration::days(3650);

/// A freshly issued server certificate and its private key
#[derive(Clone, Debug)]
pub struct ServerCert {
    /// PEM-encoded leaf certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

/// Certificate authority issuing serving certificates for the impersonator
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair is not Clone, so it is
    /// re-parsed per issuance)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution as the trust bundle
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Generate a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self, Error> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Pinniped".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        // Back-date slightly so clients with modest clock skew accept it.
        params.not_before = now - TimeDuration::minutes(5);
        params.not_after = now + CA_VALIDITY;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate CA key: {e}")))?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::pki(format!("failed to create CA cert: {e}")))?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// The CA certificate in PEM format (the `ca.crt` trust bundle)
    pub fn bundle_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issue a 24-hour server certificate bound to the given IP addresses
    pub fn issue_server_cert(&self, ips: &[IpAddr]) -> Result<ServerCert, Error> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate server key: {e}")))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("Pinniped Impersonation Proxy".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = ips.iter().map(|ip| SanType::IpAddress(*ip)).collect();

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(5);
        params.not_after = now + SERVER_CERT_VALIDITY;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| Error::pki(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|e| Error::pki(format!("failed to create issuer: {e}")))?;

        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| Error::pki(format!("failed to sign server cert: {e}")))?;

        Ok(ServerCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Whether the PEM-encoded certificate carries `ip` as a subject
/// alternative name
///
/// Used to decide if a stored TLS secret still matches the currently
/// observed serving address. Any parse failure counts as "does not
/// cover" so damaged secrets are regenerated rather than trusted.
pub fn cert_covers_ip(cert_pem: &[u8], ip: IpAddr) -> bool {
    let Ok(parsed) = ::pem::parse(cert_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(parsed.contents()) else {
        return false;
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return false;
    };

    san.value.general_names.iter().any(|name| match name {
        GeneralName::IPAddress(bytes) => match (bytes.len(), ip) {
            (4, IpAddr::V4(v4)) => **bytes == v4.octets(),
            (16, IpAddr::V6(v6)) => **bytes == v6.octets(),
            _ => false,
        },
        _ => false,
    })
}
