//! Declarative configuration for the impersonation proxy
//!
//! Operators configure the proxy through a ConfigMap holding a small YAML
//! document under the `config.yaml` key. An absent ConfigMap means "all
//! defaults"; a present but unparsable one is an error the reconciler
//! surfaces rather than guessing.

use std::net::IpAddr;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::Deserialize;

use crate::Error;

/// ConfigMap data key holding the YAML configuration document
pub const CONFIG_MAP_KEY: &str = "config.yaml";

/// Operating mode of the impersonation proxy
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImpersonationProxyMode {
    /// Run only when the cluster gives no other way to reach the API
    /// (no visible control-plane nodes)
    #[default]
    Auto,
    /// Always run
    Enabled,
    /// Never run
    Disabled,
}

/// Parsed impersonation proxy configuration
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImpersonationProxyConfig {
    /// When the proxy should run
    #[serde(default)]
    pub mode: ImpersonationProxyMode,

    /// Externally managed address clients use to reach the proxy. When
    /// set, no load balancer is provisioned.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ImpersonationProxyConfig {
    /// Parse the configuration out of the ConfigMap, or return defaults
    /// when no ConfigMap is given
    pub fn from_config_map(config_map: Option<&ConfigMap>) -> Result<Self, Error> {
        let Some(config_map) = config_map else {
            return Ok(Self::default());
        };
        let yaml = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(CONFIG_MAP_KEY))
            .ok_or_else(|| {
                Error::validation(format!(
                    "invalid impersonator configuration: missing ConfigMap key {CONFIG_MAP_KEY:?}"
                ))
            })?;
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::validation(format!("invalid impersonator configuration: {e}")))
    }

    /// The configured endpoint, if any non-empty value was given
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    /// The configured endpoint parsed as an IP address
    ///
    /// Hostname endpoints yield `None`; the proxy cannot issue a serving
    /// certificate for an address it cannot name by IP.
    pub fn endpoint_ip(&self) -> Option<IpAddr> {
        self.endpoint().and_then(|e| e.parse().ok())
    }
}
