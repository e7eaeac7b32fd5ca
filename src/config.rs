//! Component configuration, loaded from TOML.
//!
//! Every field has a default so a minimal file only needs the JID. The loaded
//! value is validated once and then shared read-only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::component::element::{NS_CLIENT, NS_COMPONENT_ACCEPT};
use crate::component::error::ComponentError;
use crate::component::listener::{is_valid_host, Backoff};

fn default_namespace() -> String {
    NS_COMPONENT_ACCEPT.to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5347
}

fn default_max_connections() -> usize {
    1
}

fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    #[serde(default)]
    pub jid: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Capacity of the connection arena.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            jid: String::new(),
            namespace: default_namespace(),
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            tls: TlsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Require STARTTLS before the session starts.
    #[serde(default = "default_true")]
    pub starttls: bool,
    /// Wrap every accepted connection in TLS before the stream opens.
    #[serde(default)]
    pub implicit: bool,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// CA bundle used to verify peer certificates. Unset accepts any peer.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            starttls: true,
            implicit: false,
            cert_path: None,
            key_path: None,
            ca_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default)]
    pub kind: RetryKind,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            kind: RetryKind::Fixed,
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ComponentConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ComponentError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse without validating, so CLI overrides can be applied first.
    pub fn read(path: &Path) -> Result<Self, ComponentError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ComponentError::config(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ComponentError> {
        toml::from_str(content).map_err(|e| ComponentError::config(format!("invalid config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ComponentError> {
        if self.jid.trim().is_empty() {
            return Err(ComponentError::config("jid must not be empty"));
        }
        if !is_valid_host(&self.host) {
            return Err(ComponentError::config(format!(
                "host '{}' is neither an IP address nor a valid hostname",
                self.host
            )));
        }
        if self.namespace.is_empty() || self.namespace == NS_CLIENT {
            return Err(ComponentError::config(format!(
                "namespace must be set and differ from '{}'",
                NS_CLIENT
            )));
        }
        if self.max_connections == 0 {
            return Err(ComponentError::config("max_connections must be at least 1"));
        }
        if self.inactivity_timeout_secs == 0 {
            return Err(ComponentError::config("inactivity_timeout_secs must be at least 1"));
        }
        if self.tls_required() && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(ComponentError::config(
                "TLS is enabled but tls.cert_path and tls.key_path are not both set",
            ));
        }
        if self.retry.kind == RetryKind::Exponential && self.retry.max_delay_ms < self.retry.delay_ms {
            return Err(ComponentError::config("retry.max_delay_ms is below retry.delay_ms"));
        }
        Ok(())
    }

    /// Whether certificate material has to be loaded.
    pub fn tls_required(&self) -> bool {
        self.tls.starttls || self.tls.implicit
    }

    pub fn backoff(&self) -> Backoff {
        let delay = Duration::from_millis(self.retry.delay_ms);
        match self.retry.kind {
            RetryKind::Fixed => Backoff::Fixed(delay),
            RetryKind::Exponential => Backoff::Exponential {
                base: delay,
                max: Duration::from_millis(self.retry.max_delay_ms),
            },
        }
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ComponentConfig::from_toml_str(
            "jid = 'component.example.org'\n[tls]\ncert_path = 'c.pem'\nkey_path = 'k.pem'\n",
        )
        .unwrap();
        assert_eq!(config.namespace, NS_COMPONENT_ACCEPT);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5347);
        assert_eq!(config.max_connections, 1);
        assert!(config.tls.starttls);
        assert!(!config.tls.implicit);
        assert_eq!(config.backoff(), Backoff::Fixed(Duration::from_secs(1)));
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_without_certificate_is_rejected() {
        let config = ComponentConfig::from_toml_str("jid = 'component.example.org'").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ComponentError::Config(_)));
        assert!(err.to_string().contains("cert_path"));
    }

    #[test]
    fn test_plain_config_needs_no_certificate() {
        let config = ComponentConfig::from_toml_str(
            "jid = 'component.example.org'\n[tls]\nstarttls = false\n",
        )
        .unwrap();
        assert!(!config.tls_required());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let base = ComponentConfig {
            jid: "component.example.org".to_string(),
            tls: TlsConfig {
                starttls: false,
                ..TlsConfig::default()
            },
            ..ComponentConfig::default()
        };
        assert!(base.validate().is_ok());

        let no_jid = ComponentConfig {
            jid: "  ".to_string(),
            ..base.clone()
        };
        assert!(no_jid.validate().is_err());

        let no_slots = ComponentConfig {
            max_connections: 0,
            ..base.clone()
        };
        assert!(no_slots.validate().is_err());

        let bad_host = ComponentConfig {
            host: "not a valid host!!".to_string(),
            ..base.clone()
        };
        let err = bad_host.validate().unwrap_err();
        assert!(matches!(err, ComponentError::Config(_)));
        assert!(err.to_string().contains("not a valid host!!"));

        let ipv6_host = ComponentConfig {
            host: "::1".to_string(),
            ..base.clone()
        };
        assert!(ipv6_host.validate().is_ok());

        let client_ns = ComponentConfig {
            namespace: NS_CLIENT.to_string(),
            ..base
        };
        assert!(client_ns.validate().is_err());
    }

    #[test]
    fn test_exponential_retry_maps_to_backoff() {
        let config = ComponentConfig::from_toml_str(
            "jid = 'c.example.org'\n[retry]\nkind = 'exponential'\ndelay_ms = 250\nmax_delay_ms = 4000\n",
        )
        .unwrap();
        assert_eq!(
            config.backoff(),
            Backoff::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_millis(4000),
            }
        );
    }

    #[test]
    fn test_unknown_field_is_config_error() {
        let err = ComponentConfig::from_toml_str("jid = 'c.example.org'\nprot = 5347\n").unwrap_err();
        assert!(matches!(err, ComponentError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "jid = 'component.example.org'\nport = 5275\n\n[tls]\nstarttls = false\n"
        )
        .unwrap();
        let config = ComponentConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 5275);
        assert!(!config.tls.starttls);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = ComponentConfig::load(Path::new("/nonexistent/fluux-component.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fluux-component.toml"));
    }
}
