//! Configuration handling for ldap-probe.
//!
//! Settings are read from the `services.ldap` section of a YAML file, then
//! overridden by `LDAP_*` environment variables. Command line flags are
//! applied last by `main`.

use anyhow::{Context, Result};
use ldap_session::{
    make_client_config, make_client_config_with_cert, ConnectionConfig, ServerAddress,
    TlsSettings,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Server URL, ldap:// or ldaps://
    pub url: String,
    /// TCP connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Per-operation response timeout (milliseconds)
    pub response_timeout_ms: Option<u64>,
    /// How long writes wait for a reconnect (milliseconds)
    pub reconnect_timeout_ms: Option<u64>,
    /// How long a partly received message may stay incomplete (seconds)
    pub read_timeout_secs: Option<u64>,
    pub auto_reconnect: bool,
    pub auto_replay: bool,
    pub max_replays: u32,
    pub reconnect_attempts: u32,
    /// First reconnect delay (milliseconds)
    pub reconnect_backoff_ms: u64,
    /// Reconnect delay ceiling (seconds)
    pub max_reconnect_backoff_secs: u64,
    /// Upgrade with StartTLS after connecting
    pub start_tls: bool,
    pub tls: TlsConfig,
    pub bind: BindConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to CA certificate file
    pub ca_file: String,
    /// Path to client certificate file, for SASL EXTERNAL
    pub cert_file: String,
    /// Path to client private key file
    pub key_file: String,
    /// Name to verify the server certificate against
    pub server_name: Option<String>,
}

/// How the probe authenticates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// SASL mechanism (PLAIN or EXTERNAL); simple bind when unset
    pub mechanism: Option<String>,
    /// Bind DN, or authcid for PLAIN
    pub dn: String,
    pub password: String,
}

impl BindConfig {
    /// Whether any bind was requested
    pub fn is_configured(&self) -> bool {
        self.mechanism.is_some() || !self.dn.is_empty()
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "ldap://localhost:389".to_string(),
            connect_timeout_secs: 5,
            response_timeout_ms: Some(30_000),
            reconnect_timeout_ms: None,
            read_timeout_secs: Some(60),
            auto_reconnect: true,
            auto_replay: true,
            max_replays: 1,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 1_000,
            max_reconnect_backoff_secs: 30,
            start_tls: false,
            tls: TlsConfig::default(),
            bind: BindConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    ldap: Option<ProbeConfig>,
}

impl ProbeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.services.and_then(|s| s.ldap).unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(url) = std::env::var("LDAP_URL") {
            info!("URL overridden by environment: {}", url);
            self.url = url;
        }
        if let Ok(dn) = std::env::var("LDAP_BIND_DN") {
            self.bind.dn = dn;
        }
        if let Ok(password) = std::env::var("LDAP_BIND_PASSWORD") {
            self.bind.password = password;
        }
        if let Ok(mechanism) = std::env::var("LDAP_SASL_MECHANISM") {
            self.bind.mechanism = Some(mechanism);
        }
        if let Ok(ca_file) = std::env::var("LDAP_CA_FILE") {
            self.tls.ca_file = ca_file;
        }
        if let Ok(start_tls) = std::env::var("LDAP_START_TLS") {
            self.start_tls = start_tls.eq_ignore_ascii_case("true") || start_tls == "1";
        }
        if let Ok(timeout) = std::env::var("LDAP_CONNECT_TIMEOUT_SECS") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.connect_timeout_secs = secs,
                Err(_) => warn!("Ignoring invalid LDAP_CONNECT_TIMEOUT_SECS: {}", timeout),
            }
        }
    }

    fn tls_settings(&self) -> Result<Option<TlsSettings>> {
        if self.tls.ca_file.is_empty() {
            return Ok(None);
        }
        let ca_pem = std::fs::read_to_string(&self.tls.ca_file)
            .with_context(|| format!("Failed to read CA file {}", self.tls.ca_file))?;

        let client = if self.tls.cert_file.is_empty() {
            make_client_config(&ca_pem)?
        } else {
            let cert_pem = std::fs::read_to_string(&self.tls.cert_file)
                .with_context(|| format!("Failed to read certificate {}", self.tls.cert_file))?;
            let key_pem = std::fs::read_to_string(&self.tls.key_file)
                .with_context(|| format!("Failed to read private key {}", self.tls.key_file))?;
            make_client_config_with_cert(&cert_pem, &key_pem, &ca_pem)?
        };

        let mut settings = TlsSettings::new(client);
        if let Some(name) = &self.tls.server_name {
            settings = settings.with_server_name(name.clone());
        }
        Ok(Some(settings))
    }

    /// Build the connection configuration
    pub fn to_connection_config(&self) -> Result<ConnectionConfig> {
        let address = ServerAddress::parse(&self.url)
            .with_context(|| format!("Invalid LDAP URL {}", self.url))?;

        let mut config = ConnectionConfig::new(address);
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.response_timeout = self.response_timeout_ms.map(Duration::from_millis);
        config.reconnect_timeout = self.reconnect_timeout_ms.map(Duration::from_millis);
        config.read_timeout = self.read_timeout_secs.map(Duration::from_secs);
        config.auto_reconnect = self.auto_reconnect;
        config.auto_replay = self.auto_replay;
        config.max_replays = self.max_replays;
        config.reconnect_attempts = self.reconnect_attempts;
        config.reconnect_backoff = Duration::from_millis(self.reconnect_backoff_ms);
        config.max_reconnect_backoff = Duration::from_secs(self.max_reconnect_backoff_secs);
        config.use_start_tls = self.start_tls;
        config.tls = self.tls_settings()?;

        config.validate().context("Invalid connection configuration")?;
        Ok(config)
    }
}
