//! LDAP connection probe.
//!
//! Opens a connection with the configured transport security, optionally
//! binds, asks the server "Who am I?" and reports what happened. Useful for
//! checking reachability, TLS setup and credentials in one step.

use anyhow::{bail, Context};
use clap::Parser;
use ldap_session::{Connection, External, Plain};
use ldap_wire::{BindRequest, Filter, Request, SearchRequest, SearchScope};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ProbeConfig;
use logging::LdapLogFormatter;

/// Probe an LDAP server
#[derive(Parser, Debug)]
#[command(name = "ldap-probe", version, about = "Connect, bind and identify against an LDAP server")]
struct Args {
    /// Server URL, e.g. ldap://localhost:389 or ldaps://ldap.example.com
    #[arg(long)]
    url: Option<String>,

    /// Bind DN (simple bind) or authentication ID (SASL PLAIN)
    #[arg(long)]
    bind_dn: Option<String>,

    /// Bind password
    #[arg(long, env = "LDAP_BIND_PASSWORD", hide_env_values = true)]
    bind_password: Option<String>,

    /// SASL mechanism: PLAIN or EXTERNAL
    #[arg(long)]
    sasl: Option<String>,

    /// Upgrade the connection with StartTLS
    #[arg(long)]
    start_tls: bool,

    /// Path to CA certificate file (PEM format)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Path to client certificate file (PEM format)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to client private key file (PEM format)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Server name for certificate verification
    #[arg(long)]
    tls_sni: Option<String>,

    /// Connect timeout, e.g. 5s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Response timeout per operation, e.g. 30s
    #[arg(long)]
    response_timeout: Option<humantime::Duration>,

    /// Read this entry with a base search after binding
    #[arg(long)]
    read: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

impl Args {
    /// Flags win over file and environment settings
    fn apply(&self, config: &mut ProbeConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(dn) = &self.bind_dn {
            config.bind.dn = dn.clone();
        }
        if let Some(password) = &self.bind_password {
            config.bind.password = password.clone();
        }
        if let Some(mechanism) = &self.sasl {
            config.bind.mechanism = Some(mechanism.clone());
        }
        if self.start_tls {
            config.start_tls = true;
        }
        if let Some(ca) = &self.tls_ca {
            config.tls.ca_file = ca.display().to_string();
        }
        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            config.tls.cert_file = cert.display().to_string();
            config.tls.key_file = key.display().to_string();
        }
        if let Some(sni) = &self.tls_sni {
            config.tls.server_name = Some(sni.clone());
        }
        if let Some(timeout) = &self.connect_timeout {
            config.connect_timeout_secs = timeout.as_secs().max(1);
        }
        if let Some(timeout) = &self.response_timeout {
            config.response_timeout_ms = Some(timeout.as_millis() as u64);
        }
        // A probe reports failures rather than hiding them behind retries
        config.auto_reconnect = false;
    }
}

async fn bind(conn: &Connection, config: &ProbeConfig) -> anyhow::Result<()> {
    let bind = &config.bind;
    let result = match bind.mechanism.as_deref().map(str::to_ascii_uppercase).as_deref() {
        None => {
            conn.bind(BindRequest::simple(bind.dn.clone(), bind.password.clone()))
                .await?
        }
        Some("PLAIN") => {
            let mut plain = Plain::new(bind.dn.clone(), bind.password.clone());
            conn.sasl_bind(&mut plain).await?
        }
        Some("EXTERNAL") => conn.sasl_bind(&mut External::new()).await?,
        Some(other) => bail!("Unsupported SASL mechanism: {}", other),
    };

    if !result.is_success() {
        let diagnostic = result
            .result()
            .map(|r| r.diagnostic_message.clone())
            .unwrap_or_default();
        bail!("Bind failed: {:?} {}", result.code(), diagnostic);
    }
    info!("Bind succeeded");
    Ok(())
}

async fn read_entry(conn: &Connection, dn: &str) -> anyhow::Result<()> {
    let search = SearchRequest::new(dn, SearchScope::Base, Filter::present("objectClass"));
    let result = conn.operation(Request::Search(search)).execute().await?;
    if !result.is_success() {
        warn!("Read of {} returned {:?}", dn, result.code());
    }
    for entry in &result.entries {
        println!("dn: {}", entry.dn);
        for attribute in &entry.attributes {
            for value in &attribute.values {
                println!("{}: {}", attribute.name, String::from_utf8_lossy(value));
            }
        }
    }
    for referral in result.referrals() {
        println!("referral: {}", referral);
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("ldap_probe={}", args.log_level).parse()?)
        .add_directive(format!("ldap_session={}", args.log_level).parse()?)
        .add_directive(format!("ldap_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(LdapLogFormatter::new())
        .init();

    info!("ldap-probe v{}", env!("CARGO_PKG_VERSION"));

    let mut probe = ProbeConfig::load_from_file(&args.config)?;
    args.apply(&mut probe);
    let config = probe.to_connection_config()?;

    let conn = Connection::new(config);
    conn.open()
        .await
        .with_context(|| format!("Failed to open {}", probe.url))?;
    info!(
        "Connected to {} (tls: {})",
        conn.address(),
        conn.is_tls()
    );

    let outcome = async {
        if probe.bind.is_configured() {
            bind(&conn, &probe).await?;
            if conn.has_security_layer() {
                info!("SASL security layer active");
            }
        }

        let identity = conn.who_am_i().await.context("Who am I? failed")?;
        if identity.is_empty() {
            println!("anonymous");
        } else {
            println!("{}", identity);
        }

        if let Some(dn) = &args.read {
            read_entry(&conn, dn).await?;
        }
        anyhow::Ok(())
    }
    .await;

    conn.close().await;
    info!("Connection closed");
    outcome
}
