//! Proxy configuration.
//!
//! Flags mirror the environment variables so the proxy can run from a
//! command line or a container spec alike.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::proxy::ListenerConfig;
use crate::tls::TlsPolicy;

/// TLS-terminating proxy for PostgreSQL requiring client certificates.
#[derive(Debug, Clone, Parser)]
#[command(name = "pgssl")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Listen address.
    #[arg(
        short = 'l',
        long = "listen",
        env = "PGSSL_LISTEN_ADDR",
        default_value = "127.0.0.1:15432"
    )]
    pub listen_addr: SocketAddr,

    /// Postgres address (host:port).
    #[arg(
        short = 'p',
        long = "postgres",
        env = "PGSSL_POSTGRES_ADDR",
        value_parser = parse_host_port
    )]
    pub postgres_addr: String,

    /// PEM bundle of CAs trusted to sign client certificates.
    #[arg(short = 'c', long = "ca-cert", env = "PGSSL_CA_CERT")]
    pub ca_cert: PathBuf,

    /// PEM certificate chain presented to clients.
    #[arg(long = "cert", env = "PGSSL_SERVER_CERT")]
    pub server_cert: PathBuf,

    /// PEM private key for the server certificate.
    #[arg(long = "key", env = "PGSSL_SERVER_KEY")]
    pub server_key: PathBuf,

    /// Backend connect timeout in milliseconds.
    #[arg(long, env = "PGSSL_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// Limit on SSL negotiation plus TLS handshake in milliseconds (0 disables).
    #[arg(long, env = "PGSSL_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    pub handshake_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "PGSSL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Backend connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Negotiation plus handshake limit, `None` when disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.handshake_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr);
        config.handshake_timeout = self.handshake_timeout();
        config
    }

    /// Load the server identity and trusted client roots.
    pub fn load_tls_policy(&self) -> Result<TlsPolicy, ConfigError> {
        TlsPolicy::from_pem_files(&self.server_cert, &self.server_key, &self.ca_cert)
    }
}

/// Accept `host:port` with a numeric port. The host is resolved at dial time.
fn parse_host_port(s: &str) -> Result<String, String> {
    let Some((host, port)) = s.rsplit_once(':') else {
        return Err(format!("missing port in '{}'", s));
    };
    if host.is_empty() {
        return Err(format!("missing host in '{}'", s));
    }
    port.parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", port))?;
    Ok(s.to_string())
}
