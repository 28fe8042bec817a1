//! pgssl
//!
//! TLS-terminating proxy in front of a PostgreSQL server.
//!
//! This service:
//! - Answers the PostgreSQL SSLRequest and upgrades the client to TLS
//! - Requires a client certificate signed by the configured CA bundle
//! - Connects to the backend only after the client is verified
//! - Relays the decrypted byte stream to the backend unchanged

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pgssl_proxy::{Config, ProxyServer, TcpDialer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to PGSSL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting pgssl proxy");
    info!(
        listen_addr = %config.listen_addr,
        postgres_addr = %config.postgres_addr,
        ca_cert = %config.ca_cert.display(),
        server_cert = %config.server_cert.display(),
        "Configuration loaded"
    );

    let policy = config
        .load_tls_policy()
        .context("failed to load TLS certificates")?;
    let dialer = Arc::new(TcpDialer::with_timeout(
        config.postgres_addr.clone(),
        config.connect_timeout(),
    ));

    let server = ProxyServer::bind(config.listener_config(), Arc::new(policy), dialer)
        .await
        .context("failed to bind listener")?;

    Arc::new(server).run().await?;
    Ok(())
}
