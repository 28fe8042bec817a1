//! Listener and accept loop.
//!
//! Every accepted connection gets the next sequence id and its own task.
//! There is no admission limit: sessions fan out without bound and share
//! nothing mutable except the statistics counters.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::BackendDialer;
use super::session::{Session, SessionReport};
use crate::error::{BindError, ProxyError, SessionError};
use crate::tls::TlsPolicy;

/// Default bound on SSL negotiation plus TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

/// Configuration for the listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Bound on negotiation plus handshake for each session.
    pub handshake_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Statistics for the proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished, successfully or not.
    pub connections_closed: AtomicU64,
    /// Clients that did not send a valid SSLRequest.
    pub negotiation_failed: AtomicU64,
    /// TLS handshake or client certificate failures.
    pub handshake_failed: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Relays that ended on an I/O error.
    pub relay_errors: AtomicU64,
    /// Bytes relayed to the backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed to clients.
    pub bytes_to_client: AtomicU64,
}

impl ProxyStats {
    fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    fn record_close(&self, report: &SessionReport) {
        self.bytes_to_backend
            .fetch_add(report.stats.bytes_to_backend, Ordering::Relaxed);
        self.bytes_to_client
            .fetch_add(report.stats.bytes_to_client, Ordering::Relaxed);

        let counter = match &report.error {
            None => None,
            Some(SessionError::Negotiation(_)) => Some(&self.negotiation_failed),
            Some(SessionError::Handshake(_) | SessionError::HandshakeTimeout(_)) => {
                Some(&self.handshake_failed)
            }
            Some(SessionError::BackendDial { .. }) => Some(&self.backend_failed),
            Some(SessionError::Relay(_)) => Some(&self.relay_errors),
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        // Published last so a reader that sees the close sees the rest.
        self.connections_closed.fetch_add(1, Ordering::Release);
    }
}

/// TLS-terminating PostgreSQL proxy listener.
pub struct ProxyServer {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Shared, read-only TLS policy.
    policy: Arc<TlsPolicy>,
    /// Backend dialer.
    dialer: Arc<dyn BackendDialer>,
    /// Statistics.
    stats: Arc<ProxyStats>,
}

impl ProxyServer {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        policy: Arc<TlsPolicy>,
        dialer: Arc<dyn BackendDialer>,
    ) -> Result<Self, BindError> {
        let bind_err = |source: io::Error| BindError {
            addr: config.bind_addr,
            source,
        };
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(
            bind_addr = %local_addr,
            backend_addr = %dialer.addr(),
            trusted_roots = policy.trusted_roots(),
            "Listening"
        );

        Ok(Self {
            config,
            listener,
            policy,
            dialer,
            stats: Arc::new(ProxyStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get proxy statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Accept connections until accepting fails.
    ///
    /// An accept error is returned to the caller rather than retried.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let mut next_id: u64 = 0;

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    return Err(ProxyError::Accept(e));
                }
            };

            next_id += 1;
            let conn_id = next_id;
            self.stats.record_accept();
            info!(conn_id, peer_addr = %peer_addr, "Accepted connection");

            if let Err(e) = stream.set_nodelay(true) {
                debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
            }

            let session = Session::new(
                conn_id,
                peer_addr,
                stream,
                Arc::clone(&self.policy),
                Arc::clone(&self.dialer),
            )
            .with_handshake_timeout(self.config.handshake_timeout);
            let stats = Arc::clone(&self.stats);

            tokio::spawn(
                async move {
                    let report = session.run().await;
                    stats.record_close(&report);

                    if let Some(e) = &report.error {
                        warn!(
                            kind = e.kind(),
                            phase = ?report.failed_in,
                            error = %e,
                            "Error in connection"
                        );
                    }
                    info!(
                        peer_addr = %peer_addr,
                        bytes_to_backend = report.stats.bytes_to_backend,
                        bytes_to_client = report.stats.bytes_to_client,
                        "Closed connection"
                    );
                }
                .instrument(tracing::info_span!("session", conn_id, peer = %peer_addr)),
            );
        }
    }
}
