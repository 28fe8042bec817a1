//! TLS-terminating PostgreSQL proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyServer -> Session: SSLRequest -> TLS (client cert) -> Dial -> Relay -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ListenerConfig, ProxyServer, TcpDialer};
//!
//! let policy = Arc::new(TlsPolicy::from_pem_files("server.pem", "server.key", "ca.pem")?);
//! let dialer = Arc::new(TcpDialer::new("127.0.0.1:5432"));
//!
//! let config = ListenerConfig::new("127.0.0.1:15432".parse()?);
//! let server = ProxyServer::bind(config, policy, dialer).await?;
//! Arc::new(server).run().await?;
//! ```

mod backend;
mod negotiation;
mod relay;
mod server;
mod session;

pub use backend::{BackendDialer, TcpDialer, DEFAULT_CONNECT_TIMEOUT};
pub use negotiation::{negotiate, SslRequest, SSL_ACCEPT, SSL_REQUEST_CODE, SSL_REQUEST_LEN};
pub use relay::{relay, RelayOutcome, RelayStats, RELAY_BUFFER_SIZE, SHUTDOWN_TIMEOUT};
pub use server::{ListenerConfig, ProxyServer, ProxyStats, DEFAULT_HANDSHAKE_TIMEOUT};
pub use session::{Session, SessionReport, SessionState};
