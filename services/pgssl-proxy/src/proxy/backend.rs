//! Backend connection setup.
//!
//! The backend is a single fixed address. The leg toward it is plain TCP;
//! the proxy only terminates the client-facing TLS.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens connections to the backend.
#[async_trait]
pub trait BackendDialer: Send + Sync + 'static {
    /// Backend address, for operator logs only.
    fn addr(&self) -> &str;

    /// Open a new connection to the backend.
    async fn dial(&self) -> io::Result<TcpStream>;
}

/// Dials a fixed `host:port` over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer for `addr` with the default connect timeout.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Create a dialer with a custom connect timeout.
    pub fn with_timeout(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl BackendDialer for TcpDialer {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        debug!(backend_addr = %self.addr, "Connecting to backend");

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timeout",
                ))
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
