pub mod config;
pub mod error;
pub mod proxy;
pub mod tls;

pub use config::Config;
pub use error::{BindError, ConfigError, NegotiationError, ProxyError, SessionError};
pub use proxy::{
    BackendDialer, ListenerConfig, ProxyServer, ProxyStats, RelayStats, Session, SessionReport,
    SessionState, SslRequest, TcpDialer,
};
pub use tls::TlsPolicy;
