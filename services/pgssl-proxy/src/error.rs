//! Error types for the proxy.
//!
//! Startup errors ([`ConfigError`], [`BindError`]) are fatal to the process.
//! Everything under [`SessionError`] is scoped to a single connection and is
//! logged with that connection's id, never propagated to the accept loop.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Bad certificate material or paths at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The server certificate file held no certificate.
    #[error("no certificate found in {0}")]
    NoCertificates(String),

    /// The server key file held no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    /// The CA bundle held no parsable root certificate.
    #[error("failed to parse root certificate from {0}")]
    NoTrustedRoots(String),

    /// PEM data could not be decoded.
    #[error("malformed PEM in {what}: {source}")]
    Pem {
        what: String,
        #[source]
        source: io::Error,
    },

    /// The client certificate verifier could not be built.
    #[error("invalid client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// rustls rejected the server identity or protocol setup.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// The listening socket could not be created.
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// The first packet was not a well-formed SSLRequest.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The client closed before sending a full request.
    #[error("client closed before sending SSLRequest")]
    Closed,

    /// Length field was not 8.
    #[error("unexpected startup packet length {0}")]
    UnexpectedLength(u32),

    /// Request code was not the SSLRequest code.
    #[error("unexpected request code {0:#010x}")]
    UnexpectedCode(u32),

    /// The client did not finish negotiating in time.
    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),

    /// Socket error while reading or replying.
    #[error("negotiation I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for NegotiationError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            NegotiationError::Closed
        } else {
            NegotiationError::Io(err)
        }
    }
}

/// A per-connection failure. Contained within its session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// TLS handshake or client certificate verification failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The backend could not be reached. Only ever logged, never sent to the client.
    #[error("failed to connect to backend {addr}: {source}")]
    BackendDial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure while relaying. A clean end of stream is not an error.
    #[error("relay I/O error: {0}")]
    Relay(#[source] io::Error),
}

impl SessionError {
    /// Short stable label for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Negotiation(_) => "negotiation",
            SessionError::Handshake(_) | SessionError::HandshakeTimeout(_) => "tls_handshake",
            SessionError::BackendDial { .. } => "backend_dial",
            SessionError::Relay(_) => "relay_io",
        }
    }
}

/// Fatal errors from the listener.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Bind(#[from] BindError),

    /// Accepting a connection failed. The accept loop does not recover from this.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}
