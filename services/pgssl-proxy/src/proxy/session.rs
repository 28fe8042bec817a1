//! Per-connection session.
//!
//! A session walks one client connection through
//!
//! ```text
//! New -> Negotiating -> Handshaking -> Connected -> Relaying -> Closed
//!            \              \              \            \
//!             +--------------+--------------+------------+--> Failed -> Closed
//! ```
//!
//! Sockets are owned by the phase that uses them and dropped as soon as the
//! session leaves it, so every exit path releases whatever was acquired.
//! The backend is dialed only after the client has presented a verified
//! certificate.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::backend::BackendDialer;
use super::negotiation::negotiate;
use super::relay::{relay, RelayStats};
use crate::error::{NegotiationError, SessionError};
use crate::tls::TlsPolicy;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    Negotiating,
    Handshaking,
    Connected,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (New, Negotiating)
                | (Negotiating, Handshaking)
                | (Handshaking, Connected)
                | (Connected, Relaying)
                | (Relaying, Closed)
                | (Failed, Closed)
                | (New | Negotiating | Handshaking | Connected | Relaying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Negotiating => "negotiating",
            SessionState::Handshaking => "handshaking",
            SessionState::Connected => "connected",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happened to a finished session.
#[derive(Debug)]
pub struct SessionReport {
    /// Connection sequence id.
    pub id: u64,
    /// Final state. Always [`SessionState::Closed`].
    pub state: SessionState,
    /// Phase the session was in when it failed.
    pub failed_in: Option<SessionState>,
    /// Bytes relayed before the session ended.
    pub stats: RelayStats,
    /// Why the session failed.
    pub error: Option<SessionError>,
}

/// One accepted client connection.
pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    client: TcpStream,
    policy: Arc<TlsPolicy>,
    dialer: Arc<dyn BackendDialer>,
    handshake_timeout: Option<Duration>,
    state: SessionState,
}

impl Session {
    /// Create a session for an accepted client socket.
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        client: TcpStream,
        policy: Arc<TlsPolicy>,
        dialer: Arc<dyn BackendDialer>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            client,
            policy,
            dialer,
            handshake_timeout: None,
            state: SessionState::New,
        }
    }

    /// Bound negotiation plus TLS handshake. `None` waits forever.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Option<Duration>) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Drive the session to completion.
    pub async fn run(self) -> SessionReport {
        let Session {
            id,
            peer_addr: _,
            client,
            policy,
            dialer,
            handshake_timeout,
            state,
        } = self;

        let mut tracker = Tracker { state };
        let mut stats = RelayStats::default();

        let result = drive(
            &mut tracker,
            &mut stats,
            client,
            &policy,
            dialer.as_ref(),
            handshake_timeout,
        )
        .await;

        let failed_in = match &result {
            Ok(()) => None,
            Err(_) => {
                let phase = tracker.state;
                tracker.advance(SessionState::Failed);
                Some(phase)
            }
        };
        tracker.advance(SessionState::Closed);

        SessionReport {
            id,
            state: tracker.state,
            failed_in,
            stats,
            error: result.err(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("backend", &self.dialer.addr())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

struct Tracker {
    state: SessionState,
}

impl Tracker {
    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        trace!(from = %self.state, to = %next, "Session state change");
        self.state = next;
    }
}

async fn drive(
    tracker: &mut Tracker,
    stats: &mut RelayStats,
    mut client: TcpStream,
    policy: &TlsPolicy,
    dialer: &dyn BackendDialer,
    handshake_timeout: Option<Duration>,
) -> Result<(), SessionError> {
    let deadline = handshake_timeout.map(|limit| (Instant::now() + limit, limit));

    tracker.advance(SessionState::Negotiating);
    match within(deadline, negotiate(&mut client)).await {
        Some(result) => result?,
        None => return Err(NegotiationError::Timeout(limit_of(deadline)).into()),
    };

    tracker.advance(SessionState::Handshaking);
    let tls = match within(deadline, policy.accept(client)).await {
        Some(result) => result.map_err(SessionError::Handshake)?,
        None => return Err(SessionError::HandshakeTimeout(limit_of(deadline))),
    };
    {
        let (_, conn) = tls.get_ref();
        debug!(
            protocol = ?conn.protocol_version(),
            cipher_suite = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            client_certs = conn.peer_certificates().map_or(0, |certs| certs.len()),
            "TLS handshake complete"
        );
    }

    tracker.advance(SessionState::Connected);
    let backend = dialer
        .dial()
        .await
        .map_err(|source| SessionError::BackendDial {
            addr: dialer.addr().to_string(),
            source,
        })?;

    tracker.advance(SessionState::Relaying);
    let outcome = relay(tls, backend).await;
    *stats = outcome.stats;

    match outcome.error {
        Some(e) => Err(SessionError::Relay(e)),
        None => Ok(()),
    }
}

/// Run `fut` before `deadline`, or forever when there is none.
async fn within<F: Future>(
    deadline: Option<(Instant, Duration)>,
    fut: F,
) -> Option<F::Output> {
    match deadline {
        Some((at, _)) => timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn limit_of(deadline: Option<(Instant, Duration)>) -> Duration {
    deadline.map_or(Duration::ZERO, |(_, limit)| limit)
}
