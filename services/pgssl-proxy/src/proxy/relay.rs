//! Bidirectional relay with coupled shutdown.
//!
//! Two copy loops run concurrently, one per direction. When either loop
//! sees end of stream or an error it raises a shared stop signal, which ends
//! the other loop even if it is parked on a read from a silent peer. Both
//! loops are joined and both write halves are shut down before returning.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

/// Per-direction relay buffer size.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Limit on each write-half shutdown once the copy loops have stopped.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied client -> backend.
    pub bytes_to_backend: u64,
    /// Bytes copied backend -> client.
    pub bytes_to_client: u64,
}

/// Outcome of a relay: byte counts plus the first I/O error, if any.
#[derive(Debug)]
pub struct RelayOutcome {
    pub stats: RelayStats,
    pub error: Option<io::Error>,
}

/// Relay between `client` and `backend` until either side ends.
///
/// Bytes are forwarded in the order received. Neither half is left open:
/// when this returns, both streams have been shut down and dropped.
pub async fn relay<C, B>(client: C, backend: B) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let (stop_tx, stop_rx) = watch::channel(false);

    let upstream = copy_until_stopped(
        &mut client_read,
        &mut backend_write,
        &stop_tx,
        stop_rx.clone(),
    );
    let downstream = copy_until_stopped(&mut backend_read, &mut client_write, &stop_tx, stop_rx);

    let (up, down) = tokio::join!(upstream, downstream);

    // Best effort; the peer may already be gone. The backend is released
    // before the client's close_notify, which stalls if the client stopped reading.
    if timeout(SHUTDOWN_TIMEOUT, backend_write.shutdown()).await.is_err() {
        debug!("Backend shutdown timed out");
    }
    drop(backend_read);
    drop(backend_write);
    if timeout(SHUTDOWN_TIMEOUT, client_write.shutdown()).await.is_err() {
        debug!("Client shutdown timed out");
    }

    let stats = RelayStats {
        bytes_to_backend: up.bytes,
        bytes_to_client: down.bytes,
    };
    debug!(
        bytes_to_backend = stats.bytes_to_backend,
        bytes_to_client = stats.bytes_to_client,
        "Relay finished"
    );

    RelayOutcome {
        stats,
        error: up.error.or(down.error),
    }
}

struct Copied {
    bytes: u64,
    error: Option<io::Error>,
}

async fn copy_until_stopped<R, W>(
    reader: &mut R,
    writer: &mut W,
    stop_tx: &watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
) -> Copied
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let error = loop {
        let n = tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => break None,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) if is_clean_close(&e) => break None,
                Err(e) => break Some(e),
            },
        };

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => break None,
            written = write => {
                if let Err(e) = written {
                    break Some(e);
                }
            }
        }
        bytes += n as u64;
    };

    stop_tx.send_replace(true);
    Copied { bytes, error }
}

/// A TLS peer closing its socket without close_notify.
fn is_clean_close(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_relay_both_directions_in_order() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let relay_task = tokio::spawn(relay(client, backend));

        let upstream: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let downstream: Vec<u8> = (0..30_000u32).map(|i| (i % 241) as u8).collect();

        let up = upstream.clone();
        let writer = tokio::spawn(async move {
            client_peer.write_all(&up).await.unwrap();
            let mut received = vec![0u8; 30_000];
            client_peer.read_exact(&mut received).await.unwrap();
            (client_peer, received)
        });

        let mut received = vec![0u8; upstream.len()];
        backend_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, upstream);
        backend_peer.write_all(&downstream).await.unwrap();

        let (client_peer, client_received) =
            timeout(TEST_TIMEOUT, writer).await.unwrap().unwrap();
        assert_eq!(client_received, downstream);

        drop(client_peer);
        let outcome = timeout(TEST_TIMEOUT, relay_task).await.unwrap().unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.stats.bytes_to_backend, 50_000);
        assert_eq!(outcome.stats.bytes_to_client, 30_000);
    }

    #[tokio::test]
    async fn test_client_close_closes_backend() {
        let (client, client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);

        let relay_task = tokio::spawn(relay(client, backend));
        drop(client_peer);

        let mut buf = [0u8; 8];
        let n = timeout(TEST_TIMEOUT, backend_peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let outcome = timeout(TEST_TIMEOUT, relay_task).await.unwrap().unwrap();
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_backend_close_closes_silent_client() {
        let (client, mut client_peer) = duplex(64);
        let (backend, backend_peer) = duplex(64);

        let relay_task = tokio::spawn(relay(client, backend));

        // The client never sends anything; the upstream loop must still end.
        drop(backend_peer);

        let mut buf = [0u8; 8];
        let n = timeout(TEST_TIMEOUT, client_peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        timeout(TEST_TIMEOUT, relay_task).await.unwrap().unwrap();
    }

    #[test]
    fn test_unexpected_eof_is_clean() {
        assert!(is_clean_close(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_clean_close(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_read_error_reported() {
        let client = tokio_test::io::Builder::new()
            .read(b"abc")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let (backend, mut backend_peer) = duplex(64);

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            backend_peer.read_to_end(&mut received).await.unwrap();
            received
        });

        let outcome = timeout(TEST_TIMEOUT, relay(client, backend)).await.unwrap();
        assert_eq!(
            outcome.error.map(|e| e.kind()),
            Some(io::ErrorKind::ConnectionReset)
        );
        assert_eq!(outcome.stats.bytes_to_backend, 3);
        assert_eq!(reader.await.unwrap(), b"abc");
    }

    /// Stream whose shutdown never completes, like a TLS peer that stopped reading.
    struct StuckShutdown<S>(S);

    impl<S: AsyncRead + Unpin> AsyncRead for StuckShutdown<S> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for StuckShutdown<S> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_client_shutdown_releases_backend() {
        let (client, client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);

        let relay_task = tokio::spawn(relay(StuckShutdown(client), backend));
        drop(client_peer);

        // The backend sees end of stream while the client shutdown is still pending.
        let mut received = Vec::new();
        timeout(Duration::from_millis(100), backend_peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
        assert!(!relay_task.is_finished());

        let outcome = timeout(SHUTDOWN_TIMEOUT * 2, relay_task)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.error.is_none());
    }
}
