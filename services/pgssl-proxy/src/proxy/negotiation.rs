//! PostgreSQL SSL negotiation.
//!
//! Before the real startup message, a PostgreSQL client may ask whether the
//! server speaks TLS by sending an 8-byte SSLRequest:
//!
//! ```text
//! +----------------+----------------+
//! | length (u32be) | code (u32be)   |
//! |       8        |   80877103     |
//! +----------------+----------------+
//! ```
//!
//! The server answers with a single byte, `'S'` to accept. This proxy only
//! terminates TLS, so any other first packet is rejected without a reply.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::NegotiationError;

/// Length field of an SSLRequest packet.
pub const SSL_REQUEST_LEN: u32 = 8;

/// Request code identifying an SSLRequest (1234 << 16 | 5679).
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Reply byte accepting TLS.
pub const SSL_ACCEPT: u8 = b'S';

/// An accepted SSLRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SslRequest;

impl SslRequest {
    /// Wire encoding of an SSLRequest.
    pub const BYTES: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F];

    /// Check the length field of a startup packet.
    pub fn check_len(len: u32) -> Result<(), NegotiationError> {
        if len == SSL_REQUEST_LEN {
            Ok(())
        } else {
            Err(NegotiationError::UnexpectedLength(len))
        }
    }

    /// Check the request code following a length of 8.
    pub fn check_code(code: u32) -> Result<(), NegotiationError> {
        if code == SSL_REQUEST_CODE {
            Ok(())
        } else {
            Err(NegotiationError::UnexpectedCode(code))
        }
    }

}

/// Read an SSLRequest from `stream` and accept it.
///
/// The length field is checked before the code is read, so a client sending
/// an ordinary startup message is rejected without waiting on its body.
/// Nothing is written unless the full request is valid.
pub async fn negotiate<S>(stream: &mut S) -> Result<SslRequest, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = stream.read_u32().await?;
    SslRequest::check_len(len)?;

    let code = stream.read_u32().await?;
    SslRequest::check_code(code)?;

    stream.write_all(&[SSL_ACCEPT]).await?;
    stream.flush().await?;

    debug!("SSLRequest accepted");
    Ok(SslRequest)
}
