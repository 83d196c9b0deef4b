//! The per-session byte-stream connection handle.
//!
//! [`Connection`] wraps any async byte stream and is the transport seam the
//! protocol engine runs over: the server hands it a `TcpStream`, tests hand
//! it an in-memory duplex stream. It supports ordered reads and writes, an
//! idempotent close, and the in-place TLS upgrade that STARTTLS requires.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use super::error::TlsError;

/// One logical connection, either plaintext or upgraded to TLS.
///
/// `Closed` is both the post-`close` state and the placeholder used while an
/// upgrade is in flight, so a failed handshake leaves the connection closed
/// rather than half-upgraded.
pub enum Connection<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a freshly accepted plaintext stream.
    pub fn new(stream: S) -> Self {
        Connection::Plain(stream)
    }

    /// Whether the TLS upgrade has completed on this connection.
    pub fn is_tls_active(&self) -> bool {
        matches!(self, Connection::Tls(_))
    }

    /// Reads up to `buf.len()` bytes. Returns `Ok(0)` at EOF; a closed
    /// connection reads as EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.read(buf).await,
            Connection::Tls(stream) => stream.read(buf).await,
            Connection::Closed => Ok(0),
        }
    }

    /// Writes all of `buf` and flushes, so a reply is on the wire before the
    /// next command is read.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Connection::Plain(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
            Connection::Tls(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
            Connection::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            )),
        }
    }

    /// Shuts the stream down and marks the connection closed. Safe to call
    /// more than once; later calls are no-ops.
    pub async fn close(&mut self) {
        match std::mem::replace(self, Connection::Closed) {
            Connection::Plain(mut stream) => {
                let _ = stream.shutdown().await;
            }
            Connection::Tls(mut stream) => {
                let _ = stream.shutdown().await;
            }
            Connection::Closed => {}
        }
    }

    /// Replaces the plaintext stream with its TLS-wrapped equivalent by
    /// running the server-side handshake in place.
    ///
    /// The caller must have written the `220 Ready to start TLS` reply and
    /// discarded any read-ahead plaintext before calling this; the handshake
    /// reads the ClientHello directly from the underlying stream.
    ///
    /// # Errors
    ///
    /// `TlsError::AlreadyActive` when the connection is already encrypted,
    /// `TlsError::UpgradeFailed` when it is closed, and
    /// `TlsError::HandshakeFailed` when the handshake itself fails (the
    /// connection is left closed in that case).
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> Result<(), TlsError> {
        match std::mem::replace(self, Connection::Closed) {
            Connection::Plain(stream) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    *self = Connection::Tls(Box::new(tls_stream));
                    Ok(())
                }
                Err(e) => Err(TlsError::HandshakeFailed(e.to_string())),
            },
            Connection::Tls(stream) => {
                *self = Connection::Tls(stream);
                Err(TlsError::AlreadyActive)
            }
            Connection::Closed => Err(TlsError::UpgradeFailed(
                "connection is closed".to_string(),
            )),
        }
    }
}
