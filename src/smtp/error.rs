//! Error types for the SMTP receiver.
//!
//! The session distinguishes errors it recovers from locally (a reply is
//! written and the dialogue continues) from errors that end the session (a
//! final reply is attempted and the connection closes). The mapping lives in
//! the session module; the variants here carry the taxonomy.

use std::io;

use thiserror::Error;

/// Errors raised while driving a single SMTP session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A command line exceeded the 512-byte RFC 5321 limit.
    #[error("command line too long")]
    CommandTooLong,

    /// A DATA-phase line exceeded the 998-byte RFC 5321 text line limit.
    #[error("data line too long")]
    DataLineTooLong,

    /// The peer kept writing without a CRLF until the read-ahead ceiling was hit.
    #[error("read buffer overflow")]
    BufferOverflow,

    /// A received line was not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidEncoding,

    /// The accumulated message body exceeded the configured maximum size.
    #[error("message exceeds the fixed maximum message size")]
    MessageTooLarge,

    /// A single command read exceeded the command timeout.
    #[error("timed out waiting for a command")]
    CommandTimeout,

    /// The session exceeded its wall-clock budget.
    #[error("session exceeded its maximum lifetime")]
    ConnectionTimeout,

    /// The peer closed the connection (or it was closed locally) mid-operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// Reading from the transport failed.
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    /// Writing to the transport failed.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// The server asked the session to shut down.
    #[error("server shutting down")]
    Shutdown,

    /// A TLS upgrade step failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// An invariant the session relies on was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised while loading TLS material or upgrading a connection.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The certificate or private key could not be loaded or parsed.
    #[error("invalid certificate or key: {0}")]
    InvalidCertificate(String),

    /// The TLS configuration itself is unusable (bad cipher list, versions).
    #[error("invalid TLS configuration: {0}")]
    Config(String),

    /// The server-side handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection could not be upgraded in place.
    #[error("TLS upgrade failed: {0}")]
    UpgradeFailed(String),

    /// STARTTLS was attempted on a connection that is already encrypted.
    #[error("TLS already active")]
    AlreadyActive,
}

/// Errors surfaced by the server control operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called while the server was already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// `stop` was called while the server was not running.
    #[error("server is not running")]
    NotRunning,

    /// The listener could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    /// The configured TLS material could not be loaded at startup.
    #[error(transparent)]
    Tls(#[from] TlsError),
}
