//! The per-connection SMTP engine.
//!
//! A [`Session`] owns one [`Connection`] and drives one dialogue from the
//! greeting to the close: it reads CRLF-framed lines through a bounded
//! read-ahead buffer, feeds them through the lexer and the state machine,
//! writes the replies, collects the DATA body with dot-transparency, and
//! performs the STARTTLS upgrade when the machine accepts one. Command-level
//! errors are answered and the dialogue continues; session-fatal errors get a
//! final reply (421/451/552 as appropriate) before the connection closes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::command::Command;
use super::connection::Connection;
use super::error::SessionError;
use super::machine::{Action, StateMachine};
use super::reply::Reply;
use super::{Message, MessageHandler};

/// Maximum command line length in bytes, including the trailing CRLF
/// (RFC 5321 section 4.5.3.1.4).
pub(crate) const MAX_COMMAND_LINE: usize = 512;

/// Maximum command line content, excluding the CRLF.
const MAX_COMMAND_CONTENT: usize = MAX_COMMAND_LINE - 2;

/// Maximum DATA-phase text line content, excluding the CRLF
/// (RFC 5321 section 4.5.3.1.6).
const MAX_DATA_CONTENT: usize = 998;

/// The read-ahead buffer may hold this many times the applicable line limit
/// before the session gives up on the peer with a 421.
const BUFFER_CEILING_FACTOR: usize = 3;

/// Transport read granularity.
const READ_CHUNK: usize = 4096;

/// Which line-length regime a read runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Command,
    Data,
}

impl Phase {
    /// The content limit (excluding CRLF) for this phase.
    fn max_content(self) -> usize {
        match self {
            Phase::Command => MAX_COMMAND_CONTENT,
            Phase::Data => MAX_DATA_CONTENT,
        }
    }

    /// The length error this phase raises.
    fn too_long(self) -> SessionError {
        match self {
            Phase::Command => SessionError::CommandTooLong,
            Phase::Data => SessionError::DataLineTooLong,
        }
    }
}

/// Per-session settings, derived from the server configuration once per
/// accepted connection and shared read-only.
pub(crate) struct SessionConfig {
    pub domain: String,
    pub max_message_size: usize,
    /// Wall-clock ceiling for the whole session; zero disables it.
    pub connection_timeout: Duration,
    /// Ceiling on a single line read; zero disables it.
    pub command_timeout: Duration,
    /// Present when STARTTLS is offered.
    pub tls: Option<TlsAcceptor>,
}

/// One SMTP dialogue over one connection.
pub(crate) struct Session<S> {
    id: Uuid,
    peer: std::net::SocketAddr,
    connection: Connection<S>,
    machine: StateMachine,
    config: Arc<SessionConfig>,
    handler: Option<Arc<dyn MessageHandler>>,
    shutdown: CancellationToken,
    /// Read-ahead buffer; bytes past the first CRLF stay here between reads.
    buffer: Vec<u8>,
    /// Set after an over-long line without CRLF; input is discarded up to the
    /// next CRLF so the dialogue can resynchronize.
    skip_to_crlf: bool,
    started: Instant,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(
        id: Uuid,
        stream: S,
        peer: std::net::SocketAddr,
        config: Arc<SessionConfig>,
        handler: Option<Arc<dyn MessageHandler>>,
        shutdown: CancellationToken,
    ) -> Self {
        let machine = StateMachine::new(
            config.domain.clone(),
            config.max_message_size,
            config.tls.is_some(),
        );

        Session {
            id,
            peer,
            connection: Connection::new(stream),
            machine,
            config,
            handler,
            shutdown,
            buffer: Vec::new(),
            skip_to_crlf: false,
            started: Instant::now(),
        }
    }

    /// Drives the session to completion and closes the connection.
    ///
    /// Clean endings (QUIT, EOF, server shutdown) return `Ok`; peer-caused
    /// or internal failures return the error after the appropriate final
    /// reply has been attempted.
    pub(crate) async fn run(mut self) -> Result<(), SessionError> {
        debug!("Session {}: connected from {}", self.id, self.peer);

        let result = self.dialogue().await;

        if let Err(err) = &result {
            if let Some(reply) = final_reply(err, &self.config.domain) {
                // Best effort; the peer may already be gone.
                let _ = self
                    .connection
                    .write_all(reply.to_string().as_bytes())
                    .await;
            }
        }

        self.connection.close().await;
        debug!("Session {}: closed", self.id);

        match result {
            // Shutdown is an orderly ending, not a session failure.
            Err(SessionError::Shutdown) => Ok(()),
            other => other,
        }
    }

    /// The command loop: greeting, then read-lex-process-reply until the
    /// dialogue ends.
    async fn dialogue(&mut self) -> Result<(), SessionError> {
        let greeting = Reply::new(220, format!("{} ESMTP Service ready", self.config.domain));
        self.send_reply(&greeting).await?;

        loop {
            let line = match self.next_line(Phase::Command).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Session {}: peer closed the connection", self.id);
                    return Ok(());
                }
                Err(err @ (SessionError::CommandTooLong | SessionError::InvalidEncoding)) => {
                    self.send_reply(&recoverable_reply(&err)).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            trace!("Session {}: <<< {:?}", self.id, line);
            let command = Command::from(line.as_str());

            match self.machine.process(command) {
                Action::Accept(reply) | Action::Reject(reply) => {
                    self.send_reply(&reply).await?;
                }
                Action::Close(reply) => {
                    self.send_reply(&reply).await?;
                    return Ok(());
                }
                Action::StartData(reply) => {
                    self.send_reply(&reply).await?;
                    self.collect_data().await?;
                }
                Action::UpgradeTls(reply) => {
                    self.send_reply(&reply).await?;
                    self.upgrade_tls().await?;
                }
            }
        }
    }

    /// The DATA sub-protocol: body lines until the lone-dot terminator, with
    /// dot-transparency and size enforcement, then commit and delivery.
    async fn collect_data(&mut self) -> Result<(), SessionError> {
        let mut body: Vec<u8> = Vec::new();

        loop {
            let line = match self.next_line(Phase::Data).await {
                Ok(Some(line)) => line,
                // EOF before the terminator: the transaction never completes.
                Ok(None) => return Err(SessionError::ConnectionClosed),
                Err(err @ (SessionError::DataLineTooLong | SessionError::InvalidEncoding)) => {
                    self.send_reply(&recoverable_reply(&err)).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if line == "." {
                break;
            }

            let content = unstuff(&line);
            if body.len() + content.len() + 2 > self.config.max_message_size {
                return Err(SessionError::MessageTooLarge);
            }
            body.extend_from_slice(content.as_bytes());
            body.extend_from_slice(b"\r\n");
        }

        let (reply, message) = self.machine.complete_data(Bytes::from(body))?;
        self.send_reply(&reply).await?;
        self.deliver(message).await;
        Ok(())
    }

    /// Hands a committed message to the host. The 250 is already on the wire,
    /// so a failing handler is logged and never tears the session down.
    async fn deliver(&self, message: Message) {
        info!(
            "Session {}: accepted message from <{}> for {} recipient(s) ({} bytes)",
            self.id,
            message.from,
            message.recipients.len(),
            message.data.len()
        );

        match &self.handler {
            Some(handler) => {
                if let Err(e) = handler.handle_message(message).await {
                    error!("Session {}: message handler failed: {:#}", self.id, e);
                }
            }
            None => {
                warn!(
                    "Session {}: no message handler installed; message dropped",
                    self.id
                );
            }
        }
    }

    /// Performs the in-place TLS upgrade after the 220 reply has been sent.
    async fn upgrade_tls(&mut self) -> Result<(), SessionError> {
        // Any bytes the peer sent past the STARTTLS line are plaintext and
        // must be discarded before the handshake: interpreting them as TLS
        // records or as commands would be an injection vector.
        self.buffer.clear();
        self.skip_to_crlf = false;

        let acceptor = self.config.tls.clone().ok_or_else(|| {
            SessionError::Internal("STARTTLS accepted without TLS configuration".to_string())
        })?;

        self.connection.upgrade(&acceptor).await?;
        self.machine.tls_established();
        info!("Session {}: TLS established", self.id);
        Ok(())
    }

    /// Reads the next line under the session's timeout and shutdown rules.
    async fn next_line(&mut self, phase: Phase) -> Result<Option<String>, SessionError> {
        if !self.config.connection_timeout.is_zero()
            && self.started.elapsed() >= self.config.connection_timeout
        {
            return Err(SessionError::ConnectionTimeout);
        }

        let token = self.shutdown.clone();
        let command_timeout = self.config.command_timeout;

        tokio::select! {
            _ = token.cancelled() => Err(SessionError::Shutdown),
            result = async {
                if command_timeout.is_zero() {
                    self.read_line(phase).await
                } else {
                    match tokio::time::timeout(command_timeout, self.read_line(phase)).await {
                        Ok(result) => result,
                        Err(_) => Err(SessionError::CommandTimeout),
                    }
                }
            } => result,
        }
    }

    /// Returns the next CRLF-terminated line from the buffered connection.
    ///
    /// Bytes past the first CRLF remain buffered for the next call. A line
    /// whose content exceeds the phase limit raises the phase's length error:
    /// with the CRLF already in the buffer the whole line is consumed first;
    /// without it the reader switches to skip-to-CRLF mode so the dialogue
    /// can resynchronize once the terminator arrives. The buffer never grows
    /// past three times the applicable line limit; hitting that ceiling
    /// raises `BufferOverflow`. EOF yields the remaining bytes as a final
    /// partial line, or `None` when nothing is buffered.
    async fn read_line(&mut self, phase: Phase) -> Result<Option<String>, SessionError> {
        let max_content = phase.max_content();
        let ceiling = BUFFER_CEILING_FACTOR * (max_content + 2);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if self.skip_to_crlf {
                if let Some(pos) = find_crlf(&self.buffer) {
                    self.buffer.drain(..pos + 2);
                    self.skip_to_crlf = false;
                }
            }

            if !self.skip_to_crlf {
                if let Some(pos) = find_crlf(&self.buffer) {
                    if pos > max_content {
                        self.buffer.drain(..pos + 2);
                        return Err(phase.too_long());
                    }
                    let line = self.buffer[..pos].to_vec();
                    self.buffer.drain(..pos + 2);
                    return match String::from_utf8(line) {
                        Ok(s) => Ok(Some(s)),
                        Err(_) => Err(SessionError::InvalidEncoding),
                    };
                }
            }

            if self.buffer.len() >= ceiling {
                return Err(SessionError::BufferOverflow);
            }

            if !self.skip_to_crlf && self.buffer.len() > max_content + 2 {
                self.skip_to_crlf = true;
                return Err(phase.too_long());
            }

            let n = self
                .connection
                .read(&mut chunk)
                .await
                .map_err(SessionError::ReadFailed)?;

            if n == 0 {
                if self.skip_to_crlf || self.buffer.is_empty() {
                    self.buffer.clear();
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buffer);
                return match String::from_utf8(line) {
                    Ok(s) => Ok(Some(s)),
                    Err(_) => Err(SessionError::InvalidEncoding),
                };
            }

            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        trace!("Session {}: >>> {}", self.id, reply.to_string().trim_end());
        self.connection
            .write_all(reply.to_string().as_bytes())
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotConnected => SessionError::ConnectionClosed,
                _ => SessionError::WriteFailed(e),
            })
    }
}

/// Removes the dot-stuffing a sender applies to body lines that begin with a
/// dot (RFC 5321 section 4.5.2): exactly one leading `.` is stripped.
pub(crate) fn unstuff(line: &str) -> &str {
    line.strip_prefix('.').unwrap_or(line)
}

/// Finds the first CRLF in the buffer.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}

/// The reply for an error the session recovers from in place.
fn recoverable_reply(error: &SessionError) -> Reply {
    match error {
        SessionError::CommandTooLong => Reply::new(
            500,
            format!("Command too long (max {} bytes)", MAX_COMMAND_LINE),
        ),
        SessionError::DataLineTooLong => Reply::new(
            500,
            format!("Line too long (max {} bytes)", MAX_DATA_CONTENT),
        ),
        _ => Reply::new(500, "Invalid character encoding"),
    }
}

/// The final reply attempted before a fatal close, when one applies.
fn final_reply(error: &SessionError, domain: &str) -> Option<Reply> {
    match error {
        SessionError::MessageTooLarge => {
            Some(Reply::new(552, "Message exceeds fixed maximum size"))
        }
        SessionError::BufferOverflow => Some(Reply::new(
            421,
            format!("{} Line limits exceeded, closing connection", domain),
        )),
        SessionError::CommandTimeout => Some(Reply::new(
            421,
            format!("{} Command timeout, closing connection", domain),
        )),
        SessionError::ConnectionTimeout => Some(Reply::new(
            421,
            format!("{} Session timeout, closing connection", domain),
        )),
        SessionError::Shutdown => Some(Reply::new(
            421,
            format!("{} Service shutting down, closing connection", domain),
        )),
        SessionError::Tls(_) => Some(Reply::new(451, "TLS handshake failed")),
        SessionError::Internal(_) => Some(Reply::new(451, "Local error in processing")),
        // Transport-level endings and already-answered errors close silently.
        SessionError::CommandTooLong
        | SessionError::DataLineTooLong
        | SessionError::InvalidEncoding
        | SessionError::ConnectionClosed
        | SessionError::ReadFailed(_)
        | SessionError::WriteFailed(_) => None,
    }
}
