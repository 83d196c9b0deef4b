//! The SMTP receiver: listener ownership, the accept loop, and the
//! per-connection session plumbing.
//!
//! [`Server`] binds the configured endpoint, accepts connections, and spawns
//! one session task per connection. Finished messages are handed to the
//! host-supplied [`MessageHandler`], which may be invoked concurrently from
//! multiple sessions.

pub mod command;
pub mod error;
pub mod machine;
pub mod reply;

mod connection;
mod session;
mod tls;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::ServerConfig;
use error::ServerError;
use session::{Session, SessionConfig};

/// A finished message, delivered to the host by move once the closing dot of
/// DATA has been acknowledged with 250.
///
/// `data` holds the message content exactly as received, after dot-stuffing
/// removal, with CRLF line endings preserved. The receiver treats it as an
/// opaque byte sequence; header or MIME interpretation is the host's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The envelope reverse-path; empty for the null sender.
    pub from: String,
    /// The envelope forward-paths, in the order they were accepted.
    pub recipients: Vec<String>,
    /// The message body.
    pub data: Bytes,
}

/// The host-side delivery seam.
///
/// The handler is shared read-only by every session and may run concurrently;
/// implementations must tolerate that. A returned error is logged and does
/// not affect the session: the 250 acknowledgment is already on the wire, so
/// redelivery concerns belong to the host.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()>;
}

/// Plain functions and closures work directly as handlers.
#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Message) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        (self)(message)
    }
}

/// The embeddable SMTP server.
///
/// Owns the listener and the accept loop. `start` runs until `stop` is
/// called from another task; each accepted connection gets its own session
/// task, tracked in an active-session map keyed by a per-session id.
pub struct Server {
    config: ServerConfig,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    sessions: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Server {
    /// Creates a server from the given configuration. Nothing is bound until
    /// [`start`](Self::start) is called.
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            handler: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Installs the callback invoked once per committed message. Replaces any
    /// previously installed handler; sessions spawned afterwards use the new
    /// one.
    pub fn set_message_handler<H>(&self, handler: H)
    where
        H: MessageHandler + 'static,
    {
        *lock(&self.handler) = Some(Arc::new(handler));
    }

    /// Whether the accept loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The number of sessions currently in flight.
    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Binds the listener and runs the accept loop until [`stop`](Self::stop)
    /// is called. Does not return before the loop has exited and every
    /// session task has drained.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when called twice concurrently, `Tls` when the
    /// configured certificate material cannot be loaded, and `Bind` when the
    /// endpoint cannot be bound.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let result = self.serve().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Signals the accept loop and every active session to shut down.
    /// Returns once the signal is sent; `start` returns when the drain is
    /// complete. Calling `stop` again while the drain is in progress is a
    /// harmless no-op.
    ///
    /// # Errors
    ///
    /// `NotRunning` when the server is not running.
    pub fn stop(&self) -> Result<(), ServerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }
        info!("Stopping SMTP server");
        lock(&self.shutdown).cancel();
        Ok(())
    }

    async fn serve(&self) -> Result<(), ServerError> {
        let token = CancellationToken::new();
        *lock(&self.shutdown) = token.clone();

        // TLS material is loaded once and shared read-only by every session.
        let acceptor = match &self.config.tls {
            Some(tls_config) => Some(TlsAcceptor::from(tls::acceptor_config(tls_config)?)),
            None => None,
        };

        let listener = self.bind()?;
        info!(
            "SMTP server listening on {}:{}",
            self.config.bind_address, self.config.port
        );

        let session_config = Arc::new(SessionConfig {
            domain: self.config.domain.clone(),
            max_message_size: self.config.max_message_size,
            connection_timeout: Duration::from_secs(self.config.connection_timeout_secs),
            command_timeout: Duration::from_secs(self.config.command_timeout_secs),
            tls: acceptor,
        });
        let handler = lock(&self.handler).clone();
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("SMTP accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.spawn_session(&tracker, &token, stream, peer,
                            Arc::clone(&session_config), handler.clone());
                    }
                    Err(e) => {
                        if token.is_cancelled() {
                            break;
                        }
                        // A single accept failure does not tear down the server.
                        error!("Error accepting connection: {:?}", e);
                    }
                },
            }
        }

        // Closing the listener first refuses new peers while the existing
        // sessions drain.
        drop(listener);
        tracker.close();
        tracker.wait().await;
        lock(&self.sessions).clear();

        info!("SMTP server stopped");
        Ok(())
    }

    /// Spawns one session task for an accepted connection and records it in
    /// the active-session map. The task removes its own entry on exit.
    fn spawn_session(
        &self,
        tracker: &TaskTracker,
        token: &CancellationToken,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        session_config: Arc<SessionConfig>,
        handler: Option<Arc<dyn MessageHandler>>,
    ) {
        info!("New connection from: {}", peer);

        let id = Uuid::new_v4();
        let cancel = token.child_token();
        let session = Session::new(id, stream, peer, session_config, handler, cancel.clone());
        let sessions = Arc::clone(&self.sessions);

        tracker.spawn(async move {
            lock(&sessions).insert(id, cancel);

            if let Err(e) = session.run().await {
                warn!("Session {} from {} ended with error: {}", id, peer, e);
            }

            lock(&sessions).remove(&id);
        });
    }

    /// Binds the configured endpoint with a backlog of `max_connections`.
    /// The default `::` address binds dual-stack, so IPv4 peers arrive as
    /// IPv4-mapped IPv6 addresses.
    fn bind(&self) -> Result<TcpListener, ServerError> {
        let ip: IpAddr = self.config.bind_address.parse().map_err(|e| {
            ServerError::Bind(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "invalid bind address '{}': {}",
                    self.config.bind_address, e
                ),
            ))
        })?;

        let socket = match ip {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(ServerError::Bind)?;

        socket.set_reuseaddr(true).map_err(ServerError::Bind)?;
        socket
            .bind(SocketAddr::new(ip, self.config.port))
            .map_err(ServerError::Bind)?;

        let backlog = u32::try_from(self.config.max_connections.max(1)).unwrap_or(u32::MAX);
        socket.listen(backlog).map_err(ServerError::Bind)
    }

    /// The port the server is configured to listen on.
    pub fn port(&self) -> u16 {
        self.config.port
    }
}

/// Locks a mutex, recovering the guard if a session task panicked while
/// holding it.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
