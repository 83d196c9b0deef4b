//! An embeddable SMTP receiver.
//!
//! The library accepts inbound SMTP connections, drives each RFC 5321
//! dialogue to completion (including the RFC 3207 STARTTLS upgrade), and
//! hands every finished message to a host-supplied [`MessageHandler`]. It is
//! not a mail transfer agent: nothing is queued, relayed, or authenticated,
//! and the message body is delivered as opaque bytes.
//!
//! Embedders construct a [`ServerConfig`], create a [`Server`], install a
//! handler, and call [`Server::start`]:
//!
//! ```no_run
//! use mail_inlet::{Message, Server, ServerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = std::sync::Arc::new(Server::new(ServerConfig::default()));
//! server.set_message_handler(|message: Message| -> anyhow::Result<()> {
//!     println!("mail from <{}>", message.from);
//!     Ok(())
//! });
//! server.start().await?; // runs until server.stop() is called
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod smtp;

pub use config::{CertificateSource, ServerConfig, TlsConfig, TlsVersion};
pub use smtp::error::{ServerError, SessionError, TlsError};
pub use smtp::{Message, MessageHandler, Server};

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};

/// Runs the receiver as a standalone service.
///
/// Loads configuration from the environment, installs a handler that logs
/// each accepted message, and serves until a shutdown signal (SIGINT, or
/// SIGTERM on Unix) arrives, at which point the server is stopped and the
/// active sessions drain.
///
/// # Errors
///
/// Returns an `Err` if configuration loading fails, if the server cannot
/// start (bind or TLS setup failure), or if the server task terminates
/// unexpectedly.
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{} inbound SMTP receiver",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration; exit early if configuration is invalid.
    let config = match config::ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e); // Propagate configuration error to main.rs for process exit.
        }
    };

    let server = Arc::new(smtp::Server::new(config));
    server.set_message_handler(|message: Message| -> Result<()> {
        info!(
            "Received message from <{}> for {} recipient(s) ({} bytes)",
            message.from,
            message.recipients.len(),
            message.data.len()
        );
        Ok(())
    });

    // Run the accept loop on its own task so this one can wait for signals.
    let accept_server = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { accept_server.start().await });

    tokio::select! {
        res = &mut server_task => {
            // The server finishing without stop() being called is unexpected
            // for a long-running service.
            error!("SMTP server task terminated.");
            match res {
                Ok(Ok(())) => Err(anyhow::anyhow!(
                    "SMTP server exited cleanly, which is unexpected."
                )),
                Ok(Err(e)) => {
                    error!("SMTP server returned error: {}", e);
                    Err(e.into())
                }
                Err(join_error) => {
                    error!(
                        "SMTP server task failed (panic or cancellation): {}",
                        join_error
                    );
                    Err(anyhow::anyhow!("SMTP server task failed: {}", join_error))
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received; stopping SMTP server");
            server.stop()?;
            // Wait for the accept loop to exit and the sessions to drain.
            server_task.await??;
            info!("Shutdown complete");
            Ok(())
        }
    }
}

/// Resolves when the process is asked to shut down.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                // Fall back to ctrl-c only.
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
