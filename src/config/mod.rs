//! Runtime configuration for the SMTP receiver.
//!
//! This module defines the `ServerConfig` struct consumed by [`crate::smtp::Server`]
//! and the `TlsConfig` describing the STARTTLS certificate material. Embedders
//! usually build a `ServerConfig` directly; the companion binary populates one
//! from `MAIL_INLET_*` environment variables via `from_env`, with support for a
//! `.env` file through the `dotenv` crate.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Default SMTP listening port used when `MAIL_INLET_PORT` is absent.
const DEFAULT_PORT: u16 = 2525;

/// Default concurrent-session cap (doubles as the listen backlog).
const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default maximum message size in bytes (10 MiB), advertised via `SIZE`.
const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default whole-session wall-clock ceiling in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 300;

/// Default per-command read ceiling in seconds.
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Holds the receiver's runtime configuration settings.
///
/// Immutable once handed to the server. All fields have sensible defaults
/// apart from the TLS material, which stays `None` unless configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The domain name used in the greeting banner and protocol replies.
    /// (Optional: `MAIL_INLET_DOMAIN`, Default: "localhost")
    pub domain: String,

    /// The IP address the SMTP listener binds to. The default of `::` binds
    /// dual-stack, so IPv4 peers arrive as IPv4-mapped IPv6 addresses.
    /// (Optional: `MAIL_INLET_BIND_ADDRESS`, Default: "::")
    pub bind_address: String,

    /// The TCP port the SMTP listener binds to.
    /// (Optional: `MAIL_INLET_PORT`, Default: 2525)
    pub port: u16,

    /// Concurrent-session cap, also used as the listen backlog. Connections
    /// beyond the backlog are refused by the kernel; there is no
    /// application-layer queueing.
    /// (Optional: `MAIL_INLET_MAX_CONNECTIONS`, Default: 64)
    pub max_connections: usize,

    /// Maximum accepted message size in bytes, advertised through the `SIZE`
    /// EHLO capability and enforced while collecting DATA.
    /// (Optional: `MAIL_INLET_MAX_MESSAGE_SIZE`, Default: 10485760)
    pub max_message_size: usize,

    /// Wall-clock ceiling for a whole session in seconds; 0 disables it.
    /// (Optional: `MAIL_INLET_CONNECTION_TIMEOUT`, Default: 300)
    pub connection_timeout_secs: u64,

    /// Ceiling on any single command-line read in seconds; 0 disables it.
    /// (Optional: `MAIL_INLET_COMMAND_TIMEOUT`, Default: 60)
    pub command_timeout_secs: u64,

    /// Optional STARTTLS configuration. When absent, EHLO does not advertise
    /// `STARTTLS` and the command is rejected with 502.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            domain: "localhost".to_string(),
            bind_address: "::".to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            tls: None,
        }
    }
}

/// STARTTLS configuration: where the certificate comes from and which
/// protocol parameters the handshake accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// The server certificate and private key source.
    pub certificate: CertificateSource,

    /// Minimum protocol version offered during the handshake.
    #[serde(default)]
    pub min_protocol_version: TlsVersion,

    /// Optional allow-list of cipher suite names (e.g.
    /// `TLS13_AES_256_GCM_SHA384`). When `None`, the provider defaults apply.
    #[serde(default)]
    pub cipher_suites: Option<Vec<String>>,
}

impl TlsConfig {
    /// Builds a configuration around the given certificate source with the
    /// default protocol parameters (TLS 1.2 minimum, provider cipher suites).
    pub fn new(certificate: CertificateSource) -> Self {
        TlsConfig {
            certificate,
            min_protocol_version: TlsVersion::default(),
            cipher_suites: None,
        }
    }

    /// Convenience constructor for a self-signed development certificate.
    pub fn self_signed(common_name: impl Into<String>) -> Self {
        Self::new(CertificateSource::SelfSigned {
            common_name: common_name.into(),
        })
    }
}

/// Where the server certificate and key are loaded from.
#[derive(Clone, Serialize, Deserialize)]
pub enum CertificateSource {
    /// PEM-encoded certificate chain and private key on the filesystem.
    Files { cert: PathBuf, key: PathBuf },
    /// PEM-encoded certificate chain and private key held in memory.
    /// The optional password is only meaningful for encrypted keys, which the
    /// TLS provider does not decrypt; see the loader for the exact behavior.
    Pem {
        cert: Vec<u8>,
        key: Vec<u8>,
        key_password: Option<String>,
    },
    /// A throwaway self-signed certificate generated at load time for the
    /// given common name. Intended for development only.
    SelfSigned { common_name: String },
}

// Hand-written so key bytes and passwords never end up in logs.
impl std::fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateSource::Files { cert, key } => f
                .debug_struct("Files")
                .field("cert", cert)
                .field("key", key)
                .finish(),
            CertificateSource::Pem { cert, key, .. } => f
                .debug_struct("Pem")
                .field("cert_len", &cert.len())
                .field("key_len", &key.len())
                .finish_non_exhaustive(),
            CertificateSource::SelfSigned { common_name } => f
                .debug_struct("SelfSigned")
                .field("common_name", common_name)
                .finish(),
        }
    }
}

/// Minimum TLS protocol version accepted by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 or newer (the default).
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

impl ServerConfig {
    /// Loads configuration settings from environment variables.
    ///
    /// Reads variables prefixed with `MAIL_INLET_`. Supports loading from a
    /// `.env` file if present. Every variable is optional; defaults are
    /// documented on the corresponding fields. TLS is enabled when either
    /// `MAIL_INLET_TLS_CERT`/`MAIL_INLET_TLS_KEY` (a PEM pair on disk) or
    /// `MAIL_INLET_TLS_SELF_SIGNED` (a common name) is set.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if a numeric variable is set but cannot be parsed, or
    /// if only one half of the certificate/key pair is provided.
    pub fn from_env() -> Result<Self> {
        // Attempt to load variables from a .env file, if it exists. Ignore errors.
        let _ = dotenv::dotenv();

        let domain = env::var("MAIL_INLET_DOMAIN").unwrap_or_else(|_| "localhost".to_string());
        log::info!("Config: Using domain: {}", domain);

        let bind_address = env::var("MAIL_INLET_BIND_ADDRESS")
            .map(|val| {
                log::info!("Config: Using bind_address from env: {}", val);
                val
            })
            .unwrap_or_else(|_| {
                let default_val = "::".to_string();
                log::info!("Config: Using default bind_address: {}", default_val);
                default_val // Default: dual-stack listen on all interfaces
            });

        let port = parse_env_var("MAIL_INLET_PORT", DEFAULT_PORT)?;
        log::info!("Config: Using port: {}", port);

        let max_connections = parse_env_var("MAIL_INLET_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            let err_msg = "MAIL_INLET_MAX_CONNECTIONS must be a positive integer";
            log::error!("{}", err_msg);
            return Err(anyhow!(err_msg));
        }
        log::info!("Config: Using max_connections: {}", max_connections);

        let max_message_size =
            parse_env_var("MAIL_INLET_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?;
        log::info!("Config: Using max_message_size: {}", max_message_size);

        let connection_timeout_secs = parse_env_var(
            "MAIL_INLET_CONNECTION_TIMEOUT",
            DEFAULT_CONNECTION_TIMEOUT_SECS,
        )?;
        log::info!(
            "Config: Using connection_timeout_secs: {}",
            connection_timeout_secs
        );

        let command_timeout_secs =
            parse_env_var("MAIL_INLET_COMMAND_TIMEOUT", DEFAULT_COMMAND_TIMEOUT_SECS)?;
        log::info!(
            "Config: Using command_timeout_secs: {}",
            command_timeout_secs
        );

        let tls = Self::tls_from_env()?;
        if tls.is_some() {
            log::info!("Config: STARTTLS enabled");
        } else {
            log::info!("Config: STARTTLS disabled (no certificate configured)");
        }

        Ok(ServerConfig {
            domain,
            bind_address,
            port,
            max_connections,
            max_message_size,
            connection_timeout_secs,
            command_timeout_secs,
            tls,
        })
    }

    /// Assembles the optional TLS block from the environment.
    ///
    /// A filesystem certificate pair takes precedence over a self-signed
    /// request when both are present.
    fn tls_from_env() -> Result<Option<TlsConfig>> {
        let cert = env::var("MAIL_INLET_TLS_CERT").ok();
        let key = env::var("MAIL_INLET_TLS_KEY").ok();

        match (cert, key) {
            (Some(cert), Some(key)) => {
                log::info!("Config: Using TLS certificate from {}", cert);
                return Ok(Some(TlsConfig::new(CertificateSource::Files {
                    cert: PathBuf::from(cert),
                    key: PathBuf::from(key),
                })));
            }
            (Some(_), None) | (None, Some(_)) => {
                let err_msg = "MAIL_INLET_TLS_CERT and MAIL_INLET_TLS_KEY must be set together";
                log::error!("{}", err_msg);
                return Err(anyhow!(err_msg));
            }
            (None, None) => {}
        }

        if let Ok(common_name) = env::var("MAIL_INLET_TLS_SELF_SIGNED") {
            if common_name.trim().is_empty() {
                let err_msg = "MAIL_INLET_TLS_SELF_SIGNED cannot be empty";
                log::error!("{}", err_msg);
                return Err(anyhow!(err_msg));
            }
            log::info!(
                "Config: Using self-signed TLS certificate for {}",
                common_name
            );
            return Ok(Some(TlsConfig::self_signed(common_name)));
        }

        Ok(None)
    }
}

/// Parses an optional numeric environment variable, falling back to `default`
/// when unset and failing with context when set but malformed.
fn parse_env_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| {
            let err_msg = format!("{} ('{}') must be a valid number", name, raw);
            log::error!("{}: {}", err_msg, e);
            anyhow!(e).context(err_msg)
        }),
        Err(_) => Ok(default),
    }
}
