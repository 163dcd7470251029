//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use murmur_shared::constants::{
    DEFAULT_HTTP_PORT, HISTORY_PAGE_DEFAULT, HISTORY_PAGE_MAX, MAX_MESSAGE_LEN,
    OUTBOUND_QUEUE_CAPACITY, TYPING_TIMEOUT_MS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./murmur.db`
    pub database_path: PathBuf,

    /// Ed25519 public key of the session-token issuer (hex-encoded, 64 chars).
    /// Env: `SESSION_PUBKEY`
    /// Default: all-zeros, which rejects every token.
    pub session_pubkey: [u8; 32],

    /// How long a typing signal lives without a refresh.
    /// Env: `TYPING_TIMEOUT_MS`
    pub typing_timeout: Duration,

    /// Delay between a user's last connection closing and the `offline`
    /// broadcast. Zero means immediate.
    /// Env: `OFFLINE_GRACE_MS`
    pub offline_grace: Duration,

    /// Capacity of each connection's outbound queue. A connection whose
    /// queue fills up is disconnected.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,

    /// Maximum message length in characters.
    /// Env: `MAX_MESSAGE_LEN`
    pub max_message_len: usize,

    /// Default history page size (capped at 200).
    /// Env: `HISTORY_PAGE_LIMIT`
    pub history_page_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./murmur.db"),
            session_pubkey: [0u8; 32],
            typing_timeout: Duration::from_millis(TYPING_TIMEOUT_MS),
            offline_grace: Duration::ZERO,
            outbound_queue: OUTBOUND_QUEUE_CAPACITY,
            max_message_len: MAX_MESSAGE_LEN,
            history_page_limit: HISTORY_PAGE_DEFAULT,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(hex_key) = lookup("SESSION_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.session_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid SESSION_PUBKEY, using default (rejects all sessions)"
                    );
                }
            }
        }

        if let Some(ms) = parse_number::<u64>(&lookup, "TYPING_TIMEOUT_MS") {
            if ms > 0 {
                config.typing_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(ms) = parse_number::<u64>(&lookup, "OFFLINE_GRACE_MS") {
            config.offline_grace = Duration::from_millis(ms);
        }

        if let Some(n) = parse_number::<usize>(&lookup, "OUTBOUND_QUEUE") {
            if n > 0 {
                config.outbound_queue = n;
            }
        }

        if let Some(n) = parse_number::<usize>(&lookup, "MAX_MESSAGE_LEN") {
            if n > 0 {
                config.max_message_len = n;
            }
        }

        if let Some(n) = parse_number::<u32>(&lookup, "HISTORY_PAGE_LIMIT") {
            config.history_page_limit = n.clamp(1, HISTORY_PAGE_MAX);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_pubkey(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
