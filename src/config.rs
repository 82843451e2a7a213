//! Configuration records consumed by [`crate::Comm`].
//!
//! Comm never reads files or the environment for these; an external loader
//! resolves them (TOML, flags, ...) and hands over a finished record.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CommError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Address the accept loop binds to
    pub listen_address: String,
    /// Endpoint advertised to peers during the handshake; defaults to the bound address
    pub external_endpoint: Option<String>,
    /// Bounds the passive side's wait for the peer's handshake and each frame write
    pub conn_timeout_ms: u64,
    /// Bounds a whole outbound attempt: TCP connect, TLS and handshake
    pub dial_timeout_ms: u64,
    pub recv_buff_size: usize,
    pub send_buff_size: usize,
    pub skip_handshake: bool,
    /// 0 disables the idle sweep
    pub idle_timeout_secs: u64,
    pub presumed_dead_threshold: u32,
    pub presumed_dead_window_ms: u64,
    pub max_frame_size: u32,
    pub tls: Option<TlsSettings>,
}

/// PEM files holding this node's TLS certificate chain and private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "compact" or "json"
    pub format: String,
}

pub const DEFAULT_CONN_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_RECV_BUFF_SIZE: usize = 20;
pub const DEFAULT_SEND_BUFF_SIZE: usize = 20;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PRESUMED_DEAD_THRESHOLD: u32 = 3;
pub const DEFAULT_PRESUMED_DEAD_WINDOW_MS: u64 = 10_000;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            external_endpoint: None,
            conn_timeout_ms: DEFAULT_CONN_TIMEOUT_MS,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            recv_buff_size: DEFAULT_RECV_BUFF_SIZE,
            send_buff_size: DEFAULT_SEND_BUFF_SIZE,
            skip_handshake: false,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            presumed_dead_threshold: DEFAULT_PRESUMED_DEAD_THRESHOLD,
            presumed_dead_window_ms: DEFAULT_PRESUMED_DEAD_WINDOW_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tls: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl CommConfig {
    pub fn conn_timeout(&self) -> Duration {
        Duration::from_millis(self.conn_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }

    pub fn presumed_dead_window(&self) -> Duration {
        Duration::from_millis(self.presumed_dead_window_ms)
    }

    pub fn validate(&self) -> Result<(), CommError> {
        if self.conn_timeout_ms == 0 || self.dial_timeout_ms == 0 {
            return Err(CommError::Config("timeouts must be non-zero".to_string()));
        }
        if self.recv_buff_size == 0 || self.send_buff_size == 0 {
            return Err(CommError::Config("buffer sizes must be non-zero".to_string()));
        }
        if self.presumed_dead_threshold == 0 {
            return Err(CommError::Config(
                "presumed_dead_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size < 1024 {
            return Err(CommError::Config(format!(
                "max_frame_size too small: {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}
