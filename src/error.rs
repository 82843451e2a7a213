use thiserror::Error;

use crate::types::PkiId;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Peer {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Identity mismatch: expected PKI-ID {expected}, got {actual}")]
    IdentityMismatch { expected: PkiId, actual: PkiId },

    #[error("Peer {0} is blacklisted")]
    Blacklisted(PkiId),

    #[error("Comm is stopped")]
    Closed,

    #[error("Peer closed the connection before identifying itself")]
    Disconnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommError {
    pub(crate) fn unreachable(endpoint: &str, reason: impl ToString) -> Self {
        CommError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors raised before an encrypted session with the peer existed.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, CommError::Unreachable { .. })
    }

    /// True when the peer answered but could not prove the identity it claimed.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            CommError::HandshakeFailed(_) | CommError::IdentityMismatch { .. }
        )
    }
}

impl From<bincode::Error> for CommError {
    fn from(e: bincode::Error) -> Self {
        CommError::Codec(e.to_string())
    }
}

/// Errors surfaced by a [`crate::crypto::MessageCryptoService`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Unknown PKI-ID {0}")]
    UnknownPeer(PkiId),
}
