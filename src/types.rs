//! Identifiers and descriptors shared across the comm layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier derived from a peer's cryptographic identity.
/// Primary key for connections, blacklisting and liveness tracking.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PkiId(pub Vec<u8>);

impl PkiId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for PkiId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for PkiId {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl fmt::Display for PkiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short hex prefix keeps log lines readable
        let encoded = hex::encode(&self.0);
        if encoded.len() > 16 {
            write!(f, "{}…", &encoded[..16])
        } else {
            write!(f, "{}", encoded)
        }
    }
}

impl fmt::Debug for PkiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PkiId({})", hex::encode(&self.0))
    }
}

/// Serialized identity of a peer (certificate, public key, ...). Its meaning
/// belongs to the [`crate::crypto::MessageCryptoService`] in use.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerIdentity(pub Vec<u8>);

impl PeerIdentity {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for PeerIdentity {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({} bytes)", self.0.len())
    }
}

/// Channel a message is scoped to, used by channel-aware verification.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ChannelId(pub Vec<u8>);

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// Destination descriptor supplied by callers. Not authenticated until a
/// handshake with `endpoint` proves ownership of `pki_id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemotePeer {
    pub endpoint: String,
    /// Expected PKI-ID; empty means "whoever answers at `endpoint`".
    pub pki_id: PkiId,
}

impl RemotePeer {
    pub fn new(endpoint: impl Into<String>, pki_id: impl Into<PkiId>) -> Self {
        Self {
            endpoint: endpoint.into(),
            pki_id: pki_id.into(),
        }
    }
}

impl fmt::Display for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.pki_id)
    }
}

/// Proof a peer presented during the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthInfo {
    pub signed_data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Result of a completed handshake. Built once per connection and shared
/// read-only with every message received on it.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: PkiId,
    pub identity: PeerIdentity,
    pub endpoint: String,
    pub auth: Option<AuthInfo>,
}

impl ConnectionInfo {
    /// Whether the peer's signature and TLS binding were verified.
    /// Always false for connections accepted in skip-handshake mode.
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }
}
