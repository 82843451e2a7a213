//! Mutual authentication over a fresh TLS session.
//!
//! Each side sends one signed [`ConnectionMessage`] carrying its PKI-ID,
//! identity and the hash of the TLS certificate it presented. The receiver
//! checks the identity derives the PKI-ID, the hash matches the certificate
//! it actually observed on the session, and the signature verifies under the
//! claimed identity. The dialer writes first; the acceptor answers only after
//! the dialer checked out.

use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::CommError;
use crate::identity::IdentityMapper;
use crate::network::blacklist::Blacklist;
use crate::network::message::{ConnectionMessage, Content, GossipMessage, Tag};
use crate::network::signed_message::SignedGossipMessage;
use crate::network::wire;
use crate::types::{AuthInfo, ConnectionInfo, PeerIdentity, PkiId};

/// Builds the handshake message a node sends about itself.
pub fn connection_message<F>(
    pki_id: PkiId,
    identity: PeerIdentity,
    cert_hash: Vec<u8>,
    endpoint: String,
    signer: F,
) -> Result<SignedGossipMessage, CommError>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>, CommError>,
{
    let mut message = GossipMessage::new(
        0,
        Content::Conn(ConnectionMessage {
            pki_id,
            identity,
            cert_hash,
            endpoint,
        }),
    );
    message.tag = Tag::Conn;
    SignedGossipMessage::sign(message, signer)
}

pub struct Handshaker {
    id_mapper: Arc<IdentityMapper>,
    identity: PeerIdentity,
    endpoint: String,
    /// Certificate presented when accepting
    server_cert_hash: Vec<u8>,
    /// Certificate presented when dialing, if any
    client_cert_hash: Option<Vec<u8>>,
    skip_handshake: bool,
    max_frame_size: u32,
    blacklist: Arc<Blacklist>,
}

impl Handshaker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id_mapper: Arc<IdentityMapper>,
        identity: PeerIdentity,
        endpoint: String,
        server_cert_hash: Vec<u8>,
        client_cert_hash: Option<Vec<u8>>,
        skip_handshake: bool,
        max_frame_size: u32,
        blacklist: Arc<Blacklist>,
    ) -> Self {
        Self {
            id_mapper,
            identity,
            endpoint,
            server_cert_hash,
            client_cert_hash,
            skip_handshake,
            max_frame_size,
            blacklist,
        }
    }

    pub fn pki_id(&self) -> &PkiId {
        self.id_mapper.self_pki_id()
    }

    /// Dialer side. `remote_cert_hash` is the hash of the certificate the
    /// acceptor presented; a non-empty `expected` must match the proven PKI-ID.
    pub async fn authenticate_active<S>(
        &self,
        stream: &mut S,
        remote_cert_hash: Option<&[u8]>,
        endpoint: &str,
        expected: &PkiId,
    ) -> Result<ConnectionInfo, CommError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let own = self.own_message(self.client_cert_hash.clone())?;
        wire::write_envelope(stream, &own.envelope, self.max_frame_size)
            .await
            .map_err(handshake_error)?;

        let info = self
            .receive(stream, remote_cert_hash, endpoint)
            .await
            .map_err(|e| match e {
                CommError::Disconnected => CommError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ),
                other => other,
            })?;
        if !expected.is_empty() && &info.id != expected {
            tracing::warn!(
                "🚫 {} answered as {} but {} was expected",
                endpoint,
                info.id,
                expected
            );
            return Err(CommError::IdentityMismatch {
                expected: expected.clone(),
                actual: info.id,
            });
        }
        Ok(info)
    }

    /// Acceptor side. The dialer's message is checked before anything is sent back.
    pub async fn authenticate_passive<S>(
        &self,
        stream: &mut S,
        remote_cert_hash: Option<&[u8]>,
        endpoint: &str,
    ) -> Result<ConnectionInfo, CommError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let info = self.receive(stream, remote_cert_hash, endpoint).await?;

        let own = self.own_message(Some(self.server_cert_hash.clone()))?;
        wire::write_envelope(stream, &own.envelope, self.max_frame_size)
            .await
            .map_err(handshake_error)?;
        Ok(info)
    }

    fn own_message(&self, cert_hash: Option<Vec<u8>>) -> Result<SignedGossipMessage, CommError> {
        let pki_id = self.pki_id().clone();
        let identity = self.identity.clone();
        let endpoint = self.endpoint.clone();
        match cert_hash {
            Some(hash) => connection_message(pki_id, identity, hash, endpoint, |payload| {
                self.id_mapper.sign(payload)
            }),
            // Nothing session-specific to bind a signature to
            None => connection_message(pki_id, identity, Vec::new(), endpoint, |_| Ok(Vec::new())),
        }
    }

    async fn receive<S>(
        &self,
        stream: &mut S,
        remote_cert_hash: Option<&[u8]>,
        endpoint: &str,
    ) -> Result<ConnectionInfo, CommError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let envelope = wire::read_envelope(stream, self.max_frame_size)
            .await
            .map_err(handshake_error)?
            .ok_or(CommError::Disconnected)?;
        let signed = envelope.to_gossip_message().map_err(handshake_error)?;

        let conn = signed.message.connection_message().ok_or_else(|| {
            CommError::HandshakeFailed("first message is not a connection message".to_string())
        })?;
        if conn.pki_id.is_empty() {
            return Err(CommError::HandshakeFailed("peer sent an empty PKI-ID".to_string()));
        }

        self.id_mapper
            .put(&conn.pki_id, &conn.identity)
            .map_err(|e| match e {
                CommError::IdentityMismatch { .. } => e,
                other => CommError::HandshakeFailed(other.to_string()),
            })?;

        let auth = if self.skip_handshake {
            None
        } else {
            let observed = remote_cert_hash.ok_or_else(|| {
                CommError::HandshakeFailed("peer presented no TLS certificate".to_string())
            })?;
            if !bool::from(observed.ct_eq(conn.cert_hash.as_slice())) {
                tracing::warn!("🚫 {} claimed a TLS certificate it did not present", endpoint);
                return Err(CommError::HandshakeFailed(
                    "TLS certificate hash mismatch".to_string(),
                ));
            }
            signed
                .verify(|signature, payload| self.id_mapper.verify(&conn.pki_id, signature, payload))
                .map_err(|e| CommError::HandshakeFailed(format!("bad signature: {}", e)))?;
            Some(AuthInfo {
                signed_data: signed.envelope.payload.clone(),
                signature: signed.envelope.signature.clone(),
            })
        };

        if self.blacklist.is_blacklisted(&conn.pki_id) {
            tracing::debug!("🚫 Refusing handshake with blacklisted peer {}", conn.pki_id);
            return Err(CommError::Blacklisted(conn.pki_id.clone()));
        }

        tracing::debug!(
            "🤝 Handshake with {} at {} complete (authenticated: {})",
            conn.pki_id,
            endpoint,
            auth.is_some()
        );
        Ok(ConnectionInfo {
            id: conn.pki_id.clone(),
            identity: conn.identity.clone(),
            endpoint: endpoint.to_string(),
            auth,
        })
    }
}

/// Transport failures mid-handshake count as handshake failures.
fn handshake_error(e: CommError) -> CommError {
    match e {
        CommError::HandshakeFailed(_)
        | CommError::IdentityMismatch { .. }
        | CommError::Blacklisted(_) => e,
        other => CommError::HandshakeFailed(other.to_string()),
    }
}
