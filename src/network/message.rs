use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::network::signed_message::SignedGossipMessage;
use crate::types::{ChannelId, ConnectionInfo, PeerIdentity, PkiId};

/// Routing scope of a message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Empty,
    /// Handshake traffic, never delivered to subscribers
    Conn,
    OrgOnly,
    ChanOnly,
    ChanAndOrg,
}

/// Logical content of an envelope once decoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    pub tag: Tag,
    /// Correlation number chosen by the sender
    pub nonce: u64,
    pub channel: ChannelId,
    pub content: Content,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Empty,
    Conn(ConnectionMessage),
    Data(DataMessage),
}

/// Handshake payload: who the sender claims to be and which TLS certificate
/// it is using on this session.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectionMessage {
    pub pki_id: PkiId,
    pub identity: PeerIdentity,
    /// SHA-256 of the sender's own TLS certificate, empty without mutual TLS
    pub cert_hash: Vec<u8>,
    pub endpoint: String,
}

impl fmt::Debug for ConnectionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMessage")
            .field("pki_id", &self.pki_id)
            .field("cert_hash", &hex::encode(&self.cert_hash))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DataMessage {
    pub seq_num: u64,
    pub payload: Vec<u8>,
}

impl GossipMessage {
    pub fn new(nonce: u64, content: Content) -> Self {
        Self {
            tag: Tag::Empty,
            nonce,
            channel: ChannelId::default(),
            content,
        }
    }

    /// Empty data message with a random nonce.
    pub fn empty_data() -> Self {
        Self::new(rand::random(), Content::Data(DataMessage::default()))
    }

    pub fn is_connection_message(&self) -> bool {
        matches!(self.content, Content::Conn(_))
    }

    pub fn connection_message(&self) -> Option<&ConnectionMessage> {
        match &self.content {
            Content::Conn(conn) => Some(conn),
            Content::Empty | Content::Data(_) => None,
        }
    }

    pub fn data_message(&self) -> Option<&DataMessage> {
        match &self.content {
            Content::Data(data) => Some(data),
            Content::Empty | Content::Conn(_) => None,
        }
    }
}

pub type Responder = Arc<dyn Fn(GossipMessage) + Send + Sync>;

/// A verified inbound message handed to subscribers.
#[derive(Clone)]
pub struct ReceivedMessage {
    message: Arc<SignedGossipMessage>,
    connection_info: Arc<ConnectionInfo>,
    respond: Responder,
}

impl ReceivedMessage {
    pub(crate) fn new(
        message: Arc<SignedGossipMessage>,
        connection_info: Arc<ConnectionInfo>,
        respond: Responder,
    ) -> Self {
        Self {
            message,
            connection_info,
            respond,
        }
    }

    pub fn gossip_message(&self) -> &GossipMessage {
        &self.message.message
    }

    pub fn signed_message(&self) -> &SignedGossipMessage {
        &self.message
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    /// Sends `msg` back over the connection this message arrived on.
    pub fn respond(&self, msg: GossipMessage) {
        (self.respond)(msg)
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("nonce", &self.message.message.nonce)
            .field("from", &self.connection_info.id)
            .finish()
    }
}
