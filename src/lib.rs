//! Authenticated transport for gossip peers.
//!
//! [`Comm`] dials peers over mutual TLS, proves identities with a signed
//! handshake bound to the TLS session, fans inbound messages out to
//! predicate-filtered subscribers and flags peers that stop answering.

pub mod comm;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod logging;
pub mod network;
pub mod shutdown;
pub mod types;

pub use comm::Comm;
pub use config::{CommConfig, LoggingConfig, TlsSettings};
pub use crypto::{Ed25519CryptoService, HmacCryptoService, MessageCryptoService};
pub use error::{CommError, CryptoError};
pub use network::dispatcher::Subscription;
pub use network::handshake::connection_message;
pub use network::message::{ConnectionMessage, Content, DataMessage, GossipMessage, ReceivedMessage, Tag};
pub use network::signed_message::{Envelope, SignedGossipMessage};
pub use network::tls::TlsConfig;
pub use types::{AuthInfo, ChannelId, ConnectionInfo, PeerIdentity, PkiId, RemotePeer};
