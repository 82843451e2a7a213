//! Helpers shared by the end-to-end suites: loopback comm instances using the
//! shared-key HMAC crypto provider, where a peer's PKI-ID is its identity.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use gossip_comm::logging::init_logging;
use gossip_comm::{
    Comm, CommConfig, Content, DataMessage, GossipMessage, HmacCryptoService, LoggingConfig,
    MessageCryptoService, PeerIdentity, ReceivedMessage, RemotePeer, SignedGossipMessage,
    Subscription,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn naive_sec() -> Arc<dyn MessageCryptoService> {
    Arc::new(HmacCryptoService::new(vec![0, 0, 0]))
}

pub fn setup_logging() {
    let _ = init_logging(&LoggingConfig {
        level: "warn".to_string(),
        format: "compact".to_string(),
    });
}

pub async fn new_comm(name: &str) -> Comm {
    new_comm_with(name, CommConfig::default()).await
}

pub async fn new_comm_with(name: &str, config: CommConfig) -> Comm {
    setup_logging();
    Comm::bind(config, naive_sec(), PeerIdentity::from(name))
        .await
        .expect("comm should bind")
}

pub fn remote(comm: &Comm) -> RemotePeer {
    RemotePeer::new(comm.endpoint(), comm.pki_id().clone())
}

pub fn data_msg(nonce: u64) -> SignedGossipMessage {
    let msg = GossipMessage::new(
        nonce,
        Content::Data(DataMessage {
            seq_num: nonce,
            payload: nonce.to_be_bytes().to_vec(),
        }),
    );
    SignedGossipMessage::noop_sign(msg).expect("noop signing cannot fail")
}

pub async fn recv_within(sub: &mut Subscription, timeout: Duration) -> Option<ReceivedMessage> {
    tokio::time::timeout(timeout, sub.recv()).await.ok().flatten()
}

/// Receives `n` messages and returns their nonces. Panics on a duplicate or
/// when the stream stalls first.
pub async fn collect_nonces(sub: &mut Subscription, n: u64) -> HashSet<u64> {
    let mut seen = HashSet::new();
    while seen.len() < n as usize {
        let m = recv_within(sub, RECV_TIMEOUT)
            .await
            .unwrap_or_else(|| panic!("only {} of {} arrived", seen.len(), n));
        assert!(seen.insert(m.gossip_message().nonce), "duplicate delivery");
    }
    seen
}

/// A loopback address nothing listens on.
pub async fn dead_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
