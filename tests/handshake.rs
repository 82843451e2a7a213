//! Handshake tests driven by a hand-rolled client speaking the wire protocol
//! directly, so individual fields of the connection message can be tampered with.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use gossip_comm::network::tls::{peer_cert_hash, SecureStream};
use gossip_comm::network::wire::{self, MAX_FRAME_SIZE};
use gossip_comm::{
    connection_message, Comm, CommConfig, CommError, HmacCryptoService, MessageCryptoService,
    PeerIdentity, PkiId, RemotePeer, TlsConfig,
};
use tokio::net::{TcpListener, TcpStream};

const RAW_PEER: &str = "raw-peer";

async fn raw_session(comm: &Comm, tls: &TlsConfig) -> SecureStream {
    let tcp = TcpStream::connect(comm.endpoint()).await.unwrap();
    tls.connect_client(tcp).await.unwrap()
}

/// Sends a connection message built by `tamper` and returns what came back:
/// the acceptor's handshake reply, or None if it hung up.
async fn raw_handshake<F>(comm: &Comm, tamper: F) -> (SecureStream, Option<PkiId>)
where
    F: FnOnce(&TlsConfig) -> gossip_comm::SignedGossipMessage,
{
    let tls = TlsConfig::new_self_signed().unwrap();
    let mut stream = raw_session(comm, &tls).await;
    let msg = tamper(&tls);
    wire::write_envelope(&mut stream, &msg.envelope, MAX_FRAME_SIZE)
        .await
        .unwrap();

    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        wire::read_envelope(&mut stream, MAX_FRAME_SIZE),
    )
    .await
    .expect("acceptor neither answered nor hung up");

    let pki_id = match reply {
        Ok(Some(envelope)) => envelope
            .to_gossip_message()
            .ok()
            .and_then(|m| m.message.connection_message().map(|c| c.pki_id.clone())),
        _ => None,
    };
    (stream, pki_id)
}

fn signed_by_raw_peer(pki_id: &str, cert_hash: Vec<u8>) -> gossip_comm::SignedGossipMessage {
    let sec = HmacCryptoService::new(vec![0, 0, 0]);
    connection_message(
        PkiId::from(pki_id),
        PeerIdentity::from(RAW_PEER),
        cert_hash,
        "127.0.0.1:1".to_string(),
        |payload| Ok(sec.sign(payload)?),
    )
    .unwrap()
}

/// A listener that answers every dialer's connection message with the
/// reply built by `reply`, then holds the session until the dialer leaves.
async fn answering_listener<F>(reply: F) -> String
where
    F: Fn(&TlsConfig) -> gossip_comm::SignedGossipMessage + Send + Sync + 'static,
{
    let tls = TlsConfig::new_self_signed().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let tls = tls.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut stream = match tls.accept_server(tcp).await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                if let Ok(Some(_)) = wire::read_envelope(&mut stream, MAX_FRAME_SIZE).await {
                    let msg = reply(&tls);
                    let _ = wire::write_envelope(&mut stream, &msg.envelope, MAX_FRAME_SIZE).await;
                    let _ = wire::read_envelope(&mut stream, MAX_FRAME_SIZE).await;
                }
            });
        }
    });
    endpoint
}

#[tokio::test]
async fn test_tampered_handshake_reply_rejected() {
    let comm = new_comm("peer1").await;

    let flipped = answering_listener(|tls| {
        let mut msg = signed_by_raw_peer(RAW_PEER, tls.server_cert_hash().to_vec());
        msg.envelope.signature[0] ^= 0x01;
        msg
    })
    .await;
    let relayed = answering_listener(|_| {
        let other = TlsConfig::new_self_signed().unwrap();
        signed_by_raw_peer(RAW_PEER, other.server_cert_hash().to_vec())
    })
    .await;

    for endpoint in [flipped, relayed] {
        let peer = RemotePeer::new(endpoint.as_str(), PkiId::default());
        let err = comm.handshake(&peer).await.unwrap_err();
        assert!(matches!(err, CommError::HandshakeFailed(_)), "unexpected error: {}", err);

        // A send through the same acceptor never yields a usable connection
        comm.send(&data_msg(1), &[peer]);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(comm.connected_peers().is_empty());

    // The same acceptor answering honestly is accepted
    let honest = answering_listener(|tls| {
        signed_by_raw_peer(RAW_PEER, tls.server_cert_hash().to_vec())
    })
    .await;
    let peer = RemotePeer::new(honest.as_str(), PkiId::default());
    assert_eq!(comm.handshake(&peer).await.unwrap(), PeerIdentity::from(RAW_PEER));

    comm.stop().await;
}

#[tokio::test]
async fn test_compliant_raw_client_is_accepted() {
    let comm = new_comm("peer1").await;
    let mut sub = comm.accept(|_| true);

    let (mut stream, reply) = raw_handshake(&comm, |tls| {
        signed_by_raw_peer(RAW_PEER, tls.self_cert_hash().unwrap().to_vec())
    })
    .await;
    assert_eq!(reply.as_ref(), Some(comm.pki_id()));

    // The acceptor presented a server certificate on the session
    assert!(peer_cert_hash(&stream).is_some());

    wire::write_envelope(&mut stream, &data_msg(9).envelope, MAX_FRAME_SIZE)
        .await
        .unwrap();
    let m = recv_within(&mut sub, RECV_TIMEOUT).await.expect("data not delivered");
    assert_eq!(m.gossip_message().nonce, 9);
    assert_eq!(m.connection_info().id, PkiId::from(RAW_PEER));

    comm.stop().await;
}

#[tokio::test]
async fn test_corrupted_signature_rejected() {
    let comm = new_comm("peer1").await;
    let mut sub = comm.accept(|_| true);

    let (mut stream, reply) = raw_handshake(&comm, |tls| {
        let mut msg = signed_by_raw_peer(RAW_PEER, tls.self_cert_hash().unwrap().to_vec());
        msg.envelope.signature[0] ^= 0x01;
        msg
    })
    .await;
    assert!(reply.is_none());

    // Nothing sent afterwards reaches subscribers
    let _ = wire::write_envelope(&mut stream, &data_msg(1).envelope, MAX_FRAME_SIZE).await;
    assert!(recv_within(&mut sub, Duration::from_millis(500)).await.is_none());
    assert!(comm.connected_peers().is_empty());

    comm.stop().await;
}

#[tokio::test]
async fn test_mutated_pki_id_rejected() {
    let comm = new_comm("peer1").await;

    // Valid signature by raw-peer, but claims someone else's PKI-ID
    let (_stream, reply) = raw_handshake(&comm, |tls| {
        signed_by_raw_peer("peer2", tls.self_cert_hash().unwrap().to_vec())
    })
    .await;
    assert!(reply.is_none());
    assert!(comm.connected_peers().is_empty());

    comm.stop().await;
}

#[tokio::test]
async fn test_foreign_certificate_hash_rejected() {
    let comm = new_comm("peer1").await;

    // A relayed handshake carries the hash of a certificate not used on this session
    let (_stream, reply) = raw_handshake(&comm, |_| {
        let other = TlsConfig::new_self_signed().unwrap();
        signed_by_raw_peer(RAW_PEER, other.self_cert_hash().unwrap().to_vec())
    })
    .await;
    assert!(reply.is_none());

    comm.stop().await;
}

#[tokio::test]
async fn test_unsigned_handshake_rejected() {
    let comm = new_comm("peer1").await;

    let (_stream, reply) = raw_handshake(&comm, |tls| {
        connection_message(
            PkiId::from(RAW_PEER),
            PeerIdentity::from(RAW_PEER),
            tls.self_cert_hash().unwrap().to_vec(),
            "127.0.0.1:1".to_string(),
            |_| Ok(Vec::new()),
        )
        .unwrap()
    })
    .await;
    assert!(reply.is_none());

    comm.stop().await;
}

#[tokio::test]
async fn test_data_before_handshake_rejected() {
    let comm = new_comm("peer1").await;
    let mut sub = comm.accept(|_| true);

    let (_stream, reply) = raw_handshake(&comm, |_| data_msg(3)).await;
    assert!(reply.is_none());
    assert!(recv_within(&mut sub, Duration::from_millis(300)).await.is_none());

    comm.stop().await;
}

#[tokio::test]
async fn test_no_mutual_tls_requires_skip_handshake() {
    let strict = new_comm("strict").await;
    let lax = new_comm_with(
        "lax",
        CommConfig {
            skip_handshake: true,
            ..CommConfig::default()
        },
    )
    .await;

    setup_logging();
    let anonymous = Comm::bind_with_tls(
        CommConfig::default(),
        naive_sec(),
        PeerIdentity::from("anonymous"),
        TlsConfig::new_self_signed_anonymous().unwrap(),
    )
    .await
    .unwrap();

    // Without a client certificate there is nothing to bind the handshake to
    let err = anonymous.handshake(&remote(&strict)).await.unwrap_err();
    assert!(err.is_authentication_failure(), "unexpected error: {}", err);
    assert!(!err.is_unreachable());

    // Skip mode takes the peer at its word
    assert_eq!(
        anonymous.handshake(&remote(&lax)).await.unwrap(),
        PeerIdentity::from("lax")
    );

    let mut sub = lax.accept(|_| true);
    anonymous.send(&data_msg(11), &[remote(&lax)]);
    let m = recv_within(&mut sub, RECV_TIMEOUT).await.expect("skip mode refused");
    assert_eq!(m.connection_info().id, PkiId::from("anonymous"));
    assert!(!m.connection_info().is_authenticated());

    // A compliant dialer still gets through to the strict peer
    let compliant = new_comm("compliant").await;
    assert_eq!(
        compliant.handshake(&remote(&strict)).await.unwrap(),
        PeerIdentity::from("strict")
    );

    for comm in [strict, lax, anonymous, compliant] {
        comm.stop().await;
    }
}

#[tokio::test]
async fn test_blacklisted_dialer_refused_at_handshake() {
    let comm1 = new_comm("peer1").await;
    let comm2 = new_comm("peer2").await;
    comm2.blacklist(comm1.pki_id());

    let err = comm1.handshake(&remote(&comm2)).await.unwrap_err();
    assert!(matches!(err, CommError::HandshakeFailed(_)));

    // comm1 answers comm2, but comm2 refuses to complete the handshake itself
    let peer1 = RemotePeer::new(comm1.endpoint(), PkiId::default());
    assert!(matches!(
        comm2.handshake(&peer1).await,
        Err(CommError::Blacklisted(id)) if &id == comm1.pki_id()
    ));

    comm1.stop().await;
    comm2.stop().await;
}
