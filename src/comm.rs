//! The comm facade: authenticated point-to-point messaging between gossip peers.
//!
//! A [`Comm`] owns a listener, a table of live connections, the subscriber
//! registry and the liveness tracker. Outbound connections are opened lazily
//! on the first send to a peer and reused afterwards; inbound connections are
//! registered as soon as their handshake completes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::config::CommConfig;
use crate::crypto::MessageCryptoService;
use crate::error::CommError;
use crate::identity::IdentityMapper;
use crate::network::blacklist::Blacklist;
use crate::network::connection::{Connection, ConnectionContext, ConnectionDirection};
use crate::network::connection_store::ConnectionStore;
use crate::network::dispatcher::{Dispatcher, Subscription};
use crate::network::handshake::Handshaker;
use crate::network::liveness::LivenessMonitor;
use crate::network::message::ReceivedMessage;
use crate::network::server::NetworkServer;
use crate::network::signed_message::{Envelope, SignedGossipMessage};
use crate::network::tls::{peer_cert_hash, SecureStream, TlsConfig};
use crate::shutdown::ShutdownManager;
use crate::types::{ConnectionInfo, PeerIdentity, PkiId, RemotePeer};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// A send that finds its connection retired tries once more on the successor
const ENQUEUE_ATTEMPTS: usize = 2;

/// Handle to a running comm instance. Cheap to clone; all clones share the
/// same listener and connections.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<CommInner>,
}

struct CommInner {
    pki_id: PkiId,
    identity: PeerIdentity,
    endpoint: String,
    local_addr: SocketAddr,
    tls: TlsConfig,
    handshaker: Arc<Handshaker>,
    store: Arc<ConnectionStore>,
    dispatcher: Arc<Dispatcher>,
    liveness: Arc<LivenessMonitor>,
    blacklist: Arc<Blacklist>,
    ctx: ConnectionContext,
    dial_timeout_ms: AtomicU64,
    runtime: Handle,
    shutdown: ShutdownManager,
    stopped: AtomicBool,
}

impl Comm {
    /// Binds the listener and starts accepting peers. TLS material comes from
    /// `config.tls` or, when absent, a freshly generated self-signed certificate.
    pub async fn bind(
        config: CommConfig,
        mcs: Arc<dyn MessageCryptoService>,
        identity: PeerIdentity,
    ) -> Result<Self, CommError> {
        let tls = match &config.tls {
            Some(settings) => TlsConfig::from_pem_files(&settings.cert_path, &settings.key_path)?,
            None => TlsConfig::new_self_signed()?,
        };
        Self::bind_with_tls(config, mcs, identity, tls).await
    }

    pub async fn bind_with_tls(
        config: CommConfig,
        mcs: Arc<dyn MessageCryptoService>,
        identity: PeerIdentity,
        tls: TlsConfig,
    ) -> Result<Self, CommError> {
        config.validate()?;
        let id_mapper = Arc::new(IdentityMapper::new(mcs, identity.clone())?);
        let pki_id = id_mapper.self_pki_id().clone();

        let listener = TcpListener::bind(&config.listen_address).await?;
        let local_addr = listener.local_addr()?;
        let endpoint = config
            .external_endpoint
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let blacklist = Arc::new(Blacklist::new());
        let dispatcher = Arc::new(Dispatcher::new(config.recv_buff_size, blacklist.clone()));
        let liveness = Arc::new(LivenessMonitor::new(
            config.presumed_dead_threshold,
            config.presumed_dead_window(),
        ));
        let store = Arc::new(ConnectionStore::new(pki_id.clone()));
        let shutdown = ShutdownManager::new();

        let handshaker = Arc::new(Handshaker::new(
            id_mapper,
            identity.clone(),
            endpoint.clone(),
            tls.server_cert_hash().to_vec(),
            tls.self_cert_hash().map(<[u8]>::to_vec),
            config.skip_handshake,
            config.max_frame_size,
            blacklist.clone(),
        ));

        let ctx = ConnectionContext {
            dispatcher: dispatcher.clone(),
            liveness: liveness.clone(),
            store: store.clone(),
            send_buff_size: config.send_buff_size,
            max_frame_size: config.max_frame_size,
            conn_timeout: config.conn_timeout(),
            cancel: shutdown.token(),
        };

        let server = NetworkServer::new(listener, tls.clone(), handshaker.clone(), ctx.clone());
        shutdown.register_task(tokio::spawn(server.run()));
        shutdown.register_task(tokio::spawn(sweep_loop(
            store.clone(),
            blacklist.clone(),
            config.idle_timeout(),
            shutdown.token(),
        )));

        tracing::info!(
            "🚀 Comm {} listening on {} (advertised as {}, skip_handshake: {})",
            pki_id,
            local_addr,
            endpoint,
            config.skip_handshake
        );

        Ok(Self {
            inner: Arc::new(CommInner {
                pki_id,
                identity,
                endpoint,
                local_addr,
                tls,
                handshaker,
                store,
                dispatcher,
                liveness,
                blacklist,
                ctx,
                dial_timeout_ms: AtomicU64::new(config.dial_timeout_ms),
                runtime: Handle::current(),
                shutdown,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn pki_id(&self) -> &PkiId {
        &self.inner.pki_id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    /// Endpoint advertised to peers in the handshake.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Fire-and-forget delivery of `msg` to every destination. Never waits:
    /// the message goes onto the peer's outbound queue, or a background dial
    /// when there is no connection yet. A full queue drops the message.
    /// Failures are reported to the liveness monitor only; blacklisted
    /// destinations are skipped without dialing.
    pub fn send(&self, msg: &SignedGossipMessage, peers: &[RemotePeer]) {
        if self.is_stopped() {
            tracing::debug!("Send after stop ignored");
            return;
        }
        for peer in peers {
            if self.inner.blacklist.is_blacklisted(&peer.pki_id) {
                tracing::debug!("🚫 Not sending to blacklisted {}", peer);
                continue;
            }
            self.inner.deliver(msg.envelope.clone(), peer);
        }
    }

    /// Subscribes to inbound messages matching `predicate`.
    pub fn accept<P>(&self, predicate: P) -> Subscription
    where
        P: Fn(&ReceivedMessage) -> bool + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(predicate)
    }

    /// Checks that `peer` accepts TCP and completes a TLS session, without
    /// running the identity handshake.
    pub async fn probe(&self, peer: &RemotePeer) -> Result<(), CommError> {
        self.ensure_running()?;
        let deadline = Instant::now() + self.dial_timeout();
        let mut stream = self.inner.open_session(&peer.endpoint, deadline).await?;
        let _ = tokio::time::timeout(Duration::from_millis(200), stream.shutdown()).await;
        tracing::debug!("✅ Probe of {} succeeded", peer.endpoint);
        Ok(())
    }

    /// Runs the full handshake with `peer` on a throwaway connection and
    /// returns the identity it proved. An empty `peer.pki_id` accepts
    /// whichever identity answers.
    pub async fn handshake(&self, peer: &RemotePeer) -> Result<PeerIdentity, CommError> {
        self.ensure_running()?;
        let (mut stream, info) = self.inner.establish(peer).await?;
        let _ = tokio::time::timeout(Duration::from_millis(200), stream.shutdown()).await;
        Ok(info.identity)
    }

    /// Stops sending to and delivering from `pki_id`, and closes any live
    /// connection with it. Local only; the peer is not told.
    pub fn blacklist(&self, pki_id: &PkiId) {
        self.inner.blacklist.add(pki_id.clone());
        self.inner.store.close_by_id(pki_id);
    }

    pub fn is_blacklisted(&self, pki_id: &PkiId) -> bool {
        self.inner.blacklist.is_blacklisted(pki_id)
    }

    /// PKI-IDs of peers presumed dead after repeated send failures.
    pub fn presumed_dead(&self) -> broadcast::Receiver<PkiId> {
        self.inner.liveness.subscribe()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.dial_timeout_ms.load(Ordering::Relaxed))
    }

    /// Adjusts the bound on future dial attempts. Attempts in flight keep their deadline.
    pub fn set_dial_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        self.inner.dial_timeout_ms.store(millis, Ordering::Relaxed);
    }

    /// PKI-IDs with a live connection, inbound or outbound.
    pub fn connected_peers(&self) -> Vec<PkiId> {
        self.inner.store.connected_peers()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Closes every connection and subscription and stops the listener.
    /// Idempotent; later operations fail with [`CommError::Closed`].
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("🛑 Stopping comm {}", self.inner.pki_id);
        self.inner.dispatcher.close();
        self.inner.store.close_all();
        self.inner.liveness.reset();
        self.inner.shutdown.shutdown(SHUTDOWN_TIMEOUT).await;
    }

    fn ensure_running(&self) -> Result<(), CommError> {
        if self.is_stopped() {
            Err(CommError::Closed)
        } else {
            Ok(())
        }
    }
}

impl CommInner {
    fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms.load(Ordering::Relaxed))
    }

    /// Enqueues on the live connection to `peer` when there is one, and hands
    /// off to a background dial otherwise.
    fn deliver(self: &Arc<Self>, envelope: Envelope, peer: &RemotePeer) {
        let envelope = match self.store.lookup(peer) {
            Some(conn) => match conn.try_enqueue(envelope) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    self.record_overflow(&conn);
                    return;
                }
                Err(TrySendError::Closed(envelope)) => envelope,
            },
            None => envelope,
        };

        let inner = self.clone();
        let peer = peer.clone();
        self.runtime.spawn(async move {
            inner.send_to(envelope, peer).await;
        });
    }

    async fn send_to(self: Arc<Self>, mut envelope: Envelope, peer: RemotePeer) {
        for _ in 0..ENQUEUE_ATTEMPTS {
            let conn = match self
                .store
                .get_or_dial(&peer, || self.dial(&peer))
                .await
            {
                Ok(conn) => conn,
                Err(CommError::Closed) => return,
                Err(CommError::Blacklisted(pki_id)) => {
                    tracing::debug!("🚫 {} turned out to be blacklisted {}", peer.endpoint, pki_id);
                    return;
                }
                Err(e) => {
                    self.record_failure(&peer.pki_id, &e);
                    return;
                }
            };

            match conn.try_enqueue(envelope) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    self.record_overflow(&conn);
                    return;
                }
                Err(TrySendError::Closed(returned)) => {
                    tracing::debug!(
                        "Connection #{} to {} went out of service, retrying",
                        conn.id(),
                        conn.pki_id()
                    );
                    envelope = returned;
                }
            }
        }
        self.record_failure(&peer.pki_id, "connection kept closing under the send");
    }

    fn record_overflow(&self, conn: &Connection) {
        tracing::debug!("📭 Outbound queue to {} full, dropping message", conn.pki_id());
        self.record_failure(conn.pki_id(), "outbound queue full");
    }

    fn record_failure(&self, pki_id: &PkiId, reason: impl std::fmt::Display) {
        if pki_id.is_empty() {
            tracing::debug!("❌ Send to unidentified peer failed: {}", reason);
            return;
        }
        self.liveness.record_failure(pki_id, &reason.to_string());
    }

    async fn dial(&self, peer: &RemotePeer) -> Result<Arc<Connection>, CommError> {
        let (stream, info) = self.establish(peer).await?;
        Ok(Connection::spawn(
            stream,
            info,
            ConnectionDirection::Outbound,
            self.ctx.clone(),
        ))
    }

    /// TCP connect, TLS and the active handshake under one dial deadline.
    async fn establish(&self, peer: &RemotePeer) -> Result<(SecureStream, ConnectionInfo), CommError> {
        let deadline = Instant::now() + self.dial_timeout();
        let mut stream = self.open_session(&peer.endpoint, deadline).await?;

        let remote_cert = peer_cert_hash(&stream);
        let info = tokio::time::timeout_at(
            deadline,
            self.handshaker.authenticate_active(
                &mut stream,
                remote_cert.as_deref(),
                &peer.endpoint,
                &peer.pki_id,
            ),
        )
        .await
        .map_err(|_| CommError::HandshakeFailed(format!("{} timed out", peer.endpoint)))?
        .map_err(|e| {
            tracing::warn!("🚫 Handshake with {} failed: {}", peer, e);
            e
        })?;
        Ok((stream, info))
    }

    async fn open_session(&self, endpoint: &str, deadline: Instant) -> Result<SecureStream, CommError> {
        let tcp = tokio::time::timeout_at(deadline, TcpStream::connect(endpoint))
            .await
            .map_err(|_| CommError::unreachable(endpoint, "connect timed out"))?
            .map_err(|e| CommError::unreachable(endpoint, e))?;
        tcp.set_nodelay(true)
            .map_err(|e| CommError::unreachable(endpoint, e))?;

        tokio::time::timeout_at(deadline, self.tls.connect_client(tcp))
            .await
            .map_err(|_| CommError::unreachable(endpoint, "TLS handshake timed out"))?
            .map_err(|e| CommError::unreachable(endpoint, e))
    }
}

async fn sweep_loop(
    store: Arc<ConnectionStore>,
    blacklist: Arc<Blacklist>,
    idle_timeout: Option<Duration>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let period = idle_timeout.map_or(SWEEP_INTERVAL, |t| (t / 2).min(SWEEP_INTERVAL));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let closed = store.sweep(idle_timeout, &blacklist);
                if closed > 0 {
                    tracing::debug!("🧹 Swept {} connection(s)", closed);
                }
            }
        }
    }
}
