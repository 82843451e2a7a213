//! A live, authenticated connection to one peer.
//!
//! Each connection runs two tasks: a reader that decodes envelopes and hands
//! them to the dispatcher, and a writer that drains the bounded outbound
//! queue. Writes are therefore serialized per connection and independent
//! across connections.
//!
//! A connection ends in one of two ways. `close` cuts it at once and drops
//! whatever is still queued. `retire` takes it out of service when another
//! connection to the same peer supersedes it: the backlog moves to the
//! successor, the write half is shut down, and the reader keeps delivering
//! until the peer shuts down its side too.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::network::connection_store::ConnectionStore;
use crate::network::dispatcher::Dispatcher;
use crate::network::liveness::LivenessMonitor;
use crate::network::message::{GossipMessage, ReceivedMessage, Responder};
use crate::network::signed_message::{Envelope, SignedGossipMessage};
use crate::network::tls::SecureStream;
use crate::network::wire;
use crate::types::{ConnectionInfo, PkiId};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const HANDOVER_POLL: Duration = Duration::from_millis(10);

/// Direction of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,  // Peer connected to us
    Outbound, // We connected to peer
}

/// Shared collaborators every connection task needs.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub dispatcher: Arc<Dispatcher>,
    pub liveness: Arc<LivenessMonitor>,
    pub store: Arc<ConnectionStore>,
    pub send_buff_size: usize,
    pub max_frame_size: u32,
    pub conn_timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct Connection {
    id: u64,
    info: Arc<ConnectionInfo>,
    direction: ConnectionDirection,
    outbound: mpsc::Sender<Envelope>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    /// Hard stop for both tasks
    cancel: CancellationToken,
    /// Out of service; child of `cancel`
    retired: CancellationToken,
    linger: Duration,
}

impl Connection {
    /// Takes ownership of an authenticated stream and starts its reader and writer.
    pub(crate) fn spawn(
        stream: SecureStream,
        info: ConnectionInfo,
        direction: ConnectionDirection,
        ctx: ConnectionContext,
    ) -> Arc<Connection> {
        let (tx, rx) = mpsc::channel(ctx.send_buff_size.max(1));
        let now = Instant::now();
        let cancel = ctx.cancel.child_token();
        let retired = cancel.child_token();
        let conn = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            info: Arc::new(info),
            direction,
            outbound: tx,
            connected_at: now,
            last_activity: Mutex::new(now),
            cancel,
            retired,
            linger: ctx.conn_timeout,
        });

        tracing::debug!(
            "🔗 {:?} connection #{} to {} ({}) established",
            direction,
            conn.id,
            conn.info.id,
            conn.info.endpoint
        );

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(read_loop(conn.clone(), reader, ctx.clone()));
        tokio::spawn(write_loop(conn.clone(), writer, rx, ctx));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pki_id(&self) -> &PkiId {
        &self.info.id
    }

    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Queues an envelope without waiting. The envelope comes back when the
    /// queue is full or the connection is out of service.
    pub fn try_enqueue(&self, envelope: Envelope) -> Result<(), TrySendError<Envelope>> {
        if self.is_closed() {
            return Err(TrySendError::Closed(envelope));
        }
        self.outbound.try_send(envelope)
    }

    pub fn mark_active(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("🔌 Closing connection #{} to {}", self.id, self.info.id);
            self.cancel.cancel();
        }
    }

    /// Takes the connection out of service without cutting it. It is closed
    /// for good once the peer hangs up or after the linger period.
    pub fn retire(&self) {
        if self.retired.is_cancelled() {
            return;
        }
        tracing::debug!("🔁 Retiring connection #{} to {}", self.id, self.info.id);
        self.retired.cancel();

        let cancel = self.cancel.clone();
        let linger = self.linger;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(linger) => cancel.cancel(),
                    }
                });
            }
            Err(_) => self.cancel.cancel(),
        }
    }

    /// True once the connection no longer takes new messages.
    pub fn is_closed(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Reply path bound to this connection's outbound queue. Replies share the
    /// non-blocking enqueue with sends, so they leave in the order they were made.
    fn responder(&self) -> Responder {
        let tx = self.outbound.clone();
        let peer = self.info.id.clone();
        Arc::new(move |msg: GossipMessage| {
            let envelope = match SignedGossipMessage::noop_sign(msg) {
                Ok(signed) => signed.envelope,
                Err(e) => {
                    tracing::warn!("Failed to encode response to {}: {}", peer, e);
                    return;
                }
            };
            match tx.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("📭 Outbound queue to {} full, dropping response", peer);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Response to {} dropped: connection closed", peer);
                }
            }
        })
    }
}

async fn read_loop(conn: Arc<Connection>, mut reader: ReadHalf<SecureStream>, ctx: ConnectionContext) {
    let responder = conn.responder();
    let mut peer_hung_up = false;

    loop {
        let next = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            next = wire::read_envelope(&mut reader, ctx.max_frame_size) => next,
        };

        let envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::debug!("🔌 Peer {} disconnected (EOF)", conn.info.id);
                peer_hung_up = true;
                break;
            }
            Err(e) => {
                tracing::debug!("❌ Read error from {}: {}", conn.info.id, e);
                break;
            }
        };
        conn.mark_active();

        let message = match envelope.to_gossip_message() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("❌ Malformed envelope from {}: {}", conn.info.id, e);
                break;
            }
        };
        if message.message.is_connection_message() {
            tracing::warn!(
                "🚫 {} sent a connection message on an established connection",
                conn.info.id
            );
            break;
        }

        let received = ReceivedMessage::new(Arc::new(message), conn.info.clone(), responder.clone());
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            _ = ctx.dispatcher.dispatch(received) => {}
        }
    }

    // An orderly hang-up may mean the peer moved to another connection
    if peer_hung_up {
        conn.retire();
    } else {
        conn.close();
    }
    ctx.store.remove(&conn);
}

async fn write_loop(
    conn: Arc<Connection>,
    mut writer: WriteHalf<SecureStream>,
    mut rx: mpsc::Receiver<Envelope>,
    ctx: ConnectionContext,
) {
    loop {
        let envelope = tokio::select! {
            _ = conn.retired.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let frame = match wire::serialize_frame(&envelope, ctx.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping message to {}: {}", conn.info.id, e);
                continue;
            }
        };

        let written = tokio::time::timeout(ctx.conn_timeout, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => {
                conn.mark_active();
                ctx.liveness.record_success(&conn.info.id);
            }
            Ok(Err(e)) => {
                ctx.liveness.record_failure(&conn.info.id, &e.to_string());
                break;
            }
            Err(_) => {
                ctx.liveness.record_failure(&conn.info.id, "write timed out");
                break;
            }
        }
    }

    rx.close();
    let mut backlog = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        backlog.push(envelope);
    }

    if conn.cancel.is_cancelled() || !conn.retired.is_cancelled() {
        // Cut short: failed write, or closed on purpose
        conn.close();
        ctx.store.remove(&conn);
        if !backlog.is_empty() {
            tracing::debug!(
                "Dropping {} queued message(s) to {} with connection #{}",
                backlog.len(),
                conn.info.id,
                conn.id
            );
        }
    } else {
        hand_over(&conn, backlog, &ctx).await;
    }
    let _ = tokio::time::timeout(Duration::from_millis(200), writer.shutdown()).await;
}

/// Moves a retired connection's backlog to the peer's surviving connection.
/// The successor may still be finishing its handshake, so wait for it up to
/// the linger period.
async fn hand_over(conn: &Connection, backlog: Vec<Envelope>, ctx: &ConnectionContext) {
    if backlog.is_empty() {
        return;
    }

    let deadline = Instant::now() + conn.linger;
    let successor = loop {
        if let Some(next) = ctx.store.get_by_id(&conn.info.id) {
            if next.id() != conn.id {
                break Some(next);
            }
        }
        if ctx.store.is_closed() || conn.cancel.is_cancelled() || Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(HANDOVER_POLL).await;
    };

    match successor {
        Some(next) => {
            tracing::debug!(
                "🔁 Moving {} queued message(s) to {} from #{} to #{}",
                backlog.len(),
                conn.info.id,
                conn.id,
                next.id()
            );
            for envelope in backlog {
                if next.try_enqueue(envelope).is_err() {
                    ctx.liveness.record_failure(&conn.info.id, "outbound queue full");
                }
            }
        }
        None => {
            tracing::debug!(
                "Dropping {} queued message(s) to {}: no connection took over from #{}",
                backlog.len(),
                conn.info.id,
                conn.id
            );
            ctx.liveness.record_failure(&conn.info.id, "connection retired with messages queued");
        }
    }
}
