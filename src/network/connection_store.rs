//! Registry of live connections keyed by PKI-ID.
//!
//! Holds at most one live connection per peer. Outbound dials to the same
//! peer are single-flight, keyed by PKI-ID or, while the PKI-ID is unknown,
//! by endpoint. A connection that loses an install race is retired and the
//! caller adopts the winner.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CommError;
use crate::network::blacklist::Blacklist;
use crate::network::connection::{Connection, ConnectionDirection};
use crate::types::{PkiId, RemotePeer};

/// What concurrent dials to the same peer serialize on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DialKey {
    Pki(PkiId),
    Endpoint(String),
}

impl DialKey {
    fn of(peer: &RemotePeer) -> Self {
        if peer.pki_id.is_empty() {
            DialKey::Endpoint(peer.endpoint.clone())
        } else {
            DialKey::Pki(peer.pki_id.clone())
        }
    }
}

type DialLock = Arc<tokio::sync::Mutex<()>>;

pub struct ConnectionStore {
    local_pki_id: PkiId,
    connections: Mutex<HashMap<PkiId, Arc<Connection>>>,
    dial_locks: DashMap<DialKey, DialLock>,
    /// PKI-IDs that dials to endpoints without a known PKI-ID resolved to
    endpoint_ids: DashMap<String, PkiId>,
    closed: AtomicBool,
}

impl ConnectionStore {
    pub fn new(local_pki_id: PkiId) -> Self {
        Self {
            local_pki_id,
            connections: Mutex::new(HashMap::new()),
            dial_locks: DashMap::new(),
            endpoint_ids: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Live connection to `pki_id`, if any.
    pub fn get_by_id(&self, pki_id: &PkiId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock();
        match connections.get(pki_id) {
            Some(conn) if !conn.is_closed() => Some(conn.clone()),
            Some(_) => {
                connections.remove(pki_id);
                None
            }
            None => None,
        }
    }

    /// Live connection serving `peer`. Without a PKI-ID, the peer an earlier
    /// dial to the same endpoint turned out to be qualifies.
    pub fn lookup(&self, peer: &RemotePeer) -> Option<Arc<Connection>> {
        if !peer.pki_id.is_empty() {
            return self.get_by_id(&peer.pki_id);
        }
        let pki_id = self.endpoint_ids.get(&peer.endpoint)?.clone();
        let conn = self.get_by_id(&pki_id);
        if conn.is_none() {
            self.endpoint_ids.remove_if(&peer.endpoint, |_, id| *id == pki_id);
        }
        conn
    }

    /// Returns the live connection to `peer`, running `dial` to create one
    /// if needed. Concurrent callers for the same peer share one dial.
    pub async fn get_or_dial<F, Fut>(
        &self,
        peer: &RemotePeer,
        dial: F,
    ) -> Result<Arc<Connection>, CommError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Connection>, CommError>>,
    {
        if self.is_closed() {
            return Err(CommError::Closed);
        }

        if let Some(conn) = self.lookup(peer) {
            return Ok(conn);
        }

        let key = DialKey::of(peer);
        let lock = self
            .dial_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            // Whoever held the lock before us may have connected already
            if let Some(conn) = self.lookup(peer) {
                Ok(conn)
            } else if self.is_closed() {
                Err(CommError::Closed)
            } else {
                match dial().await {
                    Ok(conn) => {
                        if peer.pki_id.is_empty() {
                            self.endpoint_ids
                                .insert(peer.endpoint.clone(), conn.pki_id().clone());
                        }
                        self.install(conn)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.release_dial_lock(&key, &lock);
        result
    }

    /// Forgets the lock for `key` once no other caller holds or waits on it.
    fn release_dial_lock(&self, key: &DialKey, lock: &DialLock) {
        // One reference in the map, one held by the caller
        self.dial_locks.remove_if(key, |_, current| {
            Arc::ptr_eq(current, lock) && Arc::strong_count(current) <= 2
        });
    }

    /// Compare-and-install for a dialed connection. An existing live
    /// connection wins and the new one is retired, except that an inbound
    /// connection yields to ours when we hold the lower PKI-ID.
    pub fn install(&self, conn: Arc<Connection>) -> Result<Arc<Connection>, CommError> {
        let mut connections = self.connections.lock();
        if self.is_closed() {
            conn.close();
            return Err(CommError::Closed);
        }

        if let Some(existing) = connections.get(conn.pki_id()) {
            if !existing.is_closed() && existing.id() != conn.id() {
                let ours_wins = existing.direction() == ConnectionDirection::Inbound
                    && conn.direction() == ConnectionDirection::Outbound
                    && self.local_pki_id < *conn.pki_id();
                if ours_wins {
                    existing.retire();
                    connections.insert(conn.pki_id().clone(), conn.clone());
                    return Ok(conn);
                }
                tracing::debug!(
                    "Adopting existing connection #{} to {}, closing #{}",
                    existing.id(),
                    conn.pki_id(),
                    conn.id()
                );
                let existing = existing.clone();
                conn.retire();
                return Ok(existing);
            }
        }

        connections.insert(conn.pki_id().clone(), conn.clone());
        tracing::debug!("✅ Registered connection #{} to {}", conn.id(), conn.pki_id());
        Ok(conn)
    }

    /// Registers an accepted connection. A previous inbound connection from
    /// the same peer is replaced (the peer reconnected). When both sides dialed
    /// each other, the connection dialed by the lower PKI-ID is kept on both ends.
    pub fn on_inbound(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock();
        if self.is_closed() {
            conn.close();
            return None;
        }

        if let Some(existing) = connections.get(conn.pki_id()) {
            if !existing.is_closed() {
                let replace = match existing.direction() {
                    ConnectionDirection::Inbound => true,
                    ConnectionDirection::Outbound => *conn.pki_id() < self.local_pki_id,
                };
                if !replace {
                    tracing::debug!(
                        "Keeping outbound connection #{} to {}, rejecting inbound #{}",
                        existing.id(),
                        conn.pki_id(),
                        conn.id()
                    );
                    conn.retire();
                    return None;
                }
                existing.retire();
            }
        }

        connections.insert(conn.pki_id().clone(), conn.clone());
        tracing::debug!(
            "✅ Registered inbound connection #{} from {}",
            conn.id(),
            conn.pki_id()
        );
        Some(conn)
    }

    /// Drops `conn` from the table if it is still the registered one.
    pub fn remove(&self, conn: &Connection) {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(conn.pki_id()) {
            if existing.id() == conn.id() {
                connections.remove(conn.pki_id());
                tracing::debug!("🔌 Unregistered connection #{} to {}", conn.id(), conn.pki_id());
            }
        }
    }

    pub fn close_by_id(&self, pki_id: &PkiId) {
        if let Some(conn) = self.connections.lock().remove(pki_id) {
            conn.close();
        }
    }

    /// Closes connections idle for longer than `idle_timeout` and any whose
    /// peer has been blacklisted. Returns how many were closed.
    pub fn sweep(&self, idle_timeout: Option<Duration>, blacklist: &Blacklist) -> usize {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|pki_id, conn| {
            let idle = idle_timeout.is_some_and(|limit| conn.idle_duration() > limit);
            let keep = !conn.is_closed() && !idle && !blacklist.is_blacklisted(pki_id);
            if !keep {
                if idle {
                    tracing::debug!("⏱️  Closing idle connection to {}", pki_id);
                }
                conn.close();
            }
            keep
        });
        before - connections.len()
    }

    pub fn connected_peers(&self) -> Vec<PkiId> {
        self.connections
            .lock()
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .map(|(pki_id, _)| pki_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every connection and refuses new ones. Idempotent.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            self.closed.store(true, Ordering::Release);
            connections.drain().map(|(_, conn)| conn).collect()
        };
        if !drained.is_empty() {
            tracing::debug!("Closing {} connection(s)", drained.len());
        }
        for conn in drained {
            conn.close();
        }
        self.dial_locks.clear();
        self.endpoint_ids.clear();
    }
}
