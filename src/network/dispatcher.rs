//! Fan-out of inbound messages to predicate-filtered subscribers.
//!
//! Every subscriber whose predicate matches gets its own copy. Subscriber
//! buffers are bounded; a full buffer suspends the connection reader that is
//! delivering, so nothing is dropped and per-connection order is kept.

use futures_util::Stream;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::network::blacklist::Blacklist;
use crate::network::message::ReceivedMessage;

type Predicate = Arc<dyn Fn(&ReceivedMessage) -> bool + Send + Sync>;

struct SubscriptionEntry {
    id: u64,
    predicate: Predicate,
    tx: mpsc::Sender<ReceivedMessage>,
}

pub struct Dispatcher {
    registry: RwLock<Vec<Arc<SubscriptionEntry>>>,
    next_id: AtomicU64,
    buffer_size: usize,
    blacklist: Arc<Blacklist>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(buffer_size: usize, blacklist: Arc<Blacklist>) -> Self {
        Self {
            registry: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            buffer_size: buffer_size.max(1),
            blacklist,
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe<P>(&self, predicate: P) -> Subscription
    where
        P: Fn(&ReceivedMessage) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let mut registry = self.registry.write();
        // Checked under the lock so close() can't miss this entry
        if self.closed.load(Ordering::Acquire) {
            return Subscription { rx };
        }
        registry.retain(|entry| !entry.tx.is_closed());
        registry.push(Arc::new(SubscriptionEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            predicate: Arc::new(predicate),
            tx,
        }));
        Subscription { rx }
    }

    /// Delivers `msg` to every matching subscriber, waiting for buffer space.
    /// Returns how many subscribers received it.
    pub async fn dispatch(&self, msg: ReceivedMessage) -> usize {
        if self.blacklist.is_blacklisted(&msg.connection_info().id) {
            tracing::debug!(
                "Dropping message from blacklisted peer {}",
                msg.connection_info().id
            );
            return 0;
        }

        let snapshot: Vec<Arc<SubscriptionEntry>> = self.registry.read().clone();
        let mut delivered = 0;
        for entry in snapshot {
            if !(entry.predicate)(&msg) {
                continue;
            }
            if entry.tx.send(msg.clone()).await.is_ok() {
                delivered += 1;
            } else {
                self.unsubscribe(entry.id);
            }
        }
        delivered
    }

    fn unsubscribe(&self, id: u64) {
        self.registry.write().retain(|entry| entry.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Tears down all subscriptions. Their streams end once drained.
    pub fn close(&self) {
        let mut registry = self.registry.write();
        self.closed.store(true, Ordering::Release);
        registry.clear();
    }
}

/// Receiving end of [`Dispatcher::subscribe`].
pub struct Subscription {
    rx: mpsc::Receiver<ReceivedMessage>,
}

impl Subscription {
    /// Next message, or None once the comm instance stopped and the buffer is drained.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.try_recv().ok()
    }

    /// Messages buffered and not yet consumed.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Stream for Subscription {
    type Item = ReceivedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
