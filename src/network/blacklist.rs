use dashmap::DashMap;
use std::time::Instant;

use crate::types::PkiId;

/// Local set of PKI-IDs this node refuses to send to or accept delivery from.
/// Entries never expire; the remote peer is not notified.
pub struct Blacklist {
    entries: DashMap<PkiId, Instant>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns true if the PKI-ID was not blacklisted before.
    pub fn add(&self, pki_id: PkiId) -> bool {
        let mut inserted = false;
        self.entries.entry(pki_id.clone()).or_insert_with(|| {
            inserted = true;
            Instant::now()
        });
        if inserted {
            tracing::warn!("🚫 Blacklisted peer {}", pki_id);
        }
        inserted
    }

    pub fn is_blacklisted(&self, pki_id: &PkiId) -> bool {
        self.entries.contains_key(pki_id)
    }

    /// When the PKI-ID was blacklisted, if it is.
    pub fn since(&self, pki_id: &PkiId) -> Option<Instant> {
        self.entries.get(pki_id).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}
