//! Responses waiting for their acknowledgement.

use std::collections::{HashMap, VecDeque};

use strata_types::{Hash, QueryType};

/// What the node remembers about a signed response until it is acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAck {
    pub log_offset: u64,
    pub query_type: QueryType,
}

/// Bounded set of outstanding responses, keyed by response header digest.
///
/// Insertion order is kept so that the oldest entry is evicted first once
/// `capacity` is reached.
#[derive(Debug)]
pub(crate) struct PendingAcks {
    order: VecDeque<Hash>,
    entries: HashMap<Hash, PendingAck>,
    capacity: usize,
}

impl PendingAcks {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remembers a response. Returns the digest evicted to make room, if any.
    pub fn insert(&mut self, hash: Hash, ack: PendingAck) -> Option<Hash> {
        if self.entries.insert(hash, ack).is_some() {
            return None;
        }
        self.order.push_back(hash);
        if self.entries.len() <= self.capacity {
            return None;
        }
        let evicted = self.order.pop_front()?;
        self.entries.remove(&evicted);
        Some(evicted)
    }

    /// Removes and returns the entry for `hash` if it was issued at
    /// `log_offset`.
    pub fn take(&mut self, hash: &Hash, log_offset: u64) -> Option<PendingAck> {
        let pending = self.entries.get(hash)?;
        if pending.log_offset != log_offset {
            return None;
        }
        let pending = self.entries.remove(hash)?;
        self.order.retain(|h| h != hash);
        Some(pending)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
