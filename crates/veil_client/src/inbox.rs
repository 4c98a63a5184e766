//! Recipient-side de-duplication of envelope ids.
//!
//! The same envelope can reach us twice, e.g. live and again in a mailbox
//! flush racing with reconnect. Ids are remembered per peer, bounded so a
//! long conversation does not grow without limit.

use std::collections::{HashMap, HashSet, VecDeque};

use veil_proto::{MessageId, UserId};

pub const DEFAULT_WINDOW: usize = 1024;

#[derive(Debug, Default)]
struct Seen {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

#[derive(Debug)]
pub struct ProcessedMessages {
    window: usize,
    peers: HashMap<UserId, Seen>,
}

impl Default for ProcessedMessages {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ProcessedMessages {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            peers: HashMap::new(),
        }
    }

    /// Record `id` from `peer`. Returns false if it was already processed.
    pub fn check_and_store(&mut self, peer: &UserId, id: &MessageId) -> bool {
        let seen = self.peers.entry(peer.clone()).or_default();
        if seen.ids.contains(id) {
            return false;
        }
        seen.ids.insert(id.clone());
        seen.order.push_back(id.clone());
        while seen.order.len() > self.window {
            if let Some(old) = seen.order.pop_front() {
                seen.ids.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, peer: &UserId, id: &MessageId) -> bool {
        self.peers.get(peer).is_some_and(|s| s.ids.contains(id))
    }

    pub fn forget(&mut self, peer: &UserId) {
        self.peers.remove(peer);
    }
}
