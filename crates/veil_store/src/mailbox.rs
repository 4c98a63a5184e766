//! Offline mailboxes.
//!
//! Per-recipient FIFO of envelopes that could not be delivered live.
//! - Capacity-bounded: pushing past `capacity` evicts the oldest entry.
//! - Age-bounded: entries with age >= `ttl` are never returned and are
//!   purged on every write and by the periodic sweep.
//! - Drained exactly once: `drain` takes and clears under the per-user lock,
//!   so a concurrent `enqueue` lands either in the drained batch or in the
//!   fresh queue, never both, never neither.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use veil_proto::{EncryptedEnvelope, MessageId, UserId};

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: Duration::seconds(DEFAULT_TTL_SECS),
        }
    }
}

struct Entry {
    envelope: EncryptedEnvelope,
    buffered_at: DateTime<Utc>,
}

type Mailbox = Arc<Mutex<VecDeque<Entry>>>;

fn is_expired(ttl: Duration, entry: &Entry, now: DateTime<Utc>) -> bool {
    now - entry.buffered_at >= ttl
}

/// Envelopes from one sender, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderBatch {
    pub from_user_id: UserId,
    pub messages: Vec<EncryptedEnvelope>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub evicted: Option<MessageId>,
    pub expired: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub mailboxes_removed: usize,
}

/// One recipient's queue, held under its per-user lock.
///
/// Obtained through [`MailboxStore::with_mailbox`]. Callers that must make
/// a presence decision and a queue mutation as one step (deliver-or-buffer,
/// join-then-flush) do both inside the closure.
pub struct LockedMailbox<'a> {
    user_id: &'a UserId,
    config: &'a MailboxConfig,
    queue: &'a mut VecDeque<Entry>,
    now: DateTime<Utc>,
}

impl<'a> LockedMailbox<'a> {
    fn new(
        user_id: &'a UserId,
        config: &'a MailboxConfig,
        queue: &'a mut VecDeque<Entry>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            config,
            queue,
            now,
        }
    }

    pub fn user_id(&self) -> &UserId {
        self.user_id
    }

    /// Buffered entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn evict_overflow(&mut self) -> Option<MessageId> {
        let mut evicted = None;
        while self.queue.len() > self.config.capacity {
            evicted = self.queue.pop_front().map(|e| e.envelope.id);
        }
        evicted
    }

    fn purge_expired(&mut self) -> usize {
        let (ttl, now) = (self.config.ttl, self.now);
        let before = self.queue.len();
        self.queue.retain(|e| !is_expired(ttl, e, now));
        before - self.queue.len()
    }

    pub fn enqueue(&mut self, envelope: EncryptedEnvelope) -> EnqueueOutcome {
        let id = envelope.id.clone();
        self.queue.push_back(Entry {
            envelope,
            buffered_at: self.now,
        });
        let evicted = self.evict_overflow();
        let expired = self.purge_expired();

        if let Some(ref old) = evicted {
            debug!(recipient = %self.user_id, evicted = %old, "mailbox full, evicted oldest");
        }
        debug!(recipient = %self.user_id, message_id = %id, len = self.queue.len(), "message buffered");

        EnqueueOutcome {
            evicted,
            expired,
            len: self.queue.len(),
        }
    }

    /// Take every live envelope, grouped by sender.
    ///
    /// Senders appear in the order of their first buffered message; within a
    /// sender, envelopes keep send order.
    pub fn drain(&mut self) -> Vec<SenderBatch> {
        let (ttl, now) = (self.config.ttl, self.now);
        let taken = std::mem::take(&mut *self.queue);

        let mut batches: Vec<SenderBatch> = Vec::new();
        let mut index: HashMap<UserId, usize> = HashMap::new();
        let mut dropped = 0usize;
        for entry in taken {
            if is_expired(ttl, &entry, now) {
                dropped += 1;
                continue;
            }
            let from = entry.envelope.from_user_id.clone();
            let slot = *index.entry(from.clone()).or_insert_with(|| {
                batches.push(SenderBatch {
                    from_user_id: from,
                    messages: Vec::new(),
                });
                batches.len() - 1
            });
            batches[slot].messages.push(entry.envelope);
        }

        let count: usize = batches.iter().map(|b| b.messages.len()).sum();
        if count > 0 || dropped > 0 {
            debug!(recipient = %self.user_id, delivered = count, expired = dropped, "mailbox drained");
        }
        batches
    }

    /// Take only the envelopes from `from_user_id`, leaving the rest queued.
    pub fn drain_from(&mut self, from_user_id: &UserId) -> Vec<EncryptedEnvelope> {
        let (ttl, now) = (self.config.ttl, self.now);
        let mut matched = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.queue.len());
        for entry in self.queue.drain(..) {
            if is_expired(ttl, &entry, now) {
                continue;
            }
            if &entry.envelope.from_user_id == from_user_id {
                matched.push(entry.envelope);
            } else {
                remaining.push_back(entry);
            }
        }
        *self.queue = remaining;
        matched
    }

    /// Put drained envelopes that could not be handed over back at the
    /// front, ahead of anything buffered since, keeping their order.
    ///
    /// Their age is measured from `created_at`, the time the relay accepted
    /// them. Capacity still holds: overflow evicts from the front.
    pub fn restore(&mut self, envelopes: Vec<EncryptedEnvelope>) -> EnqueueOutcome {
        let restored = envelopes.len();
        for envelope in envelopes.into_iter().rev() {
            let buffered_at = envelope.created_at;
            self.queue.push_front(Entry {
                envelope,
                buffered_at,
            });
        }
        let evicted = self.evict_overflow();
        let expired = self.purge_expired();
        debug!(recipient = %self.user_id, restored, len = self.queue.len(), "undelivered batch restored");
        EnqueueOutcome {
            evicted,
            expired,
            len: self.queue.len(),
        }
    }
}

pub struct MailboxStore {
    config: MailboxConfig,
    boxes: RwLock<HashMap<UserId, Mailbox>>,
}

impl MailboxStore {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            boxes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    fn get(&self, user_id: &UserId) -> Option<Mailbox> {
        self.boxes.read().get(user_id).cloned()
    }

    fn get_or_create(&self, user_id: &UserId) -> Mailbox {
        if let Some(mb) = self.get(user_id) {
            return mb;
        }
        self.boxes
            .write()
            .entry(user_id.clone())
            .or_default()
            .clone()
    }

    /// Run `f` with `user_id`'s mailbox locked. `f` must not touch another
    /// mailbox of this store.
    pub fn with_mailbox<R>(&self, user_id: &UserId, f: impl FnOnce(&mut LockedMailbox<'_>) -> R) -> R {
        self.with_mailbox_at(user_id, Utc::now(), f)
    }

    pub fn with_mailbox_at<R>(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut LockedMailbox<'_>) -> R,
    ) -> R {
        let cell = self.get_or_create(user_id);
        let mut queue = cell.lock();
        let mut locked = LockedMailbox::new(user_id, &self.config, &mut queue, now);
        f(&mut locked)
    }

    pub fn enqueue(&self, user_id: &UserId, envelope: EncryptedEnvelope) -> EnqueueOutcome {
        self.enqueue_at(user_id, envelope, Utc::now())
    }

    pub fn enqueue_at(
        &self,
        user_id: &UserId,
        envelope: EncryptedEnvelope,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        self.with_mailbox_at(user_id, now, |mailbox| mailbox.enqueue(envelope))
    }

    /// Take every live envelope for `user_id`, grouped by sender.
    pub fn drain(&self, user_id: &UserId) -> Vec<SenderBatch> {
        self.drain_at(user_id, Utc::now())
    }

    pub fn drain_at(&self, user_id: &UserId, now: DateTime<Utc>) -> Vec<SenderBatch> {
        let Some(cell) = self.get(user_id) else {
            return Vec::new();
        };
        let mut queue = cell.lock();
        let batches = LockedMailbox::new(user_id, &self.config, &mut queue, now).drain();
        batches
    }

    pub fn drain_from(&self, user_id: &UserId, from_user_id: &UserId) -> Vec<EncryptedEnvelope> {
        self.drain_from_at(user_id, from_user_id, Utc::now())
    }

    pub fn drain_from_at(
        &self,
        user_id: &UserId,
        from_user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Vec<EncryptedEnvelope> {
        let Some(cell) = self.get(user_id) else {
            return Vec::new();
        };
        let mut queue = cell.lock();
        let matched = LockedMailbox::new(user_id, &self.config, &mut queue, now).drain_from(from_user_id);
        matched
    }

    /// Number of buffered (possibly expired, not yet swept) entries.
    pub fn len(&self, user_id: &UserId) -> usize {
        self.get(user_id).map(|mb| mb.lock().len()).unwrap_or(0)
    }

    pub fn mailbox_count(&self) -> usize {
        self.boxes.read().len()
    }

    pub fn sweep_expired(&self) -> SweepStats {
        self.sweep_expired_at(Utc::now())
    }

    /// Purge expired entries everywhere and drop empty, unreferenced mailboxes.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();
        let ttl = self.config.ttl;

        let cells: Vec<Mailbox> = self.boxes.read().values().cloned().collect();
        for cell in cells {
            let mut queue = cell.lock();
            let before = queue.len();
            queue.retain(|e| !is_expired(ttl, e, now));
            stats.expired += before - queue.len();
        }

        {
            let mut boxes = self.boxes.write();
            let before = boxes.len();
            boxes.retain(|_, cell| Arc::strong_count(cell) > 1 || !cell.lock().is_empty());
            stats.mailboxes_removed = before - boxes.len();
        }

        if stats.expired > 0 || stats.mailboxes_removed > 0 {
            info!(
                expired = stats.expired,
                mailboxes_removed = stats.mailboxes_removed,
                "mailbox sweep"
            );
        }
        stats
    }
}

impl Default for MailboxStore {
    fn default() -> Self {
        Self::new(MailboxConfig::default())
    }
}
