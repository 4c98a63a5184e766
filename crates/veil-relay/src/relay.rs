//! Routing core shared by every connection.
//!
//! All methods are synchronous: they only touch the in-memory stores and
//! queue events on connection sinks, so a slow client never blocks another
//! client's request.
//!
//! Deliver-or-buffer decisions for a recipient are taken under that
//! recipient's mailbox lock, and `join` registers and flushes under the
//! same lock. A message therefore either reaches the joiner's flush or
//! sees the joiner online; it is never left behind in the mailbox of a
//! connected user. Lock order is mailbox, then presence, then backlog.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use veil_proto::{
    AssetPayload, Base64Bytes, DeliveryStatus, EncryptedEnvelope, EnvelopeKind, FileMeta,
    KeyExchangePayload, MessageId, SenderInfo, ServerEvent, UserId,
};
use veil_store::{
    AssetConfig, AssetStore, ChunkOutcome, ConnectionId, LockedMailbox, MailboxConfig,
    MailboxStore, PresenceRegistry, SharedSink, StoredAsset, SweepStats,
};

use crate::auth::UserDirectory;
use crate::error::RelayError;

/// An `encrypted-message` as accepted from the sender.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub ciphertext: Base64Bytes,
    pub iv: Base64Bytes,
    pub kind: EnvelopeKind,
    pub sender_info: Option<SenderInfo>,
}

pub struct Relay {
    presence: PresenceRegistry,
    mailboxes: MailboxStore,
    assets: AssetStore,
    directory: Arc<dyn UserDirectory>,
    /// Online users whose connection refused a flush; retried by
    /// `flush_backlog` once their writer makes progress.
    backlog: Mutex<HashSet<UserId>>,
}

impl Relay {
    pub fn new(mailbox: MailboxConfig, assets: AssetConfig, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            mailboxes: MailboxStore::new(mailbox),
            assets: AssetStore::new(assets),
            directory,
            backlog: Mutex::new(HashSet::new()),
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn mailboxes(&self) -> &MailboxStore {
        &self.mailboxes
    }

    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    // ── Presence ─────────────────────────────────────────────────────────────

    /// Bind `user_id` to `sink`, flush its mailbox, then announce it.
    ///
    /// The joiner sees `joined` and its buffered mail before any peer can
    /// react to `user-online` (e.g. by restarting a handshake).
    pub fn join(&self, user_id: &UserId, display_name: &str, sink: SharedSink) {
        self.mailboxes.with_mailbox(user_id, |mailbox| {
            let outcome = self.presence.register(user_id, display_name, sink.clone());
            sink.send(ServerEvent::Joined {
                user_id: user_id.clone(),
                online_users: outcome.online_users,
            });
            self.backlog.lock().remove(user_id);
            self.flush_locked(mailbox, &sink);
        });
        self.presence.announce_online(user_id);
    }

    /// Push everything queued in `mailbox` to `sink`, one frame per sender.
    ///
    /// A refused frame and every batch after it go back to the front of the
    /// queue and the user is marked backlogged. Returns whether the queue
    /// was emptied.
    fn flush_locked(&self, mailbox: &mut LockedMailbox<'_>, sink: &SharedSink) -> bool {
        let user_id = mailbox.user_id().clone();
        let mut batches = mailbox.drain().into_iter();
        let mut flushed = 0usize;
        while let Some(batch) = batches.next() {
            let count = batch.messages.len();
            let frame = ServerEvent::PendingMessages {
                from_user_id: batch.from_user_id.clone(),
                messages: batch.messages.clone(),
            };
            if !sink.send(frame) {
                let refused: Vec<EncryptedEnvelope> = std::iter::once(batch)
                    .chain(batches)
                    .flat_map(|b| b.messages)
                    .collect();
                warn!(user_id = %user_id, kept = refused.len(), "connection refused pending mail, kept in mailbox");
                mailbox.restore(refused);
                self.backlog.lock().insert(user_id);
                return false;
            }
            flushed += count;
        }
        if flushed > 0 {
            info!(user_id = %user_id, messages = flushed, "mailbox flushed");
        }
        true
    }

    /// Retry a flush that an earlier congested connection refused.
    /// Returns `true` if a backlog was pending and is now delivered.
    pub fn flush_backlog(&self, user_id: &UserId) -> bool {
        if !self.backlog.lock().remove(user_id) {
            return false;
        }
        self.mailboxes.with_mailbox(user_id, |mailbox| match self.presence.connection_for(user_id) {
            Some(sink) => self.flush_locked(mailbox, &sink),
            None => false,
        })
    }

    pub fn has_backlog(&self, user_id: &UserId) -> bool {
        self.backlog.lock().contains(user_id)
    }

    pub fn leave(&self, conn: ConnectionId) -> Option<UserId> {
        self.presence.leave(conn)
    }

    // ── Messaging ────────────────────────────────────────────────────────────

    /// Deliver live if the recipient is connected, otherwise buffer.
    pub fn send(&self, from: &UserId, to: &UserId, message: OutboundMessage) -> DeliveryStatus {
        let envelope = EncryptedEnvelope {
            id: message.message_id,
            from_user_id: from.clone(),
            to_user_id: to.clone(),
            ciphertext: message.ciphertext,
            iv: message.iv,
            kind: message.kind,
            sender_info: message.sender_info,
            created_at: Utc::now(),
        };

        self.mailboxes.with_mailbox(to, |mailbox| {
            let Some(sink) = self.presence.connection_for(to) else {
                let outcome = mailbox.enqueue(envelope);
                debug!(from = %from, to = %to, queued = outcome.len, "recipient offline, buffered");
                return DeliveryStatus::Buffered;
            };

            if mailbox.is_empty() {
                let id = envelope.id.clone();
                if sink.send(ServerEvent::ReceiveMessage {
                    envelope: envelope.clone(),
                }) {
                    debug!(from = %from, to = %to, message_id = %id, "delivered live");
                    return DeliveryStatus::Delivered;
                }
            }

            // Mail is already queued ahead of this one, or the connection is
            // congested: keep FIFO order by going through the mailbox.
            mailbox.enqueue(envelope);
            if self.flush_locked(mailbox, &sink) {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Buffered
            }
        })
    }

    /// Forward a handshake frame. Never buffered: an offline peer will
    /// trigger a fresh handshake when it returns.
    pub fn key_exchange(&self, from: &UserId, to: &UserId, payload: KeyExchangePayload) -> bool {
        let label = payload.label();
        let delivered = self.presence.deliver(
            to,
            ServerEvent::KeyExchange {
                from_user_id: from.clone(),
                payload,
            },
        );
        debug!(from = %from, to = %to, frame = label, delivered, "key exchange forwarded");
        delivered
    }

    pub fn typing(&self, from: &UserId, to: &UserId, is_typing: bool) -> bool {
        self.presence.deliver(
            to,
            ServerEvent::UserTyping {
                user_id: from.clone(),
                is_typing,
            },
        )
    }

    pub fn contact_added(&self, from: &UserId, to: &UserId) -> bool {
        self.presence.deliver(
            to,
            ServerEvent::ContactAdded {
                added_by: from.clone(),
            },
        )
    }

    /// `drain` (or `drainFrom` when `from` is given) as `pending-messages`
    /// frames, one per sender.
    pub fn pending_for(&self, user_id: &UserId, from: Option<&UserId>) -> Vec<ServerEvent> {
        match from {
            Some(from) => {
                let messages = self.mailboxes.drain_from(user_id, from);
                if messages.is_empty() {
                    return vec![];
                }
                vec![ServerEvent::PendingMessages {
                    from_user_id: from.clone(),
                    messages,
                }]
            }
            None => self
                .mailboxes
                .drain(user_id)
                .into_iter()
                .map(|batch| ServerEvent::PendingMessages {
                    from_user_id: batch.from_user_id,
                    messages: batch.messages,
                })
                .collect(),
        }
    }

    pub fn lookup_user(&self, user_id: &UserId) -> Result<ServerEvent, RelayError> {
        let live = self.presence.display_name(user_id);
        let is_online = live.is_some();
        let display_name = live
            .or_else(|| self.directory.display_name(user_id))
            .ok_or_else(|| RelayError::UnknownUser(user_id.to_string()))?;
        Ok(ServerEvent::UserInfo {
            user_id: user_id.clone(),
            display_name,
            is_online,
        })
    }

    // ── Assets ───────────────────────────────────────────────────────────────

    pub fn begin_upload(
        &self,
        from: &UserId,
        message_id: &MessageId,
        to: &UserId,
        total_chunks: u32,
        iv: Base64Bytes,
        file_meta: FileMeta,
    ) -> Result<(), RelayError> {
        self.assets
            .begin_upload(from, message_id, to, total_chunks, iv.into_inner(), file_meta)?;
        Ok(())
    }

    /// Store one chunk; returns the frame for the uploader.
    pub fn put_chunk(
        &self,
        from: &UserId,
        message_id: &MessageId,
        index: u32,
        data: Base64Bytes,
        is_last: bool,
    ) -> Result<ServerEvent, RelayError> {
        match self
            .assets
            .put_chunk(from, message_id, index, data.into_inner(), is_last)?
        {
            ChunkOutcome::Progress { received, total } => Ok(ServerEvent::UploadProgress {
                message_id: message_id.clone(),
                received,
                total,
            }),
            ChunkOutcome::Completed(asset) => {
                self.notify_ready(&asset);
                Ok(ServerEvent::AssetStored {
                    message_id: message_id.clone(),
                })
            }
        }
    }

    pub fn store_whole(
        &self,
        from: &UserId,
        message_id: &MessageId,
        to: &UserId,
        data: Base64Bytes,
        iv: Base64Bytes,
        file_meta: FileMeta,
    ) -> Result<ServerEvent, RelayError> {
        let asset = self.assets.store_whole(
            from,
            message_id,
            to,
            data.into_inner(),
            iv.into_inner(),
            file_meta,
        )?;
        self.notify_ready(&asset);
        Ok(ServerEvent::AssetStored {
            message_id: message_id.clone(),
        })
    }

    /// Only the asset's sender or target may fetch it.
    pub fn fetch_asset(&self, user_id: &UserId, message_id: &MessageId) -> Result<ServerEvent, RelayError> {
        let asset = self.assets.get_asset(message_id)?;
        if !asset.may_access(user_id) {
            return Err(veil_store::StoreError::Forbidden(format!(
                "asset {message_id} is not addressed to {user_id}"
            ))
            .into());
        }
        Ok(ServerEvent::Asset(AssetPayload {
            message_id: asset.message_id.clone(),
            sender_id: asset.sender_id.clone(),
            target_user_id: asset.target_user_id.clone(),
            data: Base64Bytes::from(asset.data.as_slice()),
            iv: Base64Bytes::from(asset.iv.as_slice()),
            file_meta: asset.file_meta.clone(),
            stored_at: asset.stored_at,
        }))
    }

    fn notify_ready(&self, asset: &StoredAsset) {
        let delivered = self.presence.deliver(
            &asset.target_user_id,
            ServerEvent::AssetReady {
                message_id: asset.message_id.clone(),
                from_user_id: asset.sender_id.clone(),
            },
        );
        debug!(message_id = %asset.message_id, delivered, "asset-ready");
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    pub fn sweep_mailboxes(&self) -> SweepStats {
        self.mailboxes.sweep_expired()
    }

    pub fn sweep_assets(&self) -> (usize, usize) {
        self.assets.sweep_expired()
    }
}
