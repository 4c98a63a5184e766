//! Encrypted message envelope: what the relay sees.
//!
//! The relay is a BLIND PIPE: it only sees
//!   - id            (sender-chosen, used for recipient-side dedup)
//!   - from/to       (needed for routing)
//!   - kind          (text vs. image announcement)
//!   - created_at    (needed for mailbox expiry)
//!   - ciphertext/iv (opaque bytes)
//!
//! It never sees plaintext or session keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bytes::Base64Bytes;
use crate::ids::{MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    #[default]
    Text,
    /// Announces an image uploaded in chunks.
    ImageChunk,
    /// Announces an image uploaded in a single shot.
    ImageWhole,
}

/// Display data the sender attaches for the recipient's UI. Not
/// authenticated by the relay beyond `user_id` matching the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub id: MessageId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    /// AES-256-GCM ciphertext + tag.
    pub ciphertext: Base64Bytes,
    /// 12-byte GCM nonce.
    pub iv: Base64Bytes,
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_info: Option<SenderInfo>,
    /// Stamped by the relay on receipt.
    pub created_at: DateTime<Utc>,
}

/// Routing outcome reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Pushed to the recipient's live connection.
    Delivered,
    /// Recipient offline; held in their mailbox.
    Buffered,
}
