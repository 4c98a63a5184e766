//! Client ↔ relay events.
//!
//! Every event name maps to exactly one enum variant with typed fields;
//! the relay never inspects an untyped payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bytes::Base64Bytes;
use crate::envelope::{DeliveryStatus, EncryptedEnvelope, EnvelopeKind, SenderInfo};
use crate::ids::{MessageId, UserId};

fn default_protocol_version() -> u32 {
    crate::PROTOCOL_VERSION
}

// ── Key exchange ──────────────────────────────────────────────────────────────

/// The three handshake frames. Consumed by a single transition function on
/// the client; forwarded untouched by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KeyExchangePayload {
    /// Step 1: initiator's identity public key.
    PublicKey { public_key: Base64Bytes },
    /// Step 2: responder's session key, wrapped for the initiator.
    AesKey { wrapped_key: Base64Bytes },
    /// Step 3 (advisory): initiator adopted the key.
    ExchangeComplete,
}

impl KeyExchangePayload {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PublicKey { .. } => "public-key",
            Self::AesKey { .. } => "aes-key",
            Self::ExchangeComplete => "exchange-complete",
        }
    }
}

// ── Assets ────────────────────────────────────────────────────────────────────

/// Plain file metadata supplied by the uploader. The relay stores it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
}

/// A stored asset as returned by `image-fetch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub target_user_id: UserId,
    pub data: Base64Bytes,
    pub iv: Base64Bytes,
    pub file_meta: FileMeta,
    pub stored_at: DateTime<Utc>,
}

// ── Client → relay ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Must be the first frame on a connection.
    Authenticate {
        token: String,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
    },
    Join {
        user_id: UserId,
        display_name: String,
    },
    KeyExchange {
        target_user_id: UserId,
        payload: KeyExchangePayload,
    },
    EncryptedMessage {
        target_user_id: UserId,
        message_id: MessageId,
        ciphertext: Base64Bytes,
        iv: Base64Bytes,
        #[serde(default)]
        kind: EnvelopeKind,
        #[serde(default)]
        sender_info: Option<SenderInfo>,
    },
    Typing {
        target_user_id: UserId,
        is_typing: bool,
    },
    RequestPending {
        #[serde(default)]
        from_user_id: Option<UserId>,
    },
    ContactAdded {
        target_user_id: UserId,
    },
    LookupUser {
        user_id: UserId,
    },
    ImageMetadata {
        message_id: MessageId,
        target_user_id: UserId,
        total_chunks: u32,
        iv: Base64Bytes,
        #[serde(default)]
        file_meta: FileMeta,
    },
    ImageChunk {
        message_id: MessageId,
        index: u32,
        data: Base64Bytes,
        #[serde(default)]
        is_last: bool,
    },
    ImageUpload {
        message_id: MessageId,
        target_user_id: UserId,
        data: Base64Bytes,
        iv: Base64Bytes,
        #[serde(default)]
        file_meta: FileMeta,
    },
    ImageFetch {
        message_id: MessageId,
    },
}

impl ClientEvent {
    /// Event name as it appears on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Join { .. } => "join",
            Self::KeyExchange { .. } => "key-exchange",
            Self::EncryptedMessage { .. } => "encrypted-message",
            Self::Typing { .. } => "typing",
            Self::RequestPending { .. } => "request-pending",
            Self::ContactAdded { .. } => "contact-added",
            Self::LookupUser { .. } => "lookup-user",
            Self::ImageMetadata { .. } => "image-metadata",
            Self::ImageChunk { .. } => "image-chunk",
            Self::ImageUpload { .. } => "image-upload",
            Self::ImageFetch { .. } => "image-fetch",
        }
    }
}

// ── Relay → client ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    ProtocolMismatch,
    NotJoined,
    IdentityMismatch,
    InvalidPayload,
    Conflict,
    IndexOutOfRange,
    MissingChunk,
    NotFound,
    TooLarge,
    Forbidden,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Authenticated {
        user_id: UserId,
    },
    Joined {
        user_id: UserId,
        online_users: Vec<UserId>,
    },
    UserOnline {
        user_id: UserId,
        display_name: String,
    },
    UserOffline {
        user_id: UserId,
        display_name: String,
    },
    KeyExchange {
        from_user_id: UserId,
        payload: KeyExchangePayload,
    },
    ReceiveMessage {
        envelope: EncryptedEnvelope,
    },
    PendingMessages {
        from_user_id: UserId,
        messages: Vec<EncryptedEnvelope>,
    },
    MessageStatus {
        message_id: MessageId,
        status: DeliveryStatus,
    },
    UserTyping {
        user_id: UserId,
        is_typing: bool,
    },
    ContactAdded {
        added_by: UserId,
    },
    UserInfo {
        user_id: UserId,
        display_name: String,
        is_online: bool,
    },
    UploadProgress {
        message_id: MessageId,
        received: u32,
        total: u32,
    },
    AssetStored {
        message_id: MessageId,
    },
    AssetReady {
        message_id: MessageId,
        from_user_id: UserId,
    },
    Asset(AssetPayload),
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_exchange_wire_shape() {
        let raw = json!({
            "event": "key-exchange",
            "data": {
                "target_user_id": "200002",
                "payload": { "type": "public-key", "public_key": "AAAA" }
            }
        });
        let ev: ClientEvent = serde_json::from_value(raw).unwrap();
        match ev {
            ClientEvent::KeyExchange { target_user_id, payload } => {
                assert_eq!(target_user_id.as_str(), "200002");
                assert_eq!(payload.label(), "public-key");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_key_exchange_type_rejected() {
        let raw = json!({
            "event": "key-exchange",
            "data": {
                "target_user_id": "200002",
                "payload": { "type": "rsa-key", "public_key": "AAAA" }
            }
        });
        assert!(serde_json::from_value::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn missing_required_field_rejected() {
        let raw = json!({
            "event": "encrypted-message",
            "data": { "target_user_id": "200002", "ciphertext": "AAAA", "iv": "AAAA" }
        });
        assert!(serde_json::from_value::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn exchange_complete_is_unit_variant() {
        let p = KeyExchangePayload::ExchangeComplete;
        assert_eq!(serde_json::to_value(&p).unwrap(), json!({"type": "exchange-complete"}));
    }

    #[test]
    fn server_event_tags() {
        let ev = ServerEvent::error(ErrorCode::MissingChunk, "Missing chunk 1");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "error");
        assert_eq!(v["data"]["code"], "missing_chunk");
    }
}
