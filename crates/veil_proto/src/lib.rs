//! veil_proto: Wire types for the Veil relay
//!
//! Everything crossing the client ↔ relay boundary is one of the closed
//! enums in `event`, serialised as JSON `{"event": ..., "data": ...}`.
//! Identifiers and binary fields validate themselves during
//! deserialisation; cross-field rules live in `validate`.
//!
//! # Modules
//! - `ids`: `UserId`, `MessageId`
//! - `bytes`: base64-on-the-wire byte buffers
//! - `envelope`: Encrypted message envelope (what the relay routes)
//! - `event`: Client and server events, key-exchange payloads
//! - `validate`: Boundary validation of inbound client events
//! - `codec`: Text-frame encode/decode

pub mod bytes;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod event;
pub mod ids;
pub mod validate;

pub use bytes::Base64Bytes;
pub use envelope::{DeliveryStatus, EncryptedEnvelope, EnvelopeKind, SenderInfo};
pub use error::ProtoError;
pub use event::{AssetPayload, ClientEvent, ErrorCode, FileMeta, KeyExchangePayload, ServerEvent};
pub use ids::{MessageId, UserId};
pub use validate::Validate;

pub const PROTOCOL_VERSION: u32 = 1;
