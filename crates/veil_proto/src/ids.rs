//! Identifier newtypes. Both reject malformed input during deserialisation,
//! so a `UserId` or `MessageId` that exists is always well-formed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

pub const USER_ID_LEN: usize = 6;
pub const MAX_MESSAGE_ID_LEN: usize = 128;

/// Six ASCII digits, assigned at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        if s.len() != USER_ID_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtoError::invalid("user_id", format!("expected {USER_ID_LEN} digits, got {s:?}")));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ProtoError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique, sender-chosen message / asset id. Stable across
/// redelivery so recipients can de-duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        if s.is_empty() || s.len() > MAX_MESSAGE_ID_LEN {
            return Err(ProtoError::invalid("message_id", format!("length must be 1..={MAX_MESSAGE_ID_LEN}")));
        }
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ProtoError::invalid("message_id", "must be printable ASCII without spaces"));
        }
        Ok(Self(s.to_string()))
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = ProtoError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
