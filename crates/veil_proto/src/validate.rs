//! Cross-field validation of inbound client events.
//!
//! Shape (required fields, id formats, base64) is enforced by serde; this
//! layer adds the value constraints serde cannot express.

use crate::envelope::SenderInfo;
use crate::error::ProtoError;
use crate::event::{ClientEvent, FileMeta, KeyExchangePayload};

pub const IV_LEN: usize = 12;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const MAX_TOTAL_CHUNKS: u32 = 4096;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_TOKEN_LEN: usize = 512;
const MAX_FILE_NAME_LEN: usize = 255;

pub trait Validate {
    fn validate(&self) -> Result<(), ProtoError>;
}

fn check_iv(iv: &[u8]) -> Result<(), ProtoError> {
    if iv.len() != IV_LEN {
        return Err(ProtoError::invalid("iv", format!("must be {IV_LEN} bytes, got {}", iv.len())));
    }
    Ok(())
}

fn check_non_empty(field: &'static str, data: &[u8]) -> Result<(), ProtoError> {
    if data.is_empty() {
        return Err(ProtoError::MissingField(field));
    }
    Ok(())
}

fn check_display_name(name: &str) -> Result<(), ProtoError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ProtoError::MissingField("display_name"));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ProtoError::invalid("display_name", "too long"));
    }
    Ok(())
}

impl Validate for FileMeta {
    fn validate(&self) -> Result<(), ProtoError> {
        for (field, value) in [("file_name", &self.file_name), ("file_type", &self.file_type)] {
            if let Some(v) = value {
                if v.len() > MAX_FILE_NAME_LEN {
                    return Err(ProtoError::invalid(field, "too long"));
                }
            }
        }
        Ok(())
    }
}

impl Validate for SenderInfo {
    fn validate(&self) -> Result<(), ProtoError> {
        check_display_name(&self.display_name)
    }
}

impl Validate for KeyExchangePayload {
    fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Self::PublicKey { public_key } => {
                if public_key.len() != PUBLIC_KEY_LEN {
                    return Err(ProtoError::invalid("public_key", format!("must be {PUBLIC_KEY_LEN} bytes")));
                }
                Ok(())
            }
            Self::AesKey { wrapped_key } => check_non_empty("wrapped_key", wrapped_key.as_slice()),
            Self::ExchangeComplete => Ok(()),
        }
    }
}

impl Validate for ClientEvent {
    fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Self::Authenticate { token, .. } => {
                if token.is_empty() {
                    return Err(ProtoError::MissingField("token"));
                }
                if token.len() > MAX_TOKEN_LEN {
                    return Err(ProtoError::invalid("token", "too long"));
                }
                Ok(())
            }
            Self::Join { display_name, .. } => check_display_name(display_name),
            Self::KeyExchange { payload, .. } => payload.validate(),
            Self::EncryptedMessage {
                ciphertext,
                iv,
                sender_info,
                ..
            } => {
                check_non_empty("ciphertext", ciphertext.as_slice())?;
                check_iv(iv.as_slice())?;
                if let Some(info) = sender_info {
                    info.validate()?;
                }
                Ok(())
            }
            Self::ImageMetadata {
                total_chunks,
                iv,
                file_meta,
                ..
            } => {
                if *total_chunks == 0 || *total_chunks > MAX_TOTAL_CHUNKS {
                    return Err(ProtoError::invalid(
                        "total_chunks",
                        format!("must be in 1..={MAX_TOTAL_CHUNKS}"),
                    ));
                }
                check_iv(iv.as_slice())?;
                file_meta.validate()
            }
            Self::ImageChunk { data, .. } => check_non_empty("data", data.as_slice()),
            Self::ImageUpload {
                data, iv, file_meta, ..
            } => {
                check_non_empty("data", data.as_slice())?;
                check_iv(iv.as_slice())?;
                file_meta.validate()
            }
            Self::Typing { .. }
            | Self::RequestPending { .. }
            | Self::ContactAdded { .. }
            | Self::LookupUser { .. }
            | Self::ImageFetch { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::Base64Bytes;
    use crate::ids::{MessageId, UserId};

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn short_iv_rejected() {
        let ev = ClientEvent::EncryptedMessage {
            target_user_id: uid("200002"),
            message_id: MessageId::parse("m1").unwrap(),
            ciphertext: Base64Bytes(vec![1, 2, 3]),
            iv: Base64Bytes(vec![0; 8]),
            kind: Default::default(),
            sender_info: None,
        };
        assert!(matches!(ev.validate(), Err(ProtoError::InvalidField { field: "iv", .. })));
    }

    #[test]
    fn empty_ciphertext_rejected() {
        let ev = ClientEvent::EncryptedMessage {
            target_user_id: uid("200002"),
            message_id: MessageId::parse("m1").unwrap(),
            ciphertext: Base64Bytes(vec![]),
            iv: Base64Bytes(vec![0; 12]),
            kind: Default::default(),
            sender_info: None,
        };
        assert!(matches!(ev.validate(), Err(ProtoError::MissingField("ciphertext"))));
    }

    #[test]
    fn total_chunks_bounds() {
        let mk = |n| ClientEvent::ImageMetadata {
            message_id: MessageId::parse("img").unwrap(),
            target_user_id: uid("200002"),
            total_chunks: n,
            iv: Base64Bytes(vec![0; 12]),
            file_meta: FileMeta::default(),
        };
        assert!(mk(0).validate().is_err());
        assert!(mk(1).validate().is_ok());
        assert!(mk(MAX_TOTAL_CHUNKS + 1).validate().is_err());
    }

    #[test]
    fn blank_display_name_rejected() {
        let ev = ClientEvent::Join {
            user_id: uid("100001"),
            display_name: "   ".into(),
        };
        assert!(ev.validate().is_err());
    }

    #[test]
    fn public_key_length_checked() {
        let p = KeyExchangePayload::PublicKey {
            public_key: Base64Bytes(vec![0; 16]),
        };
        assert!(p.validate().is_err());
    }
}
