//! Text-frame codec. One JSON document per WebSocket text frame.

use serde::Serialize;

use crate::error::ProtoError;
use crate::event::{ClientEvent, ServerEvent};
use crate::validate::Validate;

/// Parse and validate an inbound client frame.
pub fn decode_client_event(frame: &str) -> Result<ClientEvent, ProtoError> {
    let event: ClientEvent = serde_json::from_str(frame)?;
    event.validate()?;
    Ok(event)
}

/// Parse an inbound server frame (client side).
pub fn decode_server_event(frame: &str) -> Result<ServerEvent, ProtoError> {
    Ok(serde_json::from_str(frame)?)
}

pub fn encode<T: Serialize>(event: &T) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(event)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ErrorCode;

    #[test]
    fn decode_rejects_invalid_iv_after_parse() {
        let frame = r#"{"event":"image-upload","data":{"message_id":"a1","target_user_id":"200002","data":"AAAA","iv":"AAAA"}}"#;
        assert!(matches!(
            decode_client_event(frame),
            Err(ProtoError::InvalidField { field: "iv", .. })
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_client_event("{nope"), Err(ProtoError::Json(_))));
    }

    #[test]
    fn server_event_encodes_and_decodes() {
        let ev = ServerEvent::error(ErrorCode::NotFound, "Image not found");
        let text = encode(&ev).unwrap();
        assert_eq!(decode_server_event(&text).unwrap(), ev);
    }
}
