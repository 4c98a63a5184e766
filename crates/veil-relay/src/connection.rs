//! Per-socket protocol state: `Unauthenticated → Authenticated → Joined`.
//!
//! Frames are decoded and validated before they reach the relay; any
//! failure is answered with an `error` frame and the connection stays open.

use std::sync::Arc;

use tracing::{debug, info, warn};
use veil_proto::codec::decode_client_event;
use veil_proto::{ClientEvent, ServerEvent, UserId, PROTOCOL_VERSION};
use veil_store::SharedSink;

use crate::auth::Authenticator;
use crate::error::RelayError;
use crate::relay::{OutboundMessage, Relay};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated(UserId),
    Joined(UserId),
}

pub struct Connection {
    state: ConnectionState,
    sink: SharedSink,
    relay: Arc<Relay>,
    auth: Arc<dyn Authenticator>,
}

impl Connection {
    pub fn new(sink: SharedSink, relay: Arc<Relay>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            state: ConnectionState::Unauthenticated,
            sink,
            relay,
            auth,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Handle one text frame; returns the direct replies for this client.
    pub async fn handle_frame(&mut self, frame: &str) -> Vec<ServerEvent> {
        let event = match decode_client_event(frame) {
            Ok(event) => event,
            Err(err) => {
                debug!(connection = %self.sink.connection_id(), error = %err, "rejected frame");
                return vec![RelayError::from(err).to_event()];
            }
        };
        self.handle_event(event).await
    }

    pub async fn handle_event(&mut self, event: ClientEvent) -> Vec<ServerEvent> {
        let name = event.name();
        match self.dispatch(event).await {
            Ok(replies) => replies,
            Err(err) => {
                warn!(connection = %self.sink.connection_id(), event = name, error = %err, "request failed");
                vec![err.to_event()]
            }
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<Vec<ServerEvent>, RelayError> {
        let event = match event {
            ClientEvent::Authenticate {
                token,
                protocol_version,
            } => return self.authenticate(&token, protocol_version).await,
            ClientEvent::Join {
                user_id,
                display_name,
            } => return self.join(user_id, &display_name),
            other => other,
        };

        let me = match &self.state {
            ConnectionState::Joined(user_id) => user_id.clone(),
            ConnectionState::Authenticated(_) => return Err(RelayError::NotJoined(event.name())),
            ConnectionState::Unauthenticated => return Err(RelayError::Unauthenticated),
        };
        let relay = &self.relay;

        match event {
            ClientEvent::Authenticate { .. } | ClientEvent::Join { .. } => Ok(vec![]),
            ClientEvent::KeyExchange {
                target_user_id,
                payload,
            } => {
                relay.key_exchange(&me, &target_user_id, payload);
                Ok(vec![])
            }
            ClientEvent::EncryptedMessage {
                target_user_id,
                message_id,
                ciphertext,
                iv,
                kind,
                sender_info,
            } => {
                let status = relay.send(
                    &me,
                    &target_user_id,
                    OutboundMessage {
                        message_id: message_id.clone(),
                        ciphertext,
                        iv,
                        kind,
                        sender_info,
                    },
                );
                Ok(vec![ServerEvent::MessageStatus { message_id, status }])
            }
            ClientEvent::Typing {
                target_user_id,
                is_typing,
            } => {
                relay.typing(&me, &target_user_id, is_typing);
                Ok(vec![])
            }
            ClientEvent::RequestPending { from_user_id } => {
                Ok(relay.pending_for(&me, from_user_id.as_ref()))
            }
            ClientEvent::ContactAdded { target_user_id } => {
                relay.contact_added(&me, &target_user_id);
                Ok(vec![])
            }
            ClientEvent::LookupUser { user_id } => Ok(vec![relay.lookup_user(&user_id)?]),
            ClientEvent::ImageMetadata {
                message_id,
                target_user_id,
                total_chunks,
                iv,
                file_meta,
            } => {
                relay.begin_upload(&me, &message_id, &target_user_id, total_chunks, iv, file_meta)?;
                Ok(vec![ServerEvent::UploadProgress {
                    message_id,
                    received: 0,
                    total: total_chunks,
                }])
            }
            ClientEvent::ImageChunk {
                message_id,
                index,
                data,
                is_last,
            } => Ok(vec![relay.put_chunk(&me, &message_id, index, data, is_last)?]),
            ClientEvent::ImageUpload {
                message_id,
                target_user_id,
                data,
                iv,
                file_meta,
            } => Ok(vec![relay.store_whole(&me, &message_id, &target_user_id, data, iv, file_meta)?]),
            ClientEvent::ImageFetch { message_id } => Ok(vec![relay.fetch_asset(&me, &message_id)?]),
        }
    }

    async fn authenticate(&mut self, token: &str, protocol_version: u32) -> Result<Vec<ServerEvent>, RelayError> {
        if self.state != ConnectionState::Unauthenticated {
            return Err(RelayError::AlreadyAuthenticated);
        }
        if protocol_version != PROTOCOL_VERSION {
            return Err(RelayError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                got: protocol_version,
            });
        }
        let user_id = self.auth.authenticate(token).await?;
        info!(connection = %self.sink.connection_id(), user_id = %user_id, "authenticated");
        self.state = ConnectionState::Authenticated(user_id.clone());
        Ok(vec![ServerEvent::Authenticated { user_id }])
    }

    /// `joined` and any pending mail go out through the sink so they are
    /// queued ahead of peer traffic.
    fn join(&mut self, user_id: UserId, display_name: &str) -> Result<Vec<ServerEvent>, RelayError> {
        let authenticated = match &self.state {
            ConnectionState::Unauthenticated => return Err(RelayError::Unauthenticated),
            ConnectionState::Authenticated(id) | ConnectionState::Joined(id) => id.clone(),
        };
        if authenticated != user_id {
            return Err(RelayError::IdentityMismatch {
                claimed: user_id.to_string(),
                authenticated: authenticated.to_string(),
            });
        }
        self.relay.join(&user_id, display_name, self.sink.clone());
        self.state = ConnectionState::Joined(user_id);
        Ok(vec![])
    }

    /// Called after the writer sent a queued event: retries mail a
    /// congested queue refused earlier.
    pub fn flush_backlog(&self) -> bool {
        match &self.state {
            ConnectionState::Joined(user_id) => self.relay.flush_backlog(user_id),
            _ => false,
        }
    }

    /// Socket closed. Only takes the user offline if this was still its
    /// active connection.
    pub fn close(&mut self) {
        if let ConnectionState::Joined(user_id) = &self.state {
            if self.relay.leave(self.sink.connection_id()).is_none() {
                debug!(user_id = %user_id, "closed superseded connection");
            }
        }
        self.state = ConnectionState::Unauthenticated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{HmacTokenAuthenticator, StaticDirectory};
    use parking_lot::Mutex;
    use veil_proto::ErrorCode;
    use veil_store::{AssetConfig, ConnectionId, EventSink, MailboxConfig};

    #[derive(Default)]
    struct Recorder {
        id: ConnectionId,
        events: Mutex<Vec<ServerEvent>>,
    }

    impl EventSink for Recorder {
        fn connection_id(&self) -> ConnectionId {
            self.id
        }
        fn send(&self, event: ServerEvent) -> bool {
            self.events.lock().push(event);
            true
        }
    }

    fn setup() -> (Connection, Arc<Recorder>, Arc<HmacTokenAuthenticator>) {
        let auth = Arc::new(HmacTokenAuthenticator::new(vec![7; 32]));
        let relay = Arc::new(Relay::new(
            MailboxConfig::default(),
            AssetConfig::default(),
            Arc::new(StaticDirectory::new()),
        ));
        let sink = Arc::new(Recorder::default());
        (Connection::new(sink.clone(), relay, auth.clone()), sink, auth)
    }

    fn code(events: &[ServerEvent]) -> Option<ErrorCode> {
        match events {
            [ServerEvent::Error { code, .. }] => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn requests_before_authentication_are_refused() {
        let (mut conn, _, _) = setup();
        let replies = conn
            .handle_frame(r#"{"event":"typing","data":{"target_user_id":"200002","is_typing":true}}"#)
            .await;
        assert_eq!(code(&replies), Some(ErrorCode::Unauthenticated));
    }

    #[tokio::test]
    async fn join_must_match_authenticated_identity() {
        let (mut conn, sink, auth) = setup();
        let token = auth.issue(&UserId::parse("100001").unwrap()).unwrap();
        let replies = conn
            .handle_event(ClientEvent::Authenticate {
                token,
                protocol_version: PROTOCOL_VERSION,
            })
            .await;
        assert!(matches!(replies[..], [ServerEvent::Authenticated { .. }]));

        let replies = conn
            .handle_event(ClientEvent::Typing {
                target_user_id: UserId::parse("200002").unwrap(),
                is_typing: true,
            })
            .await;
        assert_eq!(code(&replies), Some(ErrorCode::NotJoined));

        let replies = conn
            .handle_event(ClientEvent::Join {
                user_id: UserId::parse("200002").unwrap(),
                display_name: "mallory".into(),
            })
            .await;
        assert_eq!(code(&replies), Some(ErrorCode::IdentityMismatch));

        let replies = conn
            .handle_event(ClientEvent::Join {
                user_id: UserId::parse("100001").unwrap(),
                display_name: "alice".into(),
            })
            .await;
        assert!(replies.is_empty());
        assert!(matches!(sink.events.lock()[..], [ServerEvent::Joined { .. }]));
        assert_eq!(conn.state(), &ConnectionState::Joined(UserId::parse("100001").unwrap()));
    }

    #[tokio::test]
    async fn protocol_mismatch_and_bad_token() {
        let (mut conn, _, _) = setup();
        let replies = conn
            .handle_event(ClientEvent::Authenticate {
                token: "x".into(),
                protocol_version: PROTOCOL_VERSION + 1,
            })
            .await;
        assert_eq!(code(&replies), Some(ErrorCode::ProtocolMismatch));

        let replies = conn
            .handle_event(ClientEvent::Authenticate {
                token: "100001.00".into(),
                protocol_version: PROTOCOL_VERSION,
            })
            .await;
        assert_eq!(code(&replies), Some(ErrorCode::Unauthenticated));
        assert_eq!(conn.state(), &ConnectionState::Unauthenticated);
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_usable() {
        let (mut conn, _, auth) = setup();
        assert_eq!(code(&conn.handle_frame("{not json").await), Some(ErrorCode::InvalidPayload));
        let token = auth.issue(&UserId::parse("100001").unwrap()).unwrap();
        let frame = format!(r#"{{"event":"authenticate","data":{{"token":"{token}"}}}}"#);
        assert!(matches!(conn.handle_frame(&frame).await[..], [ServerEvent::Authenticated { .. }]));
    }
}
