//! `ChatClient`: the client half of the protocol without any transport.
//!
//! Callers feed every `ServerEvent` into [`ChatClient::handle`] and send
//! whatever `outgoing` frames come back; `incoming` carries decrypted
//! results for the UI. Composition methods refuse to encrypt for a peer
//! until its handshake is complete.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use veil_crypto::{CryptoError, Iv};
use veil_proto::validate::MAX_TOTAL_CHUNKS;
use veil_proto::{
    AssetPayload, Base64Bytes, ClientEvent, DeliveryStatus, EncryptedEnvelope, EnvelopeKind,
    ErrorCode, FileMeta, MessageId, ProtoError, SenderInfo, ServerEvent, UserId,
    PROTOCOL_VERSION,
};

use crate::error::ClientError;
use crate::handshake::{HandshakeState, KeyExchangeCoordinator};
use crate::inbox::ProcessedMessages;

/// Encrypted images above this size are sent as `image-metadata` followed
/// by chunks; smaller ones go through a single `image-upload`.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Decrypted or otherwise interpreted results of a server event.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Authenticated {
        user_id: UserId,
    },
    Joined {
        online_users: Vec<UserId>,
    },
    PeerOnline {
        user_id: UserId,
        display_name: String,
    },
    PeerOffline {
        user_id: UserId,
        display_name: String,
    },
    SecureChannelReady {
        peer: UserId,
    },
    Message {
        id: MessageId,
        from: UserId,
        text: String,
        sent_at: DateTime<Utc>,
        buffered: bool,
    },
    /// An image was sent; fetch it with [`ChatClient::fetch_asset`].
    ImageAnnounced {
        id: MessageId,
        from: UserId,
        asset_id: MessageId,
        buffered: bool,
    },
    /// An envelope that could not be opened, usually because the key it was
    /// sealed under did not survive a reconnect.
    Undecryptable {
        id: MessageId,
        from: UserId,
        reason: String,
    },
    Typing {
        from: UserId,
        is_typing: bool,
    },
    ContactAdded {
        by: UserId,
    },
    UserInfo {
        user_id: UserId,
        display_name: String,
        is_online: bool,
    },
    Status {
        message_id: MessageId,
        status: DeliveryStatus,
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
        from: UserId,
    },
    Asset {
        message_id: MessageId,
        from: UserId,
        data: Vec<u8>,
        file_meta: FileMeta,
    },
    RelayError {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Default)]
pub struct Handled {
    pub incoming: Vec<Incoming>,
    pub outgoing: Vec<ClientEvent>,
}

impl Handled {
    fn one(incoming: Incoming) -> Self {
        Self {
            incoming: vec![incoming],
            outgoing: Vec::new(),
        }
    }
}

pub struct ChatClient {
    user_id: UserId,
    display_name: String,
    handshakes: KeyExchangeCoordinator,
    processed: ProcessedMessages,
    online: BTreeSet<UserId>,
    chunk_size: usize,
}

impl ChatClient {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Result<Self, ClientError> {
        let handshakes = KeyExchangeCoordinator::new(&user_id)?;
        Ok(Self {
            user_id,
            display_name: display_name.into(),
            handshakes,
            processed: ProcessedMessages::default(),
            online: BTreeSet::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.set_chunk_size(chunk_size);
        self
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn fingerprint(&self) -> String {
        self.handshakes.session().identity().fingerprint()
    }

    pub fn is_online(&self, peer: &UserId) -> bool {
        self.online.contains(peer)
    }

    pub fn online_peers(&self) -> impl Iterator<Item = &UserId> {
        self.online.iter()
    }

    pub fn is_handshake_complete(&self, peer: &UserId) -> bool {
        self.handshakes.is_handshake_complete(peer)
    }

    pub fn handshake_state(&self, peer: &UserId) -> HandshakeState {
        self.handshakes.state(peer)
    }

    // ── Outgoing frames ──────────────────────────────────────────────────────

    pub fn authenticate(&self, token: impl Into<String>) -> ClientEvent {
        ClientEvent::Authenticate {
            token: token.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn join(&self) -> ClientEvent {
        ClientEvent::Join {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }
    }

    /// Open a conversation with `peer` by starting the handshake.
    pub fn start_chat(&mut self, peer: &UserId) -> Result<ClientEvent, ClientError> {
        let payload = self.handshakes.initiate(peer)?;
        Ok(ClientEvent::KeyExchange {
            target_user_id: peer.clone(),
            payload,
        })
    }

    pub fn compose_text(&mut self, peer: &UserId, text: &str) -> Result<ClientEvent, ClientError> {
        self.require_session(peer)?;
        let (ciphertext, iv) = self
            .handshakes
            .session()
            .encrypt(text, peer.as_str())
            .map_err(crypto_error)?;
        let message_id = MessageId::generate();
        debug!(peer = %peer, message_id = %message_id, "text message sealed");
        Ok(ClientEvent::EncryptedMessage {
            target_user_id: peer.clone(),
            message_id,
            ciphertext: Base64Bytes::from(ciphertext),
            iv: Base64Bytes::from(iv.0.to_vec()),
            kind: EnvelopeKind::Text,
            sender_info: Some(self.sender_info()),
        })
    }

    /// Encrypt `image` for `peer` and produce the upload frames followed by
    /// an envelope announcing the asset.
    pub fn compose_image(
        &mut self,
        peer: &UserId,
        image: &[u8],
        mut file_meta: FileMeta,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        self.require_session(peer)?;
        let (blob, iv) = self
            .handshakes
            .session()
            .encrypt_bytes(image, peer.as_str())
            .map_err(crypto_error)?;
        file_meta.original_size = Some(image.len() as u64);
        file_meta.file_size = Some(blob.len() as u64);

        let asset_id = MessageId::generate();
        let iv = Base64Bytes::from(iv.0.to_vec());
        let mut frames = Vec::new();
        let kind = if blob.len() <= self.chunk_size {
            frames.push(ClientEvent::ImageUpload {
                message_id: asset_id.clone(),
                target_user_id: peer.clone(),
                data: Base64Bytes::from(blob),
                iv,
                file_meta,
            });
            EnvelopeKind::ImageWhole
        } else {
            let chunks: Vec<&[u8]> = blob.chunks(self.chunk_size).collect();
            let total = chunks.len() as u32;
            if total > MAX_TOTAL_CHUNKS {
                return Err(ProtoError::invalid(
                    "total_chunks",
                    format!("{total} chunks exceeds {MAX_TOTAL_CHUNKS}"),
                )
                .into());
            }
            frames.push(ClientEvent::ImageMetadata {
                message_id: asset_id.clone(),
                target_user_id: peer.clone(),
                total_chunks: total,
                iv,
                file_meta,
            });
            for (index, chunk) in chunks.into_iter().enumerate() {
                let index = index as u32;
                frames.push(ClientEvent::ImageChunk {
                    message_id: asset_id.clone(),
                    index,
                    data: Base64Bytes::from(chunk),
                    is_last: index + 1 == total,
                });
            }
            EnvelopeKind::ImageChunk
        };

        let (ciphertext, envelope_iv) = self
            .handshakes
            .session()
            .encrypt(asset_id.as_str(), peer.as_str())
            .map_err(crypto_error)?;
        frames.push(ClientEvent::EncryptedMessage {
            target_user_id: peer.clone(),
            message_id: asset_id,
            ciphertext: Base64Bytes::from(ciphertext),
            iv: Base64Bytes::from(envelope_iv.0.to_vec()),
            kind,
            sender_info: Some(self.sender_info()),
        });
        info!(peer = %peer, frames = frames.len(), bytes = image.len(), "image sealed");
        Ok(frames)
    }

    pub fn typing(&self, peer: &UserId, is_typing: bool) -> ClientEvent {
        ClientEvent::Typing {
            target_user_id: peer.clone(),
            is_typing,
        }
    }

    pub fn request_pending(&self, from: Option<&UserId>) -> ClientEvent {
        ClientEvent::RequestPending {
            from_user_id: from.cloned(),
        }
    }

    pub fn contact_added(&self, peer: &UserId) -> ClientEvent {
        ClientEvent::ContactAdded {
            target_user_id: peer.clone(),
        }
    }

    pub fn lookup_user(&self, user_id: &UserId) -> ClientEvent {
        ClientEvent::LookupUser {
            user_id: user_id.clone(),
        }
    }

    pub fn fetch_asset(&self, message_id: &MessageId) -> ClientEvent {
        ClientEvent::ImageFetch {
            message_id: message_id.clone(),
        }
    }

    // ── Incoming events ──────────────────────────────────────────────────────

    pub fn handle(&mut self, event: ServerEvent) -> Result<Handled, ClientError> {
        match event {
            ServerEvent::Authenticated { user_id } => Ok(Handled::one(Incoming::Authenticated { user_id })),
            ServerEvent::Joined { online_users, .. } => {
                let demoted = self.handshakes.on_reconnect();
                if demoted > 0 {
                    info!(peers = demoted, "rejoined, sending paused until peers re-key");
                }
                self.online = online_users.iter().cloned().collect();
                Ok(Handled::one(Incoming::Joined { online_users }))
            }
            ServerEvent::UserOnline { user_id, display_name } => {
                self.online.insert(user_id.clone());
                let mut handled = Handled::default();
                if self.handshakes.known_peers().any(|p| p == &user_id) {
                    let payload = self.handshakes.on_peer_online(&user_id)?;
                    handled.outgoing.push(ClientEvent::KeyExchange {
                        target_user_id: user_id.clone(),
                        payload,
                    });
                }
                handled.incoming.push(Incoming::PeerOnline { user_id, display_name });
                Ok(handled)
            }
            ServerEvent::UserOffline { user_id, display_name } => {
                self.online.remove(&user_id);
                self.handshakes.on_peer_offline(&user_id);
                Ok(Handled::one(Incoming::PeerOffline { user_id, display_name }))
            }
            ServerEvent::KeyExchange { from_user_id, payload } => {
                let step = self.handshakes.handle(&from_user_id, payload)?;
                let mut handled = Handled::default();
                if let Some(reply) = step.reply {
                    handled.outgoing.push(ClientEvent::KeyExchange {
                        target_user_id: from_user_id.clone(),
                        payload: reply,
                    });
                }
                if step.completed {
                    handled.incoming.push(Incoming::SecureChannelReady { peer: from_user_id });
                }
                Ok(handled)
            }
            ServerEvent::ReceiveMessage { envelope } => {
                let mut handled = Handled::default();
                let from = envelope.from_user_id.clone();
                self.open_or_report(envelope, false, &from, &mut handled);
                Ok(handled)
            }
            ServerEvent::PendingMessages { from_user_id, messages } => {
                let mut handled = Handled::default();
                for envelope in messages {
                    self.open_or_report(envelope, true, &from_user_id, &mut handled);
                }
                Ok(handled)
            }
            ServerEvent::MessageStatus { message_id, status } => {
                Ok(Handled::one(Incoming::Status { message_id, status }))
            }
            ServerEvent::UserTyping { user_id, is_typing } => Ok(Handled::one(Incoming::Typing {
                from: user_id,
                is_typing,
            })),
            ServerEvent::ContactAdded { added_by } => Ok(Handled::one(Incoming::ContactAdded { by: added_by })),
            ServerEvent::UserInfo {
                user_id,
                display_name,
                is_online,
            } => Ok(Handled::one(Incoming::UserInfo {
                user_id,
                display_name,
                is_online,
            })),
            ServerEvent::UploadProgress {
                message_id,
                received,
                total,
            } => Ok(Handled::one(Incoming::UploadProgress {
                message_id,
                received,
                total,
            })),
            ServerEvent::AssetStored { message_id } => Ok(Handled::one(Incoming::AssetStored { message_id })),
            ServerEvent::AssetReady {
                message_id,
                from_user_id,
            } => Ok(Handled::one(Incoming::AssetReady {
                message_id,
                from: from_user_id,
            })),
            ServerEvent::Asset(asset) => Ok(Handled::one(self.open_asset(asset)?)),
            ServerEvent::Error { code, message } => {
                warn!(?code, %message, "relay error");
                Ok(Handled::one(Incoming::RelayError { code, message }))
            }
        }
    }

    /// An envelope that does not open is reported, never surfaced as text.
    fn open_or_report(&mut self, envelope: EncryptedEnvelope, buffered: bool, from: &UserId, handled: &mut Handled) {
        let id = envelope.id.clone();
        match self.open(envelope, buffered) {
            Ok(Some(incoming)) => handled.incoming.push(incoming),
            Ok(None) => {}
            Err(err) => {
                warn!(from = %from, message_id = %id, buffered, error = %err, "message not opened");
                handled.incoming.push(Incoming::Undecryptable {
                    id,
                    from: from.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Decrypt an envelope. `Ok(None)` means it was a repeat and is dropped.
    fn open(&mut self, envelope: EncryptedEnvelope, buffered: bool) -> Result<Option<Incoming>, ClientError> {
        let from = envelope.from_user_id;
        if self.processed.contains(&from, &envelope.id) {
            debug!(from = %from, message_id = %envelope.id, "duplicate envelope dropped");
            return Ok(None);
        }
        let iv = Iv::from_slice(envelope.iv.as_slice()).map_err(crypto_error)?;
        let text = self
            .handshakes
            .session()
            .decrypt(envelope.ciphertext.as_slice(), &iv, from.as_str())
            .map_err(crypto_error)?;
        self.processed.check_and_store(&from, &envelope.id);

        let incoming = match envelope.kind {
            EnvelopeKind::Text => Incoming::Message {
                id: envelope.id,
                from,
                text,
                sent_at: envelope.created_at,
                buffered,
            },
            EnvelopeKind::ImageChunk | EnvelopeKind::ImageWhole => Incoming::ImageAnnounced {
                id: envelope.id,
                from,
                asset_id: MessageId::parse(&text)?,
                buffered,
            },
        };
        Ok(Some(incoming))
    }

    /// Assets are sealed for their target; only the recipient can open them.
    fn open_asset(&self, asset: AssetPayload) -> Result<Incoming, ClientError> {
        if asset.sender_id == self.user_id {
            return Err(ClientError::NoSessionKey(asset.target_user_id.to_string()));
        }
        let iv = Iv::from_slice(asset.iv.as_slice()).map_err(crypto_error)?;
        let data = self
            .handshakes
            .session()
            .decrypt_bytes(asset.data.as_slice(), &iv, asset.sender_id.as_str())
            .map_err(crypto_error)?;
        Ok(Incoming::Asset {
            message_id: asset.message_id,
            from: asset.sender_id,
            data: data.to_vec(),
            file_meta: asset.file_meta,
        })
    }

    fn require_session(&self, peer: &UserId) -> Result<(), ClientError> {
        if self.handshakes.is_handshake_complete(peer) {
            Ok(())
        } else {
            Err(ClientError::NoSessionKey(peer.to_string()))
        }
    }

    fn sender_info(&self) -> SenderInfo {
        SenderInfo {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

fn crypto_error(err: CryptoError) -> ClientError {
    match err {
        CryptoError::NoSessionKey(peer) => ClientError::NoSessionKey(peer),
        other => ClientError::Crypto(other),
    }
}
