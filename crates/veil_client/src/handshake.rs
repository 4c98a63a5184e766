//! Per-peer key-exchange state machine.
//!
//! ```text
//!   initiator                                responder
//!   NONE ──initiate──▶ KEY_SENT   public-key ─▶ NONE/any
//!                                               │ generate Kb, install
//!                                               ▼
//!                                            SECRET_SET ──wrap──▶ COMPLETE
//!   KEY_SENT ◀──────────────── aes-key(wrap(Kb)) ──┘
//!      │ unwrap, install Kb
//!      ▼
//!   COMPLETE ──exchange-complete (advisory)──▶
//! ```
//!
//! The responder's key is canonical. When both sides initiate at once the
//! side with the smaller user id keeps its `KEY_SENT` and ignores the
//! peer's `public-key`; the other side answers it.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use veil_crypto::{CryptoError, CryptoSession, IdentityKeyPair, SessionKey};
use veil_proto::{Base64Bytes, KeyExchangePayload, UserId};

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    None,
    KeySent,
    SecretSet,
    Complete,
}

/// What a transition produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    pub state: HandshakeState,
    /// Frame to send back to the peer, if any.
    pub reply: Option<KeyExchangePayload>,
    /// True when this transition is the one that reached `Complete`.
    pub completed: bool,
}

impl HandshakeStep {
    fn idle(state: HandshakeState) -> Self {
        Self {
            state,
            reply: None,
            completed: false,
        }
    }
}

pub struct KeyExchangeCoordinator {
    session: CryptoSession,
    states: HashMap<UserId, HandshakeState>,
    /// Locally generated key while in `KeySent`; discarded once the
    /// responder's key arrives.
    pending: HashMap<UserId, SessionKey>,
}

impl KeyExchangeCoordinator {
    /// Generate a fresh identity. Failure here means the platform RNG is
    /// unavailable and the client cannot proceed.
    pub fn new(local_id: &UserId) -> Result<Self, ClientError> {
        Ok(Self::with_identity(local_id, IdentityKeyPair::generate()?))
    }

    pub fn with_identity(local_id: &UserId, identity: IdentityKeyPair) -> Self {
        Self {
            session: CryptoSession::with_identity(local_id.as_str(), identity),
            states: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn session(&self) -> &CryptoSession {
        &self.session
    }

    pub fn state(&self, peer: &UserId) -> HandshakeState {
        self.states.get(peer).copied().unwrap_or_default()
    }

    pub fn is_handshake_complete(&self, peer: &UserId) -> bool {
        self.state(peer) == HandshakeState::Complete && self.session.has_session_key(peer.as_str())
    }

    /// Peers we have ever started or answered a handshake with.
    pub fn known_peers(&self) -> impl Iterator<Item = &UserId> {
        self.states.keys()
    }

    /// Step 1: start (or restart) a handshake with `peer`.
    pub fn initiate(&mut self, peer: &UserId) -> Result<KeyExchangePayload, ClientError> {
        self.session.clear_session_key(peer.as_str());
        let local_key = match CryptoSession::generate_session_key() {
            Ok(key) => key,
            Err(err) => return Err(self.fail(peer, err)),
        };
        self.pending.insert(peer.clone(), local_key);
        self.states.insert(peer.clone(), HandshakeState::KeySent);
        info!(peer = %peer, "key exchange initiated");
        Ok(KeyExchangePayload::PublicKey {
            public_key: Base64Bytes::from(self.session.export_public_key().to_vec()),
        })
    }

    /// Single transition function for every inbound key-exchange frame.
    pub fn handle(
        &mut self,
        from: &UserId,
        payload: KeyExchangePayload,
    ) -> Result<HandshakeStep, ClientError> {
        let state = self.state(from);
        debug!(peer = %from, frame = payload.label(), ?state, "key exchange frame");
        match payload {
            KeyExchangePayload::PublicKey { public_key } => {
                if state == HandshakeState::KeySent && self.session.local_id() < from.as_str() {
                    debug!(peer = %from, "simultaneous initiation, keeping initiator role");
                    return Ok(HandshakeStep::idle(state));
                }
                self.respond(from, public_key.as_slice())
            }
            KeyExchangePayload::AesKey { wrapped_key } => {
                if state != HandshakeState::KeySent {
                    warn!(peer = %from, ?state, "aes-key without outstanding public-key");
                    return Err(ClientError::UnexpectedKeyExchange {
                        peer: from.to_string(),
                        label: "aes-key",
                        state,
                    });
                }
                let key = match self.session.unwrap_session_key(wrapped_key.as_slice()) {
                    Ok(key) => key,
                    Err(err) => return Err(self.fail(from, err)),
                };
                self.session.set_session_key(from.as_str(), key);
                self.pending.remove(from);
                self.states.insert(from.clone(), HandshakeState::Complete);
                info!(peer = %from, "key exchange complete (initiator)");
                Ok(HandshakeStep {
                    state: HandshakeState::Complete,
                    reply: Some(KeyExchangePayload::ExchangeComplete),
                    completed: true,
                })
            }
            KeyExchangePayload::ExchangeComplete => Ok(HandshakeStep::idle(state)),
        }
    }

    /// Step 2: adopt our own fresh key and send it wrapped for `peer`.
    fn respond(&mut self, peer: &UserId, public_key: &[u8]) -> Result<HandshakeStep, ClientError> {
        self.pending.remove(peer);
        let peer_key = match CryptoSession::import_peer_public_key(public_key) {
            Ok(key) => key,
            Err(err) => return Err(self.fail(peer, err)),
        };
        let key = match CryptoSession::generate_session_key() {
            Ok(key) => key,
            Err(err) => return Err(self.fail(peer, err)),
        };
        self.session.set_session_key(peer.as_str(), key.clone());
        self.states.insert(peer.clone(), HandshakeState::SecretSet);

        let wrapped = match CryptoSession::wrap_session_key(&key, &peer_key) {
            Ok(wrapped) => wrapped,
            Err(err) => return Err(self.fail(peer, err)),
        };
        self.states.insert(peer.clone(), HandshakeState::Complete);
        info!(peer = %peer, fingerprint = %peer_key.fingerprint(), "key exchange complete (responder)");
        Ok(HandshakeStep {
            state: HandshakeState::Complete,
            reply: Some(KeyExchangePayload::AesKey {
                wrapped_key: Base64Bytes::from(wrapped),
            }),
            completed: true,
        })
    }

    /// The peer came (back) online: any key we hold is stale.
    pub fn on_peer_online(&mut self, peer: &UserId) -> Result<KeyExchangePayload, ClientError> {
        self.initiate(peer)
    }

    /// Drop an in-flight handshake. An established key is kept so that
    /// messages can still be buffered for the peer until it returns.
    pub fn on_peer_offline(&mut self, peer: &UserId) {
        if self.state(peer) != HandshakeState::Complete {
            self.reset(peer);
        }
    }

    /// We rejoined the relay. Peers re-key when they see our `user-online`,
    /// so no established key may seal new messages. Keys stay installed
    /// until replaced, so the mail flushed on join can still be read.
    pub fn on_reconnect(&mut self) -> usize {
        let mut demoted = 0;
        for state in self.states.values_mut() {
            if *state != HandshakeState::None {
                *state = HandshakeState::None;
                demoted += 1;
            }
        }
        self.pending.clear();
        demoted
    }

    pub fn reset(&mut self, peer: &UserId) {
        self.session.clear_session_key(peer.as_str());
        self.pending.remove(peer);
        self.states.insert(peer.clone(), HandshakeState::None);
    }

    fn fail(&mut self, peer: &UserId, err: CryptoError) -> ClientError {
        warn!(peer = %peer, error = %err, "key exchange failed, state reset");
        self.reset(peer);
        ClientError::Crypto(err)
    }
}

impl std::fmt::Debug for KeyExchangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchangeCoordinator")
            .field("local_id", &self.session.local_id())
            .field("states", &self.states)
            .finish()
    }
}
