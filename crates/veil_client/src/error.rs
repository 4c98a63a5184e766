use thiserror::Error;
use veil_crypto::CryptoError;
use veil_proto::{ErrorCode, ProtoError};

use crate::handshake::HandshakeState;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Keygen/wrap/unwrap/AEAD failure. The affected handshake has been
    /// reset to `None`; starting it again may succeed.
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("no session key for {0}")]
    NoSessionKey(String),

    #[error("unexpected {label} from {peer} in state {state:?}")]
    UnexpectedKeyExchange {
        peer: String,
        label: &'static str,
        state: HandshakeState,
    },

    #[error("protocol: {0}")]
    Proto(#[from] ProtoError),

    #[error("relay rejected request ({code:?}): {message}")]
    Relay { code: ErrorCode, message: String },
}

impl ClientError {
    /// Whether re-running the handshake is a sensible reaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Crypto(_) | Self::NoSessionKey(_) | Self::UnexpectedKeyExchange { .. }
        )
    }
}
