use thiserror::Error;
use veil_proto::{ErrorCode, ProtoError, ServerEvent};
use veil_store::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not authenticated")]
    Unauthenticated,

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    ProtocolMismatch { expected: u32, got: u32 },

    #[error("join required before {0}")]
    NotJoined(&'static str),

    #[error("join as {claimed} on a connection authenticated as {authenticated}")]
    IdentityMismatch { claimed: String, authenticated: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated | Self::Auth(_) => ErrorCode::Unauthenticated,
            Self::AlreadyAuthenticated | Self::Proto(_) => ErrorCode::InvalidPayload,
            Self::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            Self::NotJoined(_) => ErrorCode::NotJoined,
            Self::IdentityMismatch { .. } => ErrorCode::IdentityMismatch,
            Self::UnknownUser(_) => ErrorCode::NotFound,
            Self::Store(err) => match err {
                StoreError::Conflict(_) => ErrorCode::Conflict,
                StoreError::IndexOutOfRange { .. } => ErrorCode::IndexOutOfRange,
                StoreError::MissingChunk(_) => ErrorCode::MissingChunk,
                StoreError::NotFound(_) => ErrorCode::NotFound,
                StoreError::TooLarge { .. } => ErrorCode::TooLarge,
                StoreError::Forbidden(_) => ErrorCode::Forbidden,
            },
        }
    }

    /// The frame reported back to the client.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.code(), self.to_string())
    }
}
