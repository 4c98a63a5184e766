//! veil_client: Client side of the Veil protocol
//!
//! - `handshake`: per-peer key-exchange state machine
//! - `inbox`: processed-id book for recipient-side de-duplication
//! - `client`: `ChatClient`, turning server events into decrypted results
//!   and reply frames

pub mod client;
pub mod error;
pub mod handshake;
pub mod inbox;

pub use client::{ChatClient, Handled, Incoming, DEFAULT_CHUNK_SIZE};
pub use error::ClientError;
pub use handshake::{HandshakeState, HandshakeStep, KeyExchangeCoordinator};
pub use inbox::ProcessedMessages;
