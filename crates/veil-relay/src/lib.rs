//! veil-relay: Relay for end-to-end encrypted 1:1 chat
//!
//! The relay never sees plaintext or session keys. It routes opaque
//! envelopes between online users, buffers them for offline users, forwards
//! handshake frames, and holds encrypted image blobs until they are
//! fetched.
//!
//! - `auth`: token authenticator and user directory collaborators
//! - `config`: `RelayConfig`: defaults, JSON file, environment
//! - `connection`: per-socket state machine and request dispatch
//! - `relay`: routing core over presence, mailboxes and assets
//! - `reaper`: periodic expiry sweeps
//! - `server`: WebSocket listener

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod reaper;
pub mod relay;
pub mod server;

pub use auth::{Authenticator, HmacTokenAuthenticator, StaticDirectory, UserDirectory};
pub use config::RelayConfig;
pub use connection::{Connection, ConnectionState};
pub use error::RelayError;
pub use relay::{OutboundMessage, Relay};
pub use server::{ChannelSink, RelayServer};

use std::sync::Arc;

/// Assemble a relay and its server from configuration.
pub fn build(config: &RelayConfig) -> anyhow::Result<Arc<RelayServer>> {
    let directory = StaticDirectory::from_entries(&config.users)?;
    let relay = Arc::new(Relay::new(
        config.mailbox_config()?,
        config.asset_config()?,
        Arc::new(directory),
    ));
    let auth = HmacTokenAuthenticator::new(config.auth_secret_bytes()?);
    Ok(Arc::new(RelayServer::new(relay, Arc::new(auth), config.max_frame_bytes)))
}
