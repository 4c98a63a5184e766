use std::fmt;
use std::sync::Arc;

use veil_proto::ServerEvent;

/// Opaque per-connection identifier, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound half of a client connection.
///
/// `send` must not block; implementations queue the event for the
/// connection's writer. It returns `false` once the connection is gone.
pub trait EventSink: Send + Sync {
    fn connection_id(&self) -> ConnectionId;
    fn send(&self, event: ServerEvent) -> bool;
}

pub type SharedSink = Arc<dyn EventSink>;
