//! Presence: which user is reachable through which live connection.
//!
//! One active connection per user. A second `join` for the same user
//! replaces the mapping; the replaced connection's later `leave` is then a
//! no-op, so a stale socket closing cannot mark a reconnected user offline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};
use veil_proto::{ServerEvent, UserId};

use crate::sink::{ConnectionId, SharedSink};

struct Presence {
    display_name: String,
    sink: SharedSink,
    joined_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    by_user: HashMap<UserId, Presence>,
    by_connection: HashMap<ConnectionId, UserId>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    tables: RwLock<Tables>,
}

/// Result of a `join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Connection that previously represented this user, if any.
    pub replaced: Option<ConnectionId>,
    /// Users that were online at the time of joining (excluding the joiner).
    pub online_users: Vec<UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `user_id` as reachable via `sink` and tell everyone else.
    pub fn join(&self, user_id: &UserId, display_name: &str, sink: SharedSink) -> JoinOutcome {
        let outcome = self.register(user_id, display_name, sink);
        self.announce_online(user_id);
        outcome
    }

    /// Record the mapping without broadcasting. Pair with `announce_online`
    /// once the joiner has been sent anything that must precede peer traffic.
    pub fn register(&self, user_id: &UserId, display_name: &str, sink: SharedSink) -> JoinOutcome {
        let conn = sink.connection_id();
        let (replaced, mut online_users) = {
            let mut t = self.tables.write();
            let previous = t.by_user.insert(
                user_id.clone(),
                Presence {
                    display_name: display_name.to_string(),
                    sink,
                    joined_at: Utc::now(),
                },
            );
            let replaced = previous.map(|p| p.sink.connection_id());
            if let Some(old) = replaced {
                t.by_connection.remove(&old);
            }
            t.by_connection.insert(conn, user_id.clone());
            let others: Vec<UserId> = t
                .by_user
                .keys()
                .filter(|id| id.as_str() != user_id.as_str())
                .cloned()
                .collect();
            (replaced, others)
        };

        if let Some(old) = replaced {
            debug!(user_id = %user_id, old_connection = %old, "replaced stale connection");
        }
        info!(user_id = %user_id, connection = %conn, online = online_users.len() + 1, "user online");

        online_users.sort();
        JoinOutcome {
            replaced,
            online_users,
        }
    }

    /// Broadcast `user-online` for `user_id` to every other connection.
    pub fn announce_online(&self, user_id: &UserId) {
        let (display_name, others) = {
            let t = self.tables.read();
            let Some(me) = t.by_user.get(user_id) else {
                return;
            };
            let others: Vec<SharedSink> = t
                .by_user
                .iter()
                .filter(|(id, _)| id.as_str() != user_id.as_str())
                .map(|(_, p)| p.sink.clone())
                .collect();
            (me.display_name.clone(), others)
        };

        let event = ServerEvent::UserOnline {
            user_id: user_id.clone(),
            display_name,
        };
        for sink in &others {
            sink.send(event.clone());
        }
    }

    /// Forget the connection. Returns the user it represented, if it was
    /// still that user's active connection.
    pub fn leave(&self, conn: ConnectionId) -> Option<UserId> {
        let (user_id, display_name, others) = {
            let mut t = self.tables.write();
            let user_id = t.by_connection.remove(&conn)?;
            let presence = t.by_user.remove(&user_id)?;
            let others: Vec<SharedSink> = t.by_user.values().map(|p| p.sink.clone()).collect();
            (user_id, presence.display_name, others)
        };

        info!(user_id = %user_id, connection = %conn, "user offline");
        let event = ServerEvent::UserOffline {
            user_id: user_id.clone(),
            display_name,
        };
        for sink in &others {
            sink.send(event.clone());
        }
        Some(user_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.tables.read().by_user.contains_key(user_id)
    }

    pub fn connection_for(&self, user_id: &UserId) -> Option<SharedSink> {
        self.tables.read().by_user.get(user_id).map(|p| p.sink.clone())
    }

    /// The user currently bound to `conn`, if any.
    pub fn user_for(&self, conn: ConnectionId) -> Option<UserId> {
        self.tables.read().by_connection.get(&conn).cloned()
    }

    pub fn display_name(&self, user_id: &UserId) -> Option<String> {
        self.tables
            .read()
            .by_user
            .get(user_id)
            .map(|p| p.display_name.clone())
    }

    pub fn joined_at(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        self.tables.read().by_user.get(user_id).map(|p| p.joined_at)
    }

    pub fn online_count(&self) -> usize {
        self.tables.read().by_user.len()
    }

    /// Push `event` to `user_id` if online. Returns whether the connection
    /// accepted it.
    pub fn deliver(&self, user_id: &UserId, event: ServerEvent) -> bool {
        match self.connection_for(user_id) {
            Some(sink) => sink.send(event),
            None => false,
        }
    }
}
