//! veil_store: In-memory relay state for Veil
//!
//! Nothing here is persisted; a relay restart starts with everyone offline
//! and every mailbox empty.
//!
//! # Locking strategy
//! Each table is an outer `RwLock<HashMap<key, Arc<Mutex<value>>>>`. The outer
//! lock is held only long enough to find or insert a per-key cell; all
//! mutation happens under the per-key mutex. No code path takes an outer
//! lock while holding a per-key lock, so sweeps and request handlers cannot
//! deadlock. Cells are only removed from the outer map when nobody else
//! holds a reference to them (`Arc::strong_count == 1` under the outer write
//! lock), so an in-flight writer can never push into an orphaned cell.
//!
//! # Modules
//! - `sink`: `EventSink`: the connection seam used to push server events
//! - `presence`: user-id ↔ live connection, online/offline broadcast
//! - `mailbox`: bounded, expiring per-recipient queue of undelivered envelopes
//! - `assets`: chunked upload reassembly and short-lived asset storage

pub mod assets;
pub mod error;
pub mod mailbox;
pub mod presence;
pub mod sink;

pub use assets::{AssetConfig, AssetStore, ChunkOutcome, StoredAsset};
pub use error::StoreError;
pub use mailbox::{EnqueueOutcome, LockedMailbox, MailboxConfig, MailboxStore, SenderBatch, SweepStats};
pub use presence::{JoinOutcome, PresenceRegistry};
pub use sink::{ConnectionId, EventSink, SharedSink};
