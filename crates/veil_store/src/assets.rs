//! Encrypted asset (image) transfer.
//!
//! Upload lifecycle: `METADATA_RECEIVED → (chunk)* → COMPLETE`.
//! - `begin_upload` opens a slot table of `total_chunks` entries.
//! - `put_chunk` fills one slot. Chunks may arrive in any order and a
//!   repeated index overwrites its slot without double-counting.
//! - The upload completes once every slot is filled and a chunk flagged
//!   `is_last` has been seen; slots are concatenated in index order and the
//!   blob is promoted to the asset table under the same id.
//! - A malformed sequence (index out of range, last chunk with gaps,
//!   oversize) abandons the upload; the sender must start over.
//!
//! Assets are for immediate pickup, not archival: the sweep removes stored
//! assets and stalled uploads older than `ttl`.
//!
//! An id is claimed by exactly one of the two tables at any time. Paths
//! that check or move an id take `uploads` before `assets` and hold both,
//! so promotion never leaves a window where the id is free.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use veil_proto::{FileMeta, MessageId, UserId};

use crate::error::StoreError;

pub const DEFAULT_MAX_ASSET_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_TTL_SECS: i64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub max_asset_bytes: usize,
    pub ttl: Duration,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
            ttl: Duration::seconds(DEFAULT_TTL_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub target_user_id: UserId,
    /// Encrypted blob (AES-256-GCM ciphertext of the original file).
    pub data: Vec<u8>,
    pub iv: Vec<u8>,
    pub file_meta: FileMeta,
    pub stored_at: DateTime<Utc>,
}

impl StoredAsset {
    pub fn may_access(&self, user_id: &UserId) -> bool {
        &self.sender_id == user_id || &self.target_user_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Progress { received: u32, total: u32 },
    Completed(Arc<StoredAsset>),
}

struct Upload {
    sender_id: UserId,
    target_user_id: UserId,
    iv: Vec<u8>,
    file_meta: FileMeta,
    slots: Vec<Option<Vec<u8>>>,
    received: u32,
    bytes: usize,
    last_seen: bool,
    finished: bool,
    started_at: DateTime<Utc>,
}

impl Upload {
    fn total(&self) -> u32 {
        self.slots.len() as u32
    }
}

type UploadCell = Arc<Mutex<Upload>>;

/// Concatenate `slots` in index order, failing on the first gap.
pub fn reassemble(slots: &[Option<Vec<u8>>]) -> Result<Vec<u8>, StoreError> {
    let mut size = 0usize;
    for (i, slot) in slots.iter().enumerate() {
        match slot {
            Some(chunk) => size += chunk.len(),
            None => return Err(StoreError::MissingChunk(i as u32)),
        }
    }
    let mut out = Vec::with_capacity(size);
    for chunk in slots.iter().flatten() {
        out.extend_from_slice(chunk);
    }
    Ok(out)
}

enum Step {
    Continue(ChunkOutcome),
    Abandon(StoreError),
    Promote(StoredAsset),
}

pub struct AssetStore {
    config: AssetConfig,
    uploads: RwLock<HashMap<MessageId, UploadCell>>,
    assets: RwLock<HashMap<MessageId, Arc<StoredAsset>>>,
}

impl AssetStore {
    pub fn new(config: AssetConfig) -> Self {
        Self {
            config,
            uploads: RwLock::new(HashMap::new()),
            assets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AssetConfig {
        &self.config
    }

    fn check_size(&self, size: usize) -> Result<(), StoreError> {
        if size > self.config.max_asset_bytes {
            return Err(StoreError::TooLarge {
                size,
                limit: self.config.max_asset_bytes,
            });
        }
        Ok(())
    }

    // ── Chunked upload ───────────────────────────────────────────────────────

    pub fn begin_upload(
        &self,
        sender_id: &UserId,
        message_id: &MessageId,
        target_user_id: &UserId,
        total_chunks: u32,
        iv: Vec<u8>,
        file_meta: FileMeta,
    ) -> Result<(), StoreError> {
        self.begin_upload_at(sender_id, message_id, target_user_id, total_chunks, iv, file_meta, Utc::now())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn begin_upload_at(
        &self,
        sender_id: &UserId,
        message_id: &MessageId,
        target_user_id: &UserId,
        total_chunks: u32,
        iv: Vec<u8>,
        file_meta: FileMeta,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if total_chunks == 0 {
            return Err(StoreError::IndexOutOfRange { index: 0, total: 0 });
        }
        let mut uploads = self.uploads.write();
        if uploads.contains_key(message_id) || self.assets.read().contains_key(message_id) {
            return Err(StoreError::Conflict(message_id.to_string()));
        }
        uploads.insert(
            message_id.clone(),
            Arc::new(Mutex::new(Upload {
                sender_id: sender_id.clone(),
                target_user_id: target_user_id.clone(),
                iv,
                file_meta,
                slots: vec![None; total_chunks as usize],
                received: 0,
                bytes: 0,
                last_seen: false,
                finished: false,
                started_at: now,
            })),
        );
        info!(message_id = %message_id, sender = %sender_id, total_chunks, "chunked upload started");
        Ok(())
    }

    pub fn put_chunk(
        &self,
        sender_id: &UserId,
        message_id: &MessageId,
        index: u32,
        data: Vec<u8>,
        is_last: bool,
    ) -> Result<ChunkOutcome, StoreError> {
        self.put_chunk_at(sender_id, message_id, index, data, is_last, Utc::now())
    }

    pub fn put_chunk_at(
        &self,
        sender_id: &UserId,
        message_id: &MessageId,
        index: u32,
        data: Vec<u8>,
        is_last: bool,
        now: DateTime<Utc>,
    ) -> Result<ChunkOutcome, StoreError> {
        let cell = self
            .uploads
            .read()
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;

        let step = {
            let mut upload = cell.lock();
            if upload.finished {
                return Err(StoreError::NotFound(message_id.to_string()));
            }
            if &upload.sender_id != sender_id {
                return Err(StoreError::Forbidden(format!(
                    "upload {message_id} belongs to another sender"
                )));
            }
            let step = self.apply_chunk(&mut upload, message_id, index, data, is_last, now);
            if !matches!(step, Step::Continue(_)) {
                upload.finished = true;
            }
            step
        };

        match step {
            Step::Continue(outcome) => Ok(outcome),
            Step::Abandon(err) => {
                self.uploads.write().remove(message_id);
                warn!(message_id = %message_id, error = %err, "chunked upload abandoned");
                Err(err)
            }
            Step::Promote(asset) => {
                let asset = Arc::new(asset);
                let mut uploads = self.uploads.write();
                self.assets.write().insert(message_id.clone(), asset.clone());
                uploads.remove(message_id);
                drop(uploads);
                info!(message_id = %message_id, bytes = asset.data.len(), "asset reassembled");
                Ok(ChunkOutcome::Completed(asset))
            }
        }
    }

    fn apply_chunk(
        &self,
        upload: &mut Upload,
        message_id: &MessageId,
        index: u32,
        data: Vec<u8>,
        is_last: bool,
        now: DateTime<Utc>,
    ) -> Step {
        let total = upload.total();
        if index >= total {
            return Step::Abandon(StoreError::IndexOutOfRange { index, total });
        }

        let slot = &mut upload.slots[index as usize];
        let replaced = slot.as_ref().map(Vec::len);
        let new_bytes = upload.bytes - replaced.unwrap_or(0) + data.len();
        if let Err(err) = self.check_size(new_bytes) {
            return Step::Abandon(err);
        }
        *slot = Some(data);
        upload.bytes = new_bytes;
        if replaced.is_none() {
            upload.received += 1;
        }
        upload.last_seen |= is_last;
        debug!(message_id = %message_id, index, received = upload.received, total, "chunk stored");

        if is_last && upload.received < total {
            let gap = upload.slots.iter().position(Option::is_none).unwrap_or(0) as u32;
            return Step::Abandon(StoreError::MissingChunk(gap));
        }
        if !(upload.last_seen && upload.received == total) {
            return Step::Continue(ChunkOutcome::Progress {
                received: upload.received,
                total,
            });
        }

        match reassemble(&upload.slots) {
            Ok(data) => Step::Promote(StoredAsset {
                message_id: message_id.clone(),
                sender_id: upload.sender_id.clone(),
                target_user_id: upload.target_user_id.clone(),
                data,
                iv: std::mem::take(&mut upload.iv),
                file_meta: std::mem::take(&mut upload.file_meta),
                stored_at: now,
            }),
            Err(err) => Step::Abandon(err),
        }
    }

    pub fn upload_in_progress(&self, message_id: &MessageId) -> bool {
        self.uploads.read().contains_key(message_id)
    }

    // ── Single-shot ──────────────────────────────────────────────────────────

    pub fn store_whole(
        &self,
        sender_id: &UserId,
        message_id: &MessageId,
        target_user_id: &UserId,
        data: Vec<u8>,
        iv: Vec<u8>,
        file_meta: FileMeta,
    ) -> Result<Arc<StoredAsset>, StoreError> {
        self.store_whole_at(sender_id, message_id, target_user_id, data, iv, file_meta, Utc::now())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store_whole_at(
        &self,
        sender_id: &UserId,
        message_id: &MessageId,
        target_user_id: &UserId,
        data: Vec<u8>,
        iv: Vec<u8>,
        file_meta: FileMeta,
        now: DateTime<Utc>,
    ) -> Result<Arc<StoredAsset>, StoreError> {
        self.check_size(data.len())?;
        let uploads = self.uploads.read();
        if uploads.contains_key(message_id) {
            return Err(StoreError::Conflict(message_id.to_string()));
        }
        let asset = Arc::new(StoredAsset {
            message_id: message_id.clone(),
            sender_id: sender_id.clone(),
            target_user_id: target_user_id.clone(),
            data,
            iv,
            file_meta,
            stored_at: now,
        });
        let mut assets = self.assets.write();
        if assets.contains_key(message_id) {
            return Err(StoreError::Conflict(message_id.to_string()));
        }
        assets.insert(message_id.clone(), asset.clone());
        drop(assets);
        drop(uploads);
        info!(message_id = %message_id, bytes = asset.data.len(), "asset stored");
        Ok(asset)
    }

    // ── Fetch / sweep ────────────────────────────────────────────────────────

    pub fn get_asset(&self, message_id: &MessageId) -> Result<Arc<StoredAsset>, StoreError> {
        self.assets
            .read()
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))
    }

    pub fn asset_count(&self) -> usize {
        self.assets.read().len()
    }

    pub fn sweep_expired(&self) -> (usize, usize) {
        self.sweep_expired_at(Utc::now())
    }

    /// Remove assets and uploads older than the TTL.
    /// Returns `(assets_removed, uploads_removed)`.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let cutoff = now - self.config.ttl;

        let assets_removed = {
            let mut assets = self.assets.write();
            let before = assets.len();
            assets.retain(|_, a| a.stored_at > cutoff);
            before - assets.len()
        };

        let uploads_removed = {
            let mut uploads = self.uploads.write();
            let before = uploads.len();
            uploads.retain(|_, cell| {
                let mut upload = cell.lock();
                let keep = upload.started_at > cutoff;
                if !keep {
                    upload.finished = true;
                }
                keep
            });
            before - uploads.len()
        };

        if assets_removed > 0 || uploads_removed > 0 {
            info!(assets_removed, uploads_removed, "asset sweep");
        }
        (assets_removed, uploads_removed)
    }
}

impl Default for AssetStore {
    fn default() -> Self {
        Self::new(AssetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn mid(s: &str) -> MessageId {
        MessageId::parse(s).unwrap()
    }

    fn begin(store: &AssetStore, id: &str, total: u32) {
        store
            .begin_upload(&uid("100001"), &mid(id), &uid("200002"), total, vec![0; 12], FileMeta::default())
            .unwrap();
    }

    #[test]
    fn out_of_order_chunks_reassemble() {
        let store = AssetStore::default();
        begin(&store, "img1", 3);
        let alice = uid("100001");
        let original = b"AAAABBBBCC".to_vec();

        assert_eq!(
            store.put_chunk(&alice, &mid("img1"), 2, b"CC".to_vec(), false).unwrap(),
            ChunkOutcome::Progress { received: 1, total: 3 }
        );
        store.put_chunk(&alice, &mid("img1"), 0, b"AAAA".to_vec(), false).unwrap();
        let done = store.put_chunk(&alice, &mid("img1"), 1, b"BBBB".to_vec(), true).unwrap();

        match done {
            ChunkOutcome::Completed(asset) => assert_eq!(asset.data, original),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(!store.upload_in_progress(&mid("img1")));
        assert_eq!(store.get_asset(&mid("img1")).unwrap().data, original);
    }

    #[test]
    fn completing_upload_never_frees_its_id() {
        for round in 0..300 {
            let store = AssetStore::default();
            let id = format!("img{round}");
            begin(&store, &id, 1);
            let alice = uid("100001");

            let (chunk, whole, restart) = std::thread::scope(|scope| {
                let chunk = scope.spawn(|| store.put_chunk(&alice, &mid(&id), 0, b"chunked".to_vec(), true));
                let whole = scope.spawn(|| {
                    store.store_whole(&alice, &mid(&id), &uid("200002"), b"whole".to_vec(), vec![0; 12], FileMeta::default())
                });
                let restart = scope.spawn(|| {
                    store.begin_upload(&alice, &mid(&id), &uid("200002"), 1, vec![0; 12], FileMeta::default())
                });
                (chunk.join().unwrap(), whole.join().unwrap(), restart.join().unwrap())
            });

            assert!(matches!(chunk, Ok(ChunkOutcome::Completed(_))), "round {round}");
            assert!(matches!(whole, Err(StoreError::Conflict(_))), "round {round}");
            assert!(matches!(restart, Err(StoreError::Conflict(_))), "round {round}");
            assert_eq!(store.get_asset(&mid(&id)).unwrap().data, b"chunked".to_vec());
            assert!(!store.upload_in_progress(&mid(&id)));
        }
    }

    #[test]
    fn duplicate_begin_conflicts() {
        let store = AssetStore::default();
        begin(&store, "img1", 2);
        let err = store
            .begin_upload(&uid("100001"), &mid("img1"), &uid("200002"), 2, vec![0; 12], FileMeta::default())
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict("img1".into()));
    }

    #[test]
    fn out_of_range_index_abandons_upload() {
        let store = AssetStore::default();
        begin(&store, "img1", 2);
        let err = store
            .put_chunk(&uid("100001"), &mid("img1"), 2, b"x".to_vec(), false)
            .unwrap_err();
        assert_eq!(err, StoreError::IndexOutOfRange { index: 2, total: 2 });
        assert!(!store.upload_in_progress(&mid("img1")));
    }

    #[test]
    fn last_chunk_with_gap_reports_missing_index() {
        let store = AssetStore::default();
        begin(&store, "img1", 3);
        let alice = uid("100001");
        store.put_chunk(&alice, &mid("img1"), 0, b"a".to_vec(), false).unwrap();
        let err = store.put_chunk(&alice, &mid("img1"), 2, b"c".to_vec(), true).unwrap_err();
        assert_eq!(err, StoreError::MissingChunk(1));
        assert!(matches!(
            store.put_chunk(&alice, &mid("img1"), 1, b"b".to_vec(), false),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn repeated_index_does_not_double_count() {
        let store = AssetStore::default();
        begin(&store, "img1", 2);
        let alice = uid("100001");
        store.put_chunk(&alice, &mid("img1"), 0, b"old".to_vec(), false).unwrap();
        assert_eq!(
            store.put_chunk(&alice, &mid("img1"), 0, b"new".to_vec(), false).unwrap(),
            ChunkOutcome::Progress { received: 1, total: 2 }
        );
        match store.put_chunk(&alice, &mid("img1"), 1, b"!".to_vec(), true).unwrap() {
            ChunkOutcome::Completed(asset) => assert_eq!(asset.data, b"new!".to_vec()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn filled_slots_wait_for_last_flag() {
        let store = AssetStore::default();
        begin(&store, "img1", 2);
        let alice = uid("100001");
        store.put_chunk(&alice, &mid("img1"), 0, b"a".to_vec(), false).unwrap();
        assert_eq!(
            store.put_chunk(&alice, &mid("img1"), 1, b"b".to_vec(), false).unwrap(),
            ChunkOutcome::Progress { received: 2, total: 2 }
        );
        assert!(matches!(
            store.put_chunk(&alice, &mid("img1"), 1, b"b".to_vec(), true).unwrap(),
            ChunkOutcome::Completed(_)
        ));
    }

    #[test]
    fn other_sender_cannot_write_chunks() {
        let store = AssetStore::default();
        begin(&store, "img1", 1);
        assert!(matches!(
            store.put_chunk(&uid("300003"), &mid("img1"), 0, b"x".to_vec(), true),
            Err(StoreError::Forbidden(_))
        ));
        assert!(store.upload_in_progress(&mid("img1")));
    }

    #[test]
    fn reassemble_reports_first_gap() {
        let slots = vec![Some(b"a".to_vec()), None, None];
        assert_eq!(reassemble(&slots), Err(StoreError::MissingChunk(1)));
    }

    #[test]
    fn whole_upload_enforces_ceiling() {
        let store = AssetStore::new(AssetConfig {
            max_asset_bytes: 8,
            ttl: Duration::hours(1),
        });
        let err = store
            .store_whole(&uid("100001"), &mid("big"), &uid("200002"), vec![0; 9], vec![0; 12], FileMeta::default())
            .unwrap_err();
        assert_eq!(err, StoreError::TooLarge { size: 9, limit: 8 });
        assert!(store
            .store_whole(&uid("100001"), &mid("ok"), &uid("200002"), vec![0; 8], vec![0; 12], FileMeta::default())
            .is_ok());
    }

    #[test]
    fn chunked_upload_enforces_ceiling() {
        let store = AssetStore::new(AssetConfig {
            max_asset_bytes: 4,
            ttl: Duration::hours(1),
        });
        begin(&store, "img1", 2);
        let alice = uid("100001");
        store.put_chunk(&alice, &mid("img1"), 0, vec![0; 3], false).unwrap();
        assert!(matches!(
            store.put_chunk(&alice, &mid("img1"), 1, vec![0; 3], true),
            Err(StoreError::TooLarge { .. })
        ));
    }

    #[test]
    fn access_limited_to_participants() {
        let store = AssetStore::default();
        let asset = store
            .store_whole(&uid("100001"), &mid("a"), &uid("200002"), vec![1], vec![0; 12], FileMeta::default())
            .unwrap();
        assert!(asset.may_access(&uid("100001")));
        assert!(asset.may_access(&uid("200002")));
        assert!(!asset.may_access(&uid("300003")));
    }

    #[test]
    fn sweep_removes_old_assets_and_uploads() {
        let store = AssetStore::default();
        let t0 = Utc::now();
        store
            .store_whole_at(&uid("100001"), &mid("old"), &uid("200002"), vec![1], vec![0; 12], FileMeta::default(), t0)
            .unwrap();
        store
            .begin_upload_at(&uid("100001"), &mid("stalled"), &uid("200002"), 4, vec![0; 12], FileMeta::default(), t0)
            .unwrap();
        store
            .store_whole_at(
                &uid("100001"),
                &mid("fresh"),
                &uid("200002"),
                vec![1],
                vec![0; 12],
                FileMeta::default(),
                t0 + Duration::minutes(45),
            )
            .unwrap();

        let (assets, uploads) = store.sweep_expired_at(t0 + Duration::minutes(61));
        assert_eq!((assets, uploads), (1, 1));
        assert!(store.get_asset(&mid("fresh")).is_ok());
        assert_eq!(store.get_asset(&mid("old")).unwrap_err(), StoreError::NotFound("old".into()));
        assert!(!store.upload_in_progress(&mid("stalled")));
    }
}
