//! Per-upload coordinator.
//!
//! Every upload id owns one slot: an async mutex around its
//! [`UploadSession`]. All mutations of an id (`create`, `append`, and the
//! finalize step inside `append`) hold that mutex, so at most one writer
//! touches a session at a time while different ids proceed in parallel.
//! Each public call runs under the configured call timeout.
//!
//! Session fields change only after the storage writes for a chunk have
//! succeeded. A call that fails or is cut off by the timeout leaves the
//! confirmed offset where it was, and the client resends from there.

use base64::Engine;
use bytes::Bytes;
use metrics::{counter, gauge};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::headers::{ChunkChecksum, DeclaredLength};
use super::metadata::{validate_upload_id, UploadMetadata};
use super::session::{UploadSession, UploadState, UploadStatus};
use crate::errors::TusError;
use crate::metrics::{
    ACTIVE_UPLOADS, BYTES_RECEIVED_TOTAL, CHECKSUM_MISMATCHES_TOTAL, UPLOADS_COMPLETED_TOTAL,
    UPLOADS_CREATED_TOTAL, UPLOADS_EXPIRED_TOTAL,
};
use crate::storage::backend::{PutOptions, StorageBackend, CHECKSUM_METADATA_KEY};

/// Limits applied by the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_upload_length: u64,
    /// Inactivity window after which an unfinished upload expires.
    pub expiration: Duration,
    /// Upper bound on one create/append/status call.
    pub call_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_upload_length: 512 * 1024 * 1024,
            expiration: Duration::from_secs(7 * 24 * 60 * 60),
            call_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// A chunk to apply to an upload.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub checksum: Option<ChunkChecksum>,
    pub data: Bytes,
}

type Slot = Arc<Mutex<Option<UploadSession>>>;

/// Serializes mutations per upload id and finalizes completed uploads
/// into the store.
pub struct UploadCoordinator {
    store: Arc<dyn StorageBackend>,
    config: CoordinatorConfig,
    sessions: RwLock<HashMap<String, Slot>>,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn StorageBackend>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of sessions currently held in memory.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Start a new upload for `id`, optionally applying a first chunk.
    pub async fn create(
        &self,
        id: &str,
        metadata: UploadMetadata,
        length: DeclaredLength,
        initial: Option<Chunk>,
    ) -> Result<UploadStatus, TusError> {
        validate_upload_id(id)?;
        self.bounded(self.create_inner(id, metadata, length, initial))
            .await
    }

    /// Apply a chunk at `chunk.offset`. `length` resolves a deferred length.
    pub async fn append(
        &self,
        id: &str,
        chunk: Chunk,
        length: Option<u64>,
    ) -> Result<UploadStatus, TusError> {
        validate_upload_id(id)?;
        self.bounded(self.append_inner(id, chunk, length)).await
    }

    /// Current offset, length and state of `id`.
    pub async fn status(&self, id: &str) -> Result<UploadStatus, TusError> {
        validate_upload_id(id)?;
        self.bounded(self.status_inner(id)).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, TusError>>,
    ) -> Result<T, TusError> {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "upload call exceeded {:?}; storage effects may still land",
                    self.config.call_timeout
                );
                Err(TusError::Timeout)
            }
        }
    }

    async fn existing_slot(&self, id: &str) -> Option<Slot> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn slot_for_create(&self, id: &str) -> Slot {
        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        gauge!(ACTIVE_UPLOADS).set(sessions.len() as f64);
        slot
    }

    /// Lock the slot for `id`, retrying if the sweeper evicted it between
    /// lookup and lock. The sweeper only evicts while holding the slot, so
    /// a slot that is still mapped once locked stays mapped.
    async fn lock_for_create(&self, id: &str) -> OwnedMutexGuard<Option<UploadSession>> {
        loop {
            let slot = self.slot_for_create(id).await;
            let guard = slot.clone().lock_owned().await;
            let mapped = self
                .sessions
                .read()
                .await
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot));
            if mapped {
                return guard;
            }
            debug!("slot for {} evicted before lock; retrying", id);
        }
    }

    /// Status of an upload that is not resident: complete if its object
    /// exists in the store, unknown otherwise.
    async fn stored_status(&self, id: &str) -> Result<UploadStatus, TusError> {
        match self.store.head(id).await? {
            Some(info) => Ok(UploadStatus {
                id: id.to_string(),
                offset: info.size,
                declared_length: Some(info.size),
                state: UploadState::Completed,
                expires_at: None,
                metadata: None,
            }),
            None => Err(TusError::NotFound),
        }
    }

    async fn create_inner(
        &self,
        id: &str,
        metadata: UploadMetadata,
        length: DeclaredLength,
        initial: Option<Chunk>,
    ) -> Result<UploadStatus, TusError> {
        let declared = match length {
            DeclaredLength::Known(len) => {
                self.check_capacity(len)?;
                Some(len)
            }
            DeclaredLength::Deferred => None,
        };

        let mut guard = self.lock_for_create(id).await;
        let now = SystemTime::now();

        if let Some(existing) = guard.as_ref() {
            if !existing.is_expired(now, self.config.expiration) {
                return Err(TusError::AlreadyExists(id.to_string()));
            }
            debug!("replacing expired upload {}", id);
            self.store.delete_segments(id).await?;
            *guard = None;
        }
        if self.store.head(id).await?.is_some() {
            return Err(TusError::AlreadyExists(id.to_string()));
        }

        let mut session = UploadSession::new(id.to_string(), declared, metadata, now);
        if declared == Some(0) {
            self.finalize_empty(&mut session).await?;
        } else {
            session.state = UploadState::Receiving;
        }
        counter!(UPLOADS_CREATED_TOTAL).increment(1);
        info!(
            "upload created: id={} length={:?}",
            id, session.declared_length
        );
        let status = session.status(self.config.expiration);
        let session = guard.insert(session);

        match initial {
            Some(chunk) if !chunk.data.is_empty() => {
                let result = self.apply_chunk(session, chunk, None).await;
                if result.is_err() {
                    // The client never learned the upload URL; let it retry
                    // creation from scratch.
                    *guard = None;
                    self.cleanup_segments(id);
                }
                result
            }
            _ => Ok(status),
        }
    }

    async fn append_inner(
        &self,
        id: &str,
        chunk: Chunk,
        length: Option<u64>,
    ) -> Result<UploadStatus, TusError> {
        let Some(slot) = self.existing_slot(id).await else {
            return self.append_to_stored(id, &chunk).await;
        };
        let mut guard = slot.lock().await;
        if guard.is_none() {
            drop(guard);
            return self.append_to_stored(id, &chunk).await;
        }
        let Some(session) = guard.as_mut() else {
            return Err(TusError::NotFound);
        };

        if session.is_expired(SystemTime::now(), self.config.expiration) {
            session.state = UploadState::Expired;
            return Err(TusError::Expired);
        }
        self.apply_chunk(session, chunk, length).await
    }

    /// An append for an upload whose session is gone. Only a no-op append at
    /// the final offset of a stored object succeeds.
    async fn append_to_stored(&self, id: &str, chunk: &Chunk) -> Result<UploadStatus, TusError> {
        let status = self.stored_status(id).await?;
        if chunk.offset != status.offset {
            return Err(TusError::Conflict {
                expected: status.offset,
                received: chunk.offset,
            });
        }
        if !chunk.data.is_empty() {
            return Err(TusError::CapacityExceeded(format!(
                "upload {id} is already complete"
            )));
        }
        Ok(status)
    }

    async fn status_inner(&self, id: &str) -> Result<UploadStatus, TusError> {
        if let Some(slot) = self.existing_slot(id).await {
            let guard = slot.lock().await;
            if let Some(session) = guard.as_ref() {
                if session.is_expired(SystemTime::now(), self.config.expiration) {
                    return Err(TusError::Expired);
                }
                return Ok(session.status(self.config.expiration));
            }
        }
        self.stored_status(id).await
    }

    fn check_capacity(&self, length: u64) -> Result<(), TusError> {
        if length > self.config.max_upload_length {
            return Err(TusError::CapacityExceeded(format!(
                "upload length {length} exceeds maximum {}",
                self.config.max_upload_length
            )));
        }
        Ok(())
    }

    /// Validate and persist one chunk, then commit it to the session.
    async fn apply_chunk(
        &self,
        session: &mut UploadSession,
        chunk: Chunk,
        length: Option<u64>,
    ) -> Result<UploadStatus, TusError> {
        if chunk.offset != session.offset {
            return Err(TusError::Conflict {
                expected: session.offset,
                received: chunk.offset,
            });
        }

        let declared = match (session.declared_length, length) {
            (Some(current), Some(requested)) if current != requested => {
                return Err(TusError::Protocol(format!(
                    "Upload-Length {requested} conflicts with declared length {current}"
                )));
            }
            (Some(current), _) => Some(current),
            (None, Some(requested)) => {
                self.check_capacity(requested)?;
                if requested < session.offset {
                    return Err(TusError::Protocol(format!(
                        "Upload-Length {requested} is below the current offset {}",
                        session.offset
                    )));
                }
                Some(requested)
            }
            (None, None) => None,
        };

        let len = chunk.data.len() as u64;
        let end = chunk.offset + len;
        match declared {
            Some(total) if end > total => {
                return Err(TusError::CapacityExceeded(format!(
                    "chunk ends at {end}, past the declared length {total}"
                )));
            }
            None => self.check_capacity(end)?,
            _ => {}
        }

        if let Some(expected) = &chunk.checksum {
            let actual: [u8; 32] = Sha256::digest(&chunk.data).into();
            if actual != expected.sha256 {
                counter!(CHECKSUM_MISMATCHES_TOTAL).increment(1);
                debug!(
                    "checksum mismatch for {} at offset {}; chunk discarded",
                    session.id, chunk.offset
                );
                return Err(TusError::ChecksumMismatch);
            }
        }

        if session.is_completed() {
            // Only an empty chunk at the final offset gets here.
            return Ok(session.status(self.config.expiration));
        }

        let mut hasher = session.hasher.clone();
        hasher.update(&chunk.data);
        let completes = declared == Some(end);
        let mut segments = session.segments.clone();

        if completes && segments.is_empty() && chunk.offset == 0 {
            // The whole upload in one piece: one put with a native checksum.
            let digest: [u8; 32] = hasher.clone().finalize().into();
            self.store
                .put(
                    &session.id,
                    chunk.data,
                    PutOptions {
                        content_type: session.content_type(),
                        sha256: Some(digest),
                        custom_metadata: BTreeMap::new(),
                    },
                )
                .await?;
        } else {
            if len > 0 {
                self.store
                    .put_segment(&session.id, chunk.offset, chunk.data)
                    .await?;
                segments.push(chunk.offset);
            }
            if completes {
                let digest = hasher.clone().finalize();
                let mut custom_metadata = BTreeMap::new();
                custom_metadata.insert(
                    CHECKSUM_METADATA_KEY.to_string(),
                    base64::engine::general_purpose::STANDARD.encode(digest),
                );
                self.store
                    .assemble_segments(
                        &session.id,
                        &session.id,
                        &segments,
                        PutOptions {
                            content_type: session.content_type(),
                            sha256: None,
                            custom_metadata,
                        },
                    )
                    .await?;
            }
        }

        // Storage effects landed; commit.
        session.offset = end;
        session.declared_length = declared;
        session.hasher = hasher;
        session.segments = segments;
        session.last_activity_at = SystemTime::now();
        counter!(BYTES_RECEIVED_TOTAL).increment(len);

        if completes {
            session.state = UploadState::Completed;
            counter!(UPLOADS_COMPLETED_TOTAL).increment(1);
            info!("upload completed: id={} size={}", session.id, end);
            if !session.segments.is_empty() {
                self.cleanup_segments(&session.id);
            }
        }
        Ok(session.status(self.config.expiration))
    }

    /// Store the object of a zero-length upload.
    async fn finalize_empty(&self, session: &mut UploadSession) -> Result<(), TusError> {
        let digest: [u8; 32] = session.hasher.clone().finalize().into();
        self.store
            .put(
                &session.id,
                Bytes::new(),
                PutOptions {
                    content_type: session.content_type(),
                    sha256: Some(digest),
                    custom_metadata: BTreeMap::new(),
                },
            )
            .await?;
        session.state = UploadState::Completed;
        counter!(UPLOADS_COMPLETED_TOTAL).increment(1);
        info!("upload completed: id={} size=0", session.id);
        Ok(())
    }

    /// Delete an upload's segments outside the caller's deadline.
    fn cleanup_segments(&self, id: &str) {
        let store = self.store.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.delete_segments(&id).await {
                warn!("failed to delete segments of {}: {}", id, e);
            }
        });
    }

    /// Drop expired uploads and evict completed ones idle past the
    /// expiration window. Returns the number of expired uploads removed.
    pub async fn sweep_expired(&self) -> usize {
        let snapshot: Vec<(String, Slot)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let now = SystemTime::now();
        let mut expired = 0;
        for (id, slot) in snapshot {
            // A busy slot is mid-call, so it is not idle.
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let remove = match guard.as_ref() {
                None => true,
                Some(session) if session.is_expired(now, self.config.expiration) => {
                    if let Err(e) = self.store.delete_segments(&id).await {
                        warn!("failed to delete segments of expired upload {}: {}", id, e);
                        continue;
                    }
                    counter!(UPLOADS_EXPIRED_TOTAL).increment(1);
                    info!("upload expired: id={} offset={}", id, session.offset);
                    expired += 1;
                    true
                }
                Some(session) => {
                    session.is_completed() && session.idle_for(now) > self.config.expiration
                }
            };
            if remove {
                *guard = None;
                // Unmap while still holding the slot so a create waiting on
                // it sees the eviction once it gets the lock.
                let mut sessions = self.sessions.write().await;
                if sessions.get(&id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    sessions.remove(&id);
                }
                gauge!(ACTIVE_UPLOADS).set(sessions.len() as f64);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::StorageRange;
    use crate::storage::backend::{ObjectInfo, StoredObject};
    use crate::storage::error::{StorageError, StorageResult};
    use crate::storage::memory::MemoryBackend;
    use crate::tus::metadata::parse_upload_metadata;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Memory store whose next writes misbehave: `stalled` writes hang
    /// well past any test deadline, then `failing` writes return a 503.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryBackend,
        stalled: AtomicU32,
        failing: AtomicU32,
    }

    impl FaultyStore {
        fn take(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn write<'a, T: Send + 'a>(
            &'a self,
            op: Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>,
        ) -> Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>> {
            if Self::take(&self.stalled) {
                return Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    op.await
                });
            }
            if Self::take(&self.failing) {
                return Box::pin(async {
                    Err(StorageError::Server {
                        status: 503,
                        message: "slow down".to_string(),
                    })
                });
            }
            op
        }
    }

    impl StorageBackend for FaultyStore {
        fn get(
            &self,
            key: &str,
            range: Option<StorageRange>,
        ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>>
        {
            self.inner.get(key, range)
        }

        fn head(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = StorageResult<Option<ObjectInfo>>> + Send + '_>> {
            self.inner.head(key)
        }

        fn put(
            &self,
            key: &str,
            data: Bytes,
            options: PutOptions,
        ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>> {
            self.write(self.inner.put(key, data, options))
        }

        fn delete(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
            self.inner.delete(key)
        }

        fn put_segment(
            &self,
            upload_key: &str,
            offset: u64,
            data: Bytes,
        ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
            self.write(self.inner.put_segment(upload_key, offset, data))
        }

        fn assemble_segments(
            &self,
            key: &str,
            upload_key: &str,
            offsets: &[u64],
            options: PutOptions,
        ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>> {
            self.write(self.inner.assemble_segments(key, upload_key, offsets, options))
        }

        fn delete_segments(
            &self,
            upload_key: &str,
        ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
            self.inner.delete_segments(upload_key)
        }
    }

    fn faulty_coordinator() -> (Arc<FaultyStore>, UploadCoordinator) {
        let store = Arc::new(FaultyStore::default());
        let coordinator = UploadCoordinator::new(
            store.clone(),
            CoordinatorConfig {
                call_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        (store, coordinator)
    }

    fn coordinator_with(config: CoordinatorConfig) -> (Arc<MemoryBackend>, UploadCoordinator) {
        let store = Arc::new(MemoryBackend::default());
        let coordinator = UploadCoordinator::new(store.clone(), config);
        (store, coordinator)
    }

    fn coordinator() -> (Arc<MemoryBackend>, UploadCoordinator) {
        coordinator_with(CoordinatorConfig::default())
    }

    fn metadata() -> UploadMetadata {
        // filename "doc.txt", filetype "text/plain"
        parse_upload_metadata("filename ZG9jLnR4dA==,filetype dGV4dC9wbGFpbg==").unwrap()
    }

    fn chunk(offset: u64, data: &'static [u8]) -> Chunk {
        Chunk {
            offset,
            checksum: None,
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_chunked_upload_completes_once() {
        let (store, coordinator) = coordinator();
        let created = coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(11), None)
            .await
            .unwrap();
        assert_eq!(created.offset, 0);
        assert_eq!(created.state, UploadState::Receiving);

        let status = coordinator
            .append("doc.txt", chunk(0, b"hello "), None)
            .await
            .unwrap();
        assert_eq!(status.offset, 6);
        assert!(store.head("doc.txt").await.unwrap().is_none());

        let status = coordinator
            .append("doc.txt", chunk(6, b"world"), None)
            .await
            .unwrap();
        assert_eq!(status.offset, 11);
        assert_eq!(status.state, UploadState::Completed);
        assert_eq!(status.expires_at, None);

        let stored = store.get("doc.txt", None).await.unwrap().unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"hello world"));
        assert_eq!(stored.info.content_type, "text/plain");
        let expected = base64::engine::general_purpose::STANDARD
            .encode(Sha256::digest(b"hello world"));
        assert_eq!(stored.info.sha256_base64(), Some(expected));
    }

    #[tokio::test]
    async fn test_single_chunk_upload_uses_native_checksum() {
        let (store, coordinator) = coordinator();
        coordinator
            .create(
                "doc.txt",
                metadata(),
                DeclaredLength::Known(5),
                Some(chunk(0, b"hello")),
            )
            .await
            .unwrap();
        let info = store.head("doc.txt").await.unwrap().unwrap();
        assert_eq!(info.sha256, Some(Sha256::digest(b"hello").to_vec()));
        assert!(info.custom_metadata.is_empty());
        assert_eq!(store.segment_count("doc.txt").await, 0);
    }

    #[tokio::test]
    async fn test_resubmitted_chunk_is_conflict() {
        let (_store, coordinator) = coordinator();
        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(10), None)
            .await
            .unwrap();
        coordinator
            .append("doc.txt", chunk(0, b"abcde"), None)
            .await
            .unwrap();

        let err = coordinator
            .append("doc.txt", chunk(0, b"abcde"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TusError::Conflict {
                expected: 5,
                received: 0
            }
        ));
        assert_eq!(coordinator.status("doc.txt").await.unwrap().offset, 5);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_offset_unchanged() {
        let (store, coordinator) = coordinator();
        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(10), None)
            .await
            .unwrap();
        let bad = Chunk {
            offset: 0,
            checksum: Some(ChunkChecksum {
                sha256: Sha256::digest(b"other").into(),
            }),
            data: Bytes::from_static(b"abcde"),
        };
        let err = coordinator.append("doc.txt", bad, None).await.unwrap_err();
        assert!(matches!(err, TusError::ChecksumMismatch));
        assert_eq!(coordinator.status("doc.txt").await.unwrap().offset, 0);
        assert_eq!(store.segment_count("doc.txt").await, 0);

        let good = Chunk {
            offset: 0,
            checksum: Some(ChunkChecksum {
                sha256: Sha256::digest(b"abcde").into(),
            }),
            data: Bytes::from_static(b"abcde"),
        };
        assert_eq!(
            coordinator.append("doc.txt", good, None).await.unwrap().offset,
            5
        );
    }

    #[tokio::test]
    async fn test_capacity_checks() {
        let (_store, coordinator) = coordinator_with(CoordinatorConfig {
            max_upload_length: 8,
            ..Default::default()
        });
        assert!(matches!(
            coordinator
                .create("big", metadata(), DeclaredLength::Known(9), None)
                .await,
            Err(TusError::CapacityExceeded(_))
        ));

        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(4), None)
            .await
            .unwrap();
        assert!(matches!(
            coordinator
                .append("doc.txt", chunk(0, b"toolong"), None)
                .await,
            Err(TusError::CapacityExceeded(_))
        ));
        assert_eq!(coordinator.status("doc.txt").await.unwrap().offset, 0);

        coordinator
            .create("deferred", metadata(), DeclaredLength::Deferred, None)
            .await
            .unwrap();
        assert!(matches!(
            coordinator
                .append("deferred", chunk(0, b"123456789"), None)
                .await,
            Err(TusError::CapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_deferred_length_resolved_on_append() {
        let (store, coordinator) = coordinator();
        let status = coordinator
            .create("doc.txt", metadata(), DeclaredLength::Deferred, None)
            .await
            .unwrap();
        assert_eq!(status.declared_length, None);

        coordinator
            .append("doc.txt", chunk(0, b"abc"), None)
            .await
            .unwrap();
        let err = coordinator
            .append("doc.txt", chunk(3, b"def"), Some(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TusError::Protocol(_)));

        let status = coordinator
            .append("doc.txt", chunk(3, b"def"), Some(6))
            .await
            .unwrap();
        assert_eq!(status.declared_length, Some(6));
        assert_eq!(status.state, UploadState::Completed);
        let stored = store.get("doc.txt", None).await.unwrap().unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_zero_length_upload_completes_at_create() {
        let (store, coordinator) = coordinator();
        let status = coordinator
            .create("empty.txt", metadata(), DeclaredLength::Known(0), None)
            .await
            .unwrap();
        assert_eq!(status.state, UploadState::Completed);
        assert_eq!(store.head("empty.txt").await.unwrap().unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_create_existing_is_rejected() {
        let (_store, coordinator) = coordinator();
        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(2), None)
            .await
            .unwrap();
        assert!(matches!(
            coordinator
                .create("doc.txt", metadata(), DeclaredLength::Known(2), None)
                .await,
            Err(TusError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_upload_is_not_found() {
        let (_store, coordinator) = coordinator();
        assert!(matches!(
            coordinator.status("missing").await,
            Err(TusError::NotFound)
        ));
        assert!(matches!(
            coordinator.append("missing", chunk(0, b"x"), None).await,
            Err(TusError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired_upload_and_sweep() {
        let (store, coordinator) = coordinator_with(CoordinatorConfig {
            expiration: Duration::from_millis(20),
            ..Default::default()
        });
        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(10), None)
            .await
            .unwrap();
        coordinator
            .append("doc.txt", chunk(0, b"abc"), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(
            coordinator.status("doc.txt").await,
            Err(TusError::Expired)
        ));
        assert!(matches!(
            coordinator.append("doc.txt", chunk(3, b"def"), None).await,
            Err(TusError::Expired)
        ));

        assert_eq!(coordinator.sweep_expired().await, 1);
        assert_eq!(coordinator.session_count().await, 0);
        assert_eq!(store.segment_count("doc.txt").await, 0);
        assert!(matches!(
            coordinator.status("doc.txt").await,
            Err(TusError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_completed_status_survives_eviction() {
        let (_store, coordinator) = coordinator_with(CoordinatorConfig {
            expiration: Duration::from_millis(20),
            ..Default::default()
        });
        coordinator
            .create(
                "doc.txt",
                metadata(),
                DeclaredLength::Known(3),
                Some(chunk(0, b"abc")),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(coordinator.sweep_expired().await, 0);
        assert_eq!(coordinator.session_count().await, 0);

        let status = coordinator.status("doc.txt").await.unwrap();
        assert_eq!(status.state, UploadState::Completed);
        assert_eq!(status.offset, 3);
        assert!(matches!(
            coordinator
                .create("doc.txt", metadata(), DeclaredLength::Known(3), None)
                .await,
            Err(TusError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_apply_once() {
        let (store, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);
        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(4), None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.append("doc.txt", chunk(0, b"abcd"), None).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        let stored = store.get("doc.txt", None).await.unwrap().unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn test_failed_initial_chunk_allows_recreate() {
        let (_store, coordinator) = coordinator();
        let bad = Chunk {
            offset: 0,
            checksum: Some(ChunkChecksum { sha256: [0u8; 32] }),
            data: Bytes::from_static(b"abc"),
        };
        let err = coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(6), Some(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, TusError::ChecksumMismatch));

        let status = coordinator
            .create(
                "doc.txt",
                metadata(),
                DeclaredLength::Known(6),
                Some(chunk(0, b"abc")),
            )
            .await
            .unwrap();
        assert_eq!(status.offset, 3);
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_storage() {
        let (store, coordinator) = coordinator();
        let err = coordinator
            .create("../etc/passwd", metadata(), DeclaredLength::Known(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TusError::Metadata(_)));
        assert_eq!(coordinator.session_count().await, 0);
        assert_eq!(store.stored_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let (_store, coordinator) = coordinator_with(CoordinatorConfig {
            call_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        let result = coordinator
            .bounded(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(TusError::Timeout)));
    }

    #[tokio::test]
    async fn test_timed_out_append_keeps_offset_and_retry_succeeds() {
        let (store, coordinator) = faulty_coordinator();
        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(6), None)
            .await
            .unwrap();
        coordinator.append("doc.txt", chunk(0, b"abc"), None).await.unwrap();

        store.stalled.store(1, Ordering::SeqCst);
        let err = coordinator
            .append("doc.txt", chunk(3, b"def"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TusError::Timeout));
        let status = coordinator.status("doc.txt").await.unwrap();
        assert_eq!(status.offset, 3);
        assert_eq!(status.state, UploadState::Receiving);
        assert!(store.inner.head("doc.txt").await.unwrap().is_none());

        let status = coordinator
            .append("doc.txt", chunk(3, b"def"), None)
            .await
            .unwrap();
        assert_eq!(status.offset, 6);
        assert_eq!(status.state, UploadState::Completed);
        let stored = store.get("doc.txt", None).await.unwrap().unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_failed_storage_write_keeps_offset_and_retry_succeeds() {
        let (store, coordinator) = faulty_coordinator();
        coordinator
            .create("doc.txt", metadata(), DeclaredLength::Known(6), None)
            .await
            .unwrap();

        store.failing.store(1, Ordering::SeqCst);
        let err = coordinator
            .append("doc.txt", chunk(0, b"abc"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TusError::Storage(_)));
        assert_eq!(coordinator.status("doc.txt").await.unwrap().offset, 0);

        coordinator.append("doc.txt", chunk(0, b"abc"), None).await.unwrap();

        // A failed completing write leaves the upload open.
        store.failing.store(1, Ordering::SeqCst);
        let err = coordinator
            .append("doc.txt", chunk(3, b"def"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TusError::Storage(_)));
        let status = coordinator.status("doc.txt").await.unwrap();
        assert_eq!(status.offset, 3);
        assert_eq!(status.state, UploadState::Receiving);

        coordinator.append("doc.txt", chunk(3, b"def"), None).await.unwrap();
        let stored = store.get("doc.txt", None).await.unwrap().unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_create_survives_eviction_of_its_slot() {
        let (_store, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);

        // An idle empty slot, held the way the sweeper holds it mid-eviction.
        let stale = coordinator.slot_for_create("doc.txt").await;
        let held = stale.clone().lock_owned().await;

        let creating = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .create("doc.txt", metadata(), DeclaredLength::Known(3), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.sessions.write().await.remove("doc.txt");
        drop(held);

        let status = creating.await.unwrap().unwrap();
        assert_eq!(status.offset, 0);
        assert!(stale.lock().await.is_none());
        assert_eq!(coordinator.session_count().await, 1);

        let status = coordinator
            .append("doc.txt", chunk(0, b"abc"), None)
            .await
            .unwrap();
        assert_eq!(status.state, UploadState::Completed);
    }
}
