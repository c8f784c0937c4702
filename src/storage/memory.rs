//! In-memory storage backend.
//!
//! Objects and upload segments are held in `tokio::sync::RwLock<HashMap<...>>`
//! maps.  A configurable memory limit (`max_size_bytes`) caps total stored
//! bytes.  Nothing survives a restart; use it for tests and single-node
//! development.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::backend::{
    apply_range, compute_composite_etag, compute_etag, md5_digest, object_info, verify_sha256,
    ObjectInfo, PutOptions, StorageBackend, StoredObject,
};
use super::error::{StorageError, StorageResult};
use crate::range::StorageRange;

/// In-memory storage backend.
pub struct MemoryBackend {
    /// Object store: key -> (data, metadata).
    objects: tokio::sync::RwLock<HashMap<String, (Bytes, ObjectInfo)>>,
    /// Segment store: upload key -> offset -> (data, etag).
    segments: tokio::sync::RwLock<HashMap<String, HashMap<u64, (Bytes, String)>>>,
    /// Current total bytes stored (objects + segments).
    current_size: tokio::sync::RwLock<u64>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryBackend {
    /// Create a new `MemoryBackend` holding at most `max_size_bytes`
    /// (0 = unlimited).
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            objects: tokio::sync::RwLock::new(HashMap::new()),
            segments: tokio::sync::RwLock::new(HashMap::new()),
            current_size: tokio::sync::RwLock::new(0),
            max_size_bytes,
        }
    }

    /// Total bytes currently held.
    pub async fn stored_bytes(&self) -> u64 {
        *self.current_size.read().await
    }

    /// Number of segments held for `upload_key`.
    pub async fn segment_count(&self, upload_key: &str) -> usize {
        self.segments
            .read()
            .await
            .get(upload_key)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    // ── Memory accounting ──────────────────────────────────────────

    /// Check whether adding `additional` bytes would exceed the memory limit.
    async fn check_capacity(&self, additional: u64) -> StorageResult<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let current = *self.current_size.read().await;
        if current + additional > self.max_size_bytes {
            return Err(StorageError::Backend(format!(
                "Memory limit exceeded: current={current}, additional={additional}, max={}",
                self.max_size_bytes
            )));
        }
        Ok(())
    }

    /// Adjust the tracked size by a signed delta.
    async fn adjust_size(&self, delta: i64) {
        let mut size = self.current_size.write().await;
        if delta >= 0 {
            *size = size.saturating_add(delta as u64);
        } else {
            *size = size.saturating_sub((-delta) as u64);
        }
    }

    /// Insert a finished object, accounting for any object it replaces.
    async fn store_object(&self, key: String, data: Bytes, info: ObjectInfo) -> StorageResult<()> {
        let old_len = {
            let objects = self.objects.read().await;
            objects.get(&key).map(|(d, _)| d.len() as u64)
        };
        let delta = data.len() as i64 - old_len.unwrap_or(0) as i64;
        if delta > 0 {
            self.check_capacity(delta as u64).await?;
        }

        self.objects.write().await.insert(key, (data, info));
        self.adjust_size(delta).await;
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

// ── StorageBackend implementation ──────────────────────────────────────

impl StorageBackend for MemoryBackend {
    fn get(
        &self,
        key: &str,
        range: Option<StorageRange>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let (data, info) = {
                let objects = self.objects.read().await;
                match objects.get(&key) {
                    Some((data, info)) => (data.clone(), info.clone()),
                    None => return Ok(None),
                }
            };
            let (data, range) = apply_range(&key, data, range)?;
            Ok(Some(StoredObject { info, data, range }))
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<ObjectInfo>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            Ok(objects.get(&key).map(|(_, info)| info.clone()))
        })
    }

    fn put(
        &self,
        key: &str,
        data: Bytes,
        options: PutOptions,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            if let Some(expected) = &options.sha256 {
                verify_sha256(&key, &data, expected)?;
            }
            let info = object_info(&key, &data, compute_etag(&data), &options);
            self.store_object(key, data, info.clone()).await?;
            Ok(info)
        })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let removed = self.objects.write().await.remove(&key);
            if let Some((data, _info)) = removed {
                self.adjust_size(-(data.len() as i64)).await;
            }
            Ok(())
        })
    }

    fn put_segment(
        &self,
        upload_key: &str,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let upload_key = upload_key.to_string();
        Box::pin(async move {
            let old_len = {
                let segments = self.segments.read().await;
                segments
                    .get(&upload_key)
                    .and_then(|s| s.get(&offset))
                    .map(|(d, _)| d.len() as u64)
            };
            let delta = data.len() as i64 - old_len.unwrap_or(0) as i64;
            if delta > 0 {
                self.check_capacity(delta as u64).await?;
            }

            let etag = compute_etag(&data);
            self.segments
                .write()
                .await
                .entry(upload_key)
                .or_default()
                .insert(offset, (data, etag.clone()));
            self.adjust_size(delta).await;

            Ok(etag)
        })
    }

    fn assemble_segments(
        &self,
        key: &str,
        upload_key: &str,
        offsets: &[u64],
        options: PutOptions,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>> {
        let key = key.to_string();
        let upload_key = upload_key.to_string();
        let offsets = offsets.to_vec();
        Box::pin(async move {
            let mut combined: Vec<u8> = Vec::new();
            let mut combined_md5_bytes: Vec<u8> = Vec::new();

            {
                let segments = self.segments.read().await;
                let upload = segments.get(&upload_key);
                for offset in &offsets {
                    let (data, _etag) = upload.and_then(|s| s.get(offset)).ok_or_else(|| {
                        StorageError::NotFound(format!("segment {upload_key}@{offset}"))
                    })?;
                    combined_md5_bytes.extend_from_slice(&md5_digest(data));
                    combined.extend_from_slice(data);
                }
            }

            let assembled = Bytes::from(combined);
            if let Some(expected) = &options.sha256 {
                verify_sha256(&key, &assembled, expected)?;
            }

            let etag = compute_composite_etag(&combined_md5_bytes, offsets.len());
            let info = object_info(&key, &assembled, etag, &options);
            self.store_object(key, assembled, info.clone()).await?;
            Ok(info)
        })
    }

    fn delete_segments(
        &self,
        upload_key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let upload_key = upload_key.to_string();
        Box::pin(async move {
            let removed = self.segments.write().await.remove(&upload_key);
            let freed: u64 = removed
                .map(|s| s.values().map(|(d, _)| d.len() as u64).sum())
                .unwrap_or(0);
            if freed > 0 {
                self.adjust_size(-(freed as i64)).await;
            }
            Ok(())
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
