//! Local filesystem storage backend.
//!
//! Objects are stored as flat files under a configurable root directory,
//! with the object key used as a relative path.  Object metadata lives in
//! a JSON sidecar under `.meta/`, and upload segments under
//! `.segments/{hashed upload key}/{offset}`.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use super::backend::{
    apply_range, compute_composite_etag, compute_etag, hashed_key, md5_digest, object_info,
    verify_sha256, ObjectInfo, PutOptions, StorageBackend, StoredObject,
};
use super::error::{StorageError, StorageResult};
use crate::range::StorageRange;

/// Stores objects on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored objects.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(".tmp"))?;
        std::fs::create_dir_all(root.join(".meta"))?;
        std::fs::create_dir_all(root.join(".segments"))?;
        Ok(Self { root })
    }

    /// Resolve an object key to an absolute file path.
    ///
    /// Rejects keys that would escape the root directory or collide with
    /// the backend's own bookkeeping directories.
    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.starts_with('.') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.root.join(key))
    }

    /// Sidecar metadata path for an object key.
    fn meta_path(&self, key: &str) -> PathBuf {
        self.root
            .join(".meta")
            .join(format!("{}.json", hashed_key(key)))
    }

    /// Directory holding the segments of an upload.
    fn segment_dir(&self, upload_key: &str) -> PathBuf {
        self.root.join(".segments").join(hashed_key(upload_key))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{id}"))
    }

    /// Crash-only write: temp file, fsync, rename into place.
    fn write_atomic(&self, final_path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.temp_path();
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, final_path)?;
        Ok(())
    }

    fn read_info(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        let path = self.meta_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        let info = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Backend(format!("corrupt metadata for {key}: {e}")))?;
        Ok(Some(info))
    }

    /// Write object bytes, then its metadata sidecar.
    fn write_object(&self, key: &str, data: &[u8], info: &ObjectInfo) -> StorageResult<()> {
        let final_path = self.resolve(key)?;
        self.write_atomic(&final_path, data)?;
        let meta = serde_json::to_vec(info)
            .map_err(|e| StorageError::Backend(format!("encode metadata for {key}: {e}")))?;
        self.write_atomic(&self.meta_path(key), &meta)
    }
}

impl StorageBackend for LocalBackend {
    fn get(
        &self,
        key: &str,
        range: Option<StorageRange>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            let info = match self.read_info(&key)? {
                Some(info) if path.is_file() => info,
                _ => return Ok(None),
            };
            let data = Bytes::from(std::fs::read(&path)?);
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
            let path = self.resolve(&key)?;
            if !path.is_file() {
                return Ok(None);
            }
            self.read_info(&key)
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
            self.write_object(&key, &data, &info)?;
            Ok(info)
        })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;

            // Idempotent: if the file doesn't exist, that's fine.
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let meta = self.meta_path(&key);
            if meta.exists() {
                std::fs::remove_file(&meta)?;
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
        let dir = self.segment_dir(upload_key);
        Box::pin(async move {
            // Zero-padded so a directory listing sorts by offset.
            let final_path = dir.join(format!("{offset:020}"));
            self.write_atomic(&final_path, &data)?;
            Ok(compute_etag(&data))
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
        let dir = self.segment_dir(&upload_key);
        let offsets = offsets.to_vec();
        Box::pin(async move {
            let final_path = self.resolve(&key)?;
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            // Stream segments into one temp file, hashing as we go.
            let tmp_path = self.temp_path();
            let mut output_file = std::fs::File::create(&tmp_path)?;
            let mut combined_md5_bytes: Vec<u8> = Vec::new();
            let mut hasher = Sha256::new();
            let mut total_size: u64 = 0;

            for offset in &offsets {
                let segment_path = dir.join(format!("{offset:020}"));
                let segment = match std::fs::read(&segment_path) {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        let _ = std::fs::remove_file(&tmp_path);
                        return Err(StorageError::NotFound(format!(
                            "segment {upload_key}@{offset}"
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };
                combined_md5_bytes.extend_from_slice(&md5_digest(&segment));
                hasher.update(&segment);
                total_size += segment.len() as u64;
                output_file.write_all(&segment)?;
            }

            if let Some(expected) = &options.sha256 {
                let actual: [u8; 32] = hasher.finalize().into();
                if &actual != expected {
                    let _ = std::fs::remove_file(&tmp_path);
                    return Err(StorageError::ChecksumMismatch(key));
                }
            }

            output_file.sync_all()?;
            drop(output_file);
            std::fs::rename(&tmp_path, &final_path)?;

            let etag = compute_composite_etag(&combined_md5_bytes, offsets.len());
            let mut info = object_info(&key, &[], etag, &options);
            info.size = total_size;
            let meta = serde_json::to_vec(&info)
                .map_err(|e| StorageError::Backend(format!("encode metadata for {key}: {e}")))?;
            self.write_atomic(&self.meta_path(&key), &meta)?;
            Ok(info)
        })
    }

    fn delete_segments(
        &self,
        upload_key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let dir = self.segment_dir(upload_key);
        Box::pin(async move {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
