//! Abstract storage backend trait.
//!
//! Every storage backend must implement [`StorageBackend`].  Objects are
//! addressed by upload id.  Chunks of an in-progress upload live as
//! *segments* keyed by `(upload key, offset)` until they are assembled
//! into the final object.

use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use super::error::{StorageError, StorageResult};
use crate::range::StorageRange;

/// Custom metadata entry carrying the base64 sha256 of objects whose
/// checksum the store cannot compute natively (assembled segments).
pub const CHECKSUM_METADATA_KEY: &str = "x-checksum-sha256";

/// Options applied to a full-object write.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// MIME type recorded with the object.
    pub content_type: String,
    /// Expected sha256 of the payload. The backend verifies it and keeps it
    /// as the object's native checksum.
    pub sha256: Option<[u8; 32]>,
    /// Free-form string metadata stored alongside the object.
    pub custom_metadata: BTreeMap<String, String>,
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Quoted ETag.
    pub etag: String,
    pub content_type: String,
    /// Native sha256 digest, present when the object was written in one piece
    /// with a checksum.
    #[serde(default)]
    pub sha256: Option<Vec<u8>>,
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, String>,
}

impl ObjectInfo {
    /// Base64 sha256 of the object: the native checksum when present,
    /// otherwise the custom metadata fallback.
    pub fn sha256_base64(&self) -> Option<String> {
        match &self.sha256 {
            Some(digest) => Some(base64::engine::general_purpose::STANDARD.encode(digest)),
            None => self.custom_metadata.get(CHECKSUM_METADATA_KEY).cloned(),
        }
    }
}

/// A stored object's body plus its metadata.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub info: ObjectInfo,
    /// The requested bytes (the whole object, or only the honored range).
    pub data: Bytes,
    /// The range descriptor the backend honored, if any.
    pub range: Option<StorageRange>,
}

/// Async object storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Read the object at `key`, optionally restricted to `range`.
    /// A missing object yields `Ok(None)`.
    fn get(
        &self,
        key: &str,
        range: Option<StorageRange>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>>;

    /// Read object metadata without the body.
    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<ObjectInfo>>> + Send + '_>>;

    /// Write `data` to `key`, fully replacing any previous object.
    fn put(
        &self,
        key: &str,
        data: Bytes,
        options: PutOptions,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>>;

    /// Delete the object at `key`. Deleting a missing object succeeds.
    fn delete(&self, key: &str)
        -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;

    /// Write one segment of an in-progress upload, returning its ETag.
    /// Writing the same `(upload_key, offset)` twice overwrites.
    fn put_segment(
        &self,
        upload_key: &str,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>>;

    /// Concatenate the segments at `offsets` (in order) into the object at
    /// `key`.
    fn assemble_segments(
        &self,
        key: &str,
        upload_key: &str,
        offsets: &[u64],
        options: PutOptions,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>>;

    /// Delete all segment data for an upload.
    fn delete_segments(
        &self,
        upload_key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>>;
}

// -- Shared helpers ------------------------------------------------------------

/// Compute the quoted MD5-hex ETag for a byte slice.
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Compute the composite ETag of assembled segments:
/// MD5 of the concatenated binary segment MD5s + `-{count}`.
pub fn compute_composite_etag(segment_md5s: &[u8], count: usize) -> String {
    let mut hasher = Md5::new();
    hasher.update(segment_md5s);
    format!("\"{}-{}\"", hex::encode(hasher.finalize()), count)
}

/// Raw MD5 digest of a byte slice.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex SHA-256 of a key, used to flatten keys containing `/` into a
/// single path component. One upload's segment area then never nests
/// inside another's.
pub fn hashed_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Verify `data` against an expected sha256 digest.
pub fn verify_sha256(key: &str, data: &[u8], expected: &[u8; 32]) -> StorageResult<()> {
    let actual: [u8; 32] = Sha256::digest(data).into();
    if &actual != expected {
        return Err(StorageError::ChecksumMismatch(key.to_string()));
    }
    Ok(())
}

/// Slice a full object body down to the requested range.
pub fn apply_range(
    key: &str,
    data: Bytes,
    range: Option<StorageRange>,
) -> StorageResult<(Bytes, Option<StorageRange>)> {
    match range {
        None => Ok((data, None)),
        Some(r) => {
            let spec = r.resolve(data.len() as u64).ok_or_else(|| {
                StorageError::InvalidRange(format!("{r:?} for {key} ({} bytes)", data.len()))
            })?;
            Ok((data.slice(spec.as_slice_range()), Some(r)))
        }
    }
}

/// Build the metadata record for a freshly written object.
pub fn object_info(key: &str, data: &[u8], etag: String, options: &PutOptions) -> ObjectInfo {
    ObjectInfo {
        key: key.to_string(),
        size: data.len() as u64,
        etag,
        content_type: if options.content_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            options.content_type.clone()
        },
        sha256: options.sha256.map(|d| d.to_vec()),
        custom_metadata: options.custom_metadata.clone(),
    }
}
