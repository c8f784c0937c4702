//! `Upload-Metadata` header parsing and upload id validation.
//!
//! The header is a comma-separated list of entries, each either `key` or
//! `key <base64 value>`. Parsing is all-or-nothing: one bad entry rejects
//! the whole header.

use base64::Engine;
use thiserror::Error;

/// Longest upload id accepted, in bytes.
pub const MAX_UPLOAD_ID_LEN: usize = 1024;

/// Metadata entry naming the upload; its value becomes the upload id.
pub const FILENAME_KEY: &str = "filename";

/// Metadata entries consulted, in order, for the stored content type.
pub const CONTENT_TYPE_KEYS: [&str; 2] = ["filetype", "contentType"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata entry has an empty key")]
    EmptyKey,

    #[error("metadata entry '{0}' has too many parts")]
    TooManyParts(String),

    #[error("metadata value for '{0}' is not valid base64")]
    InvalidBase64(String),

    #[error("metadata key '{0}' must be visible ASCII without commas")]
    InvalidKey(String),

    #[error("metadata key '{0}' appears more than once")]
    DuplicateKey(String),

    #[error("upload metadata must include a filename")]
    MissingFilename,

    #[error("invalid upload id: {0}")]
    InvalidId(String),

    #[error("path traversal detected")]
    PathTraversal,
}

/// Decoded upload metadata, in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    entries: Vec<(String, Vec<u8>)>,
}

impl UploadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Keys must survive the wire format unchanged, so
    /// whitespace, commas and non-ASCII are rejected, as is a repeated key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<(), MetadataError> {
        let key = key.into();
        if key.is_empty() {
            return Err(MetadataError::EmptyKey);
        }
        if !key.chars().all(|c| c.is_ascii_graphic() && c != ',') {
            return Err(MetadataError::InvalidKey(key.escape_debug().to_string()));
        }
        if self.get(&key).is_some() {
            return Err(MetadataError::DuplicateKey(key));
        }
        self.entries.push((key, value.into()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Value of `key` as UTF-8 text, if present and valid.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Content type carried by the metadata, if any.
    pub fn content_type(&self) -> Option<&str> {
        CONTENT_TYPE_KEYS
            .iter()
            .find_map(|key| self.get_str(key))
            .filter(|v| !v.is_empty())
    }

    /// Encode back into the `Upload-Metadata` wire format.
    pub fn encode(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k} {}", base64::engine::general_purpose::STANDARD.encode(v))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse an `Upload-Metadata` header value.
///
/// An empty or whitespace-only header yields empty metadata.
pub fn parse_upload_metadata(header: &str) -> Result<UploadMetadata, MetadataError> {
    let mut metadata = UploadMetadata::new();
    if header.trim().is_empty() {
        return Ok(metadata);
    }
    for entry in header.split(',') {
        let mut parts = entry.split_whitespace();
        let key = parts.next().ok_or(MetadataError::EmptyKey)?;
        let value = match parts.next() {
            None => Vec::new(),
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| MetadataError::InvalidBase64(key.to_string()))?,
        };
        if parts.next().is_some() {
            return Err(MetadataError::TooManyParts(key.to_string()));
        }
        metadata.insert(key, value)?;
    }
    Ok(metadata)
}

/// Check that an upload id is safe to use as a storage key.
pub fn validate_upload_id(id: &str) -> Result<(), MetadataError> {
    if id.contains("..") {
        return Err(MetadataError::PathTraversal);
    }
    if id.is_empty() {
        return Err(MetadataError::InvalidId("empty".into()));
    }
    if id.len() > MAX_UPLOAD_ID_LEN {
        return Err(MetadataError::InvalidId(format!(
            "longer than {MAX_UPLOAD_ID_LEN} bytes"
        )));
    }
    if id.starts_with('/') || id.starts_with('.') {
        return Err(MetadataError::InvalidId(id.to_string()));
    }
    if id.chars().any(|c| c.is_control() || c == '\\') {
        return Err(MetadataError::InvalidId(id.escape_debug().to_string()));
    }
    Ok(())
}

/// Derive the upload id from creation metadata (its `filename` entry).
pub fn upload_id_from_metadata(metadata: &UploadMetadata) -> Result<String, MetadataError> {
    let id = metadata
        .get(FILENAME_KEY)
        .ok_or(MetadataError::MissingFilename)?;
    let id = std::str::from_utf8(id)
        .map_err(|_| MetadataError::InvalidId("filename is not UTF-8".into()))?;
    validate_upload_id(id)?;
    Ok(id.to_string())
}
