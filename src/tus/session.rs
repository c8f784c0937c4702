//! In-memory state of one upload.

use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};

use super::metadata::UploadMetadata;

/// Lifecycle of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Creating,
    Receiving,
    Completed,
    Expired,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Creating => "creating",
            UploadState::Receiving => "receiving",
            UploadState::Completed => "completed",
            UploadState::Expired => "expired",
        }
    }
}

/// Snapshot of an upload returned by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub id: String,
    pub offset: u64,
    /// `None` while the length is deferred.
    pub declared_length: Option<u64>,
    pub state: UploadState,
    /// When the upload will expire for inactivity; `None` once completed.
    pub expires_at: Option<SystemTime>,
    /// Creation metadata in wire format, when any was supplied.
    pub metadata: Option<String>,
}

/// One upload, owned by the coordinator slot for its id.
#[derive(Clone)]
pub struct UploadSession {
    pub id: String,
    pub declared_length: Option<u64>,
    pub offset: u64,
    pub metadata: UploadMetadata,
    /// Running sha256 of every accepted byte.
    pub hasher: Sha256,
    pub created_at: SystemTime,
    pub last_activity_at: SystemTime,
    pub state: UploadState,
    /// Offsets of the segments written so far, ascending.
    pub segments: Vec<u64>,
}

impl UploadSession {
    pub fn new(
        id: String,
        declared_length: Option<u64>,
        metadata: UploadMetadata,
        now: SystemTime,
    ) -> Self {
        Self {
            id,
            declared_length,
            offset: 0,
            metadata,
            hasher: Sha256::new(),
            created_at: now,
            last_activity_at: now,
            state: UploadState::Creating,
            segments: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == UploadState::Completed
    }

    /// Whether the upload has been idle past `ttl` without completing.
    pub fn is_expired(&self, now: SystemTime, ttl: Duration) -> bool {
        if self.is_completed() {
            return false;
        }
        self.state == UploadState::Expired || self.idle_for(now) > ttl
    }

    /// Time since the last accepted mutation.
    pub fn idle_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_activity_at)
            .unwrap_or(Duration::ZERO)
    }

    pub fn expires_at(&self, ttl: Duration) -> Option<SystemTime> {
        if self.is_completed() {
            None
        } else {
            Some(self.last_activity_at + ttl)
        }
    }

    /// MIME type for the finished object.
    pub fn content_type(&self) -> String {
        self.metadata
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string()
    }

    pub fn status(&self, ttl: Duration) -> UploadStatus {
        UploadStatus {
            id: self.id.clone(),
            offset: self.offset,
            declared_length: self.declared_length,
            state: self.state,
            expires_at: self.expires_at(ttl),
            metadata: (!self.metadata.is_empty()).then(|| self.metadata.encode()),
        }
    }
}
