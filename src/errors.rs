//! Upload protocol error types.
//!
//! Every variant maps to one HTTP status.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(TusError::Conflict { .. })`; the body is always
//! `{"error": "<message>"}`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::storage::error::StorageError;
use crate::tus::headers::TUS_VERSION;
use crate::tus::metadata::MetadataError;

/// Status used for checksum mismatches; there is no standard code for it.
pub const CHECKSUM_MISMATCH_STATUS: u16 = 460;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

#[derive(Debug, Error)]
pub enum TusError {
    /// Malformed creation or append request.
    #[error("{0}")]
    Protocol(String),

    /// Upload metadata could not be parsed, or named an unusable id.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// The client's offset does not match the upload's confirmed offset.
    #[error("Upload-Offset {received} does not match current offset {expected}")]
    Conflict { expected: u64, received: u64 },

    /// The upload (or its stored object) already exists.
    #[error("upload {0} already exists")]
    AlreadyExists(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("Not Found")]
    NotFound,

    #[error("upload expired")]
    Expired,

    #[error("{0}")]
    CapacityExceeded(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("unsupported Tus-Resumable version {0}")]
    UnsupportedVersion(String),

    #[error("PATCH requests must use Content-Type application/offset+octet-stream")]
    UnsupportedMediaType,

    /// The request body is larger than any upload may be.
    #[error("request body exceeds the maximum upload length")]
    PayloadTooLarge,

    #[error("The requested range is not satisfiable")]
    RangeNotSatisfiable { total_size: u64 },

    /// The per-call deadline passed. The storage effect may still land.
    #[error("upload call timed out")]
    Timeout,

    /// A storage failure that survived the retry policy.
    #[error("storage failure: {0}")]
    Storage(StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for TusError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ChecksumMismatch(_) => TusError::ChecksumMismatch,
            StorageError::InvalidKey(key) => {
                TusError::Metadata(MetadataError::InvalidId(key))
            }
            other => TusError::Storage(other),
        }
    }
}

impl TusError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TusError::Protocol(_) => StatusCode::BAD_REQUEST,
            TusError::Metadata(_) => StatusCode::BAD_REQUEST,
            TusError::Conflict { .. } => StatusCode::CONFLICT,
            TusError::AlreadyExists(_) => StatusCode::CONFLICT,
            TusError::ChecksumMismatch => StatusCode::from_u16(CHECKSUM_MISMATCH_STATUS)
                .unwrap_or(StatusCode::BAD_REQUEST),
            TusError::NotFound => StatusCode::NOT_FOUND,
            TusError::Expired => StatusCode::GONE,
            TusError::CapacityExceeded(_) => StatusCode::BAD_REQUEST,
            TusError::Unauthorized => StatusCode::UNAUTHORIZED,
            TusError::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            TusError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TusError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            TusError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            TusError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            TusError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TusError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected with {}: {}", status, self);
        }

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", id);
        }
        match &self {
            TusError::UnsupportedVersion(_) => {
                headers.insert("tus-version", HeaderValue::from_static(TUS_VERSION));
            }
            TusError::RangeNotSatisfiable { total_size } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total_size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            _ => {}
        }
        response
    }
}
