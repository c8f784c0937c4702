//! tus 1.0.0 header names, capability values and typed header parsing.

use axum::http::HeaderMap;
use base64::Engine;

use crate::errors::TusError;

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str =
    "creation,creation-defer-length,creation-with-upload,expiration,checksum";
pub const TUS_CHECKSUM_ALGORITHMS: &str = "sha256";

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION_HEADER: &str = "tus-version";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const TUS_MAX_SIZE: &str = "tus-max-size";
pub const TUS_CHECKSUM_ALGORITHM: &str = "tus-checksum-algorithm";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_DEFER_LENGTH: &str = "upload-defer-length";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_CHECKSUM: &str = "upload-checksum";
pub const UPLOAD_EXPIRES: &str = "upload-expires";

/// Carries the base64 sha256 of a stored object.
pub const X_CHECKSUM_SHA256: &str = "x-checksum-sha256";

/// Content type required on upload bodies.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const ALLOWED_METHODS: &str = "GET, POST, HEAD, PATCH, OPTIONS";
pub const ALLOWED_HEADERS: &str = "Authorization, Content-Type, Location, Tus-Extension, \
     Tus-Max-Size, Tus-Resumable, Tus-Version, Upload-Defer-Length, Upload-Length, \
     Upload-Metadata, Upload-Offset, Upload-Checksum, X-HTTP-Method-Override, \
     X-Requested-With, Range";
pub const EXPOSED_HEADERS: &str = "Location, Upload-Offset, Upload-Length, \
     Upload-Defer-Length, Upload-Metadata, Upload-Expires, Tus-Version, Tus-Resumable, \
     Tus-Max-Size, Tus-Extension, Tus-Checksum-Algorithm, Content-Range, Accept-Ranges, \
     ETag, X-Checksum-Sha256";

/// Declared length of a new upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredLength {
    Known(u64),
    Deferred,
}

/// A client-supplied chunk checksum (`Upload-Checksum`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkChecksum {
    pub sha256: [u8; 32],
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, TusError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.trim()))
            .map_err(|_| TusError::Protocol(format!("{name} header is not valid ASCII"))),
    }
}

/// Parse a non-negative integer header, if present.
pub fn parse_u64_header(headers: &HeaderMap, name: &str) -> Result<Option<u64>, TusError> {
    match header_str(headers, name)? {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| TusError::Protocol(format!("invalid {name} header: {raw}"))),
    }
}

/// Resolve `Upload-Length` / `Upload-Defer-Length` on a creation request.
pub fn parse_declared_length(headers: &HeaderMap) -> Result<DeclaredLength, TusError> {
    let length = parse_u64_header(headers, UPLOAD_LENGTH)?;
    let deferred = match header_str(headers, UPLOAD_DEFER_LENGTH)? {
        None => false,
        Some("1") => true,
        Some(other) => {
            return Err(TusError::Protocol(format!(
                "invalid {UPLOAD_DEFER_LENGTH} header: {other}"
            )))
        }
    };
    match (length, deferred) {
        (Some(_), true) => Err(TusError::Protocol(format!(
            "{UPLOAD_LENGTH} and {UPLOAD_DEFER_LENGTH} are mutually exclusive"
        ))),
        (Some(len), false) => Ok(DeclaredLength::Known(len)),
        (None, true) => Ok(DeclaredLength::Deferred),
        (None, false) => Err(TusError::Protocol(format!(
            "{UPLOAD_LENGTH} or {UPLOAD_DEFER_LENGTH} header required"
        ))),
    }
}

/// Parse `Upload-Checksum: sha256 <base64 digest>`, if present.
pub fn parse_upload_checksum(headers: &HeaderMap) -> Result<Option<ChunkChecksum>, TusError> {
    let Some(raw) = header_str(headers, UPLOAD_CHECKSUM)? else {
        return Ok(None);
    };
    let (algorithm, encoded) = raw
        .split_once(' ')
        .ok_or_else(|| TusError::Protocol(format!("invalid {UPLOAD_CHECKSUM} header")))?;
    if !algorithm.eq_ignore_ascii_case("sha256") {
        return Err(TusError::Protocol(format!(
            "unsupported checksum algorithm: {algorithm}"
        )));
    }
    let digest = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| TusError::Protocol(format!("invalid {UPLOAD_CHECKSUM} digest")))?;
    let sha256: [u8; 32] = digest
        .try_into()
        .map_err(|_| TusError::Protocol(format!("invalid {UPLOAD_CHECKSUM} digest length")))?;
    Ok(Some(ChunkChecksum { sha256 }))
}

/// Reject requests that name a protocol version other than ours.
/// A missing `Tus-Resumable` header is tolerated.
pub fn check_tus_resumable(headers: &HeaderMap) -> Result<(), TusError> {
    match header_str(headers, TUS_RESUMABLE)? {
        None => Ok(()),
        Some(TUS_VERSION) => Ok(()),
        Some(other) => Err(TusError::UnsupportedVersion(other.to_string())),
    }
}

/// Require the tus upload body content type.
pub fn check_offset_content_type(headers: &HeaderMap) -> Result<(), TusError> {
    let content_type = header_str(headers, "content-type")?.unwrap_or("");
    let essence = content_type.split(';').next().unwrap_or("").trim();
    if essence.eq_ignore_ascii_case(OFFSET_OCTET_STREAM) {
        Ok(())
    } else {
        Err(TusError::UnsupportedMediaType)
    }
}
