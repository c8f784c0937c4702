//! Read path for completed uploads.
//!
//! Serves stored objects with byte-range support. Full responses are
//! written to the edge cache in the background once built; partial
//! responses never are. A cached full body also answers later range
//! requests for the same object.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CachedResponse, EdgeCache};
use crate::errors::TusError;
use crate::metrics::{BYTES_SENT_TOTAL, CACHE_LOOKUPS_TOTAL};
use crate::range::{parse_range_header, StorageRange};
use crate::storage::backend::{ObjectInfo, StorageBackend};
use crate::storage::error::StorageError;
use crate::tus::headers::X_CHECKSUM_SHA256;
use crate::tus::metadata::validate_upload_id;

/// A built read response.
#[derive(Debug, Clone)]
pub struct ObjectResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ObjectResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn to_cached(&self) -> CachedResponse {
        CachedResponse {
            status: self.status.as_u16(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    fn from_cached(cached: CachedResponse) -> Self {
        Self {
            status: StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
            headers: cached.headers,
            body: cached.body,
        }
    }
}

impl IntoResponse for ObjectResponse {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("dropping invalid response header {}", name),
            }
        }
        (self.status, headers, Body::from(self.body)).into_response()
    }
}

/// Serves stored objects, consulting the edge cache first.
pub struct ObjectReader {
    store: Arc<dyn StorageBackend>,
    cache: Option<Arc<dyn EdgeCache>>,
}

impl ObjectReader {
    pub fn new(store: Arc<dyn StorageBackend>, cache: Option<Arc<dyn EdgeCache>>) -> Self {
        Self { store, cache }
    }

    /// Read object `id`. `cache_key` identifies the canonical request
    /// (method and URL); `range_header` is the raw `Range` value, if any.
    pub async fn read(
        &self,
        cache_key: &str,
        id: &str,
        range_header: Option<&str>,
    ) -> Result<ObjectResponse, TusError> {
        validate_upload_id(id)?;
        // Malformed range headers are ignored and the full object served.
        let range = range_header.and_then(parse_range_header);

        if let Some(cache) = &self.cache {
            match cache.get(cache_key).await {
                Some(hit) => {
                    counter!(CACHE_LOOKUPS_TOTAL, "result" => "hit").increment(1);
                    debug!("edge cache hit for {}", cache_key);
                    let response = ObjectResponse::from_cached(hit);
                    let response = match range {
                        Some(range) => slice_cached(response, range)?,
                        None => response,
                    };
                    counter!(BYTES_SENT_TOTAL).increment(response.body.len() as u64);
                    return Ok(response);
                }
                None => {
                    counter!(CACHE_LOOKUPS_TOTAL, "result" => "miss").increment(1);
                }
            }
        }

        let object = match self.store.get(id, range).await {
            Ok(Some(object)) => object,
            Ok(None) => return Err(TusError::NotFound),
            Err(StorageError::InvalidRange(_)) => {
                let total_size = match self.store.head(id).await? {
                    Some(info) => info.size,
                    None => return Err(TusError::NotFound),
                };
                return Err(TusError::RangeNotSatisfiable { total_size });
            }
            Err(e) => return Err(e.into()),
        };

        let mut headers = object_headers(&object.info);
        let honored = object
            .range
            .and_then(|r| r.resolve(object.info.size))
            .filter(|_| range.is_some());
        counter!(BYTES_SENT_TOTAL).increment(object.data.len() as u64);

        if let Some(spec) = honored {
            headers.push((
                header::CONTENT_RANGE.to_string(),
                spec.content_range(),
            ));
            return Ok(ObjectResponse {
                status: StatusCode::PARTIAL_CONTENT,
                headers,
                body: object.data,
            });
        }

        let response = ObjectResponse {
            status: StatusCode::OK,
            headers,
            body: object.data,
        };
        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let key = cache_key.to_string();
            let cached = response.to_cached();
            tokio::spawn(async move {
                cache.put(&key, cached).await;
            });
        }
        Ok(response)
    }
}

/// Headers describing a stored object.
fn object_headers(info: &ObjectInfo) -> Vec<(String, String)> {
    let mut headers = vec![
        (header::CONTENT_TYPE.to_string(), info.content_type.clone()),
        (header::ETAG.to_string(), info.etag.clone()),
        (header::ACCEPT_RANGES.to_string(), "bytes".to_string()),
    ];
    if let Some(checksum) = info.sha256_base64() {
        headers.push((X_CHECKSUM_SHA256.to_string(), checksum));
    }
    headers
}

/// Cut a cached full response down to `range`.
fn slice_cached(response: ObjectResponse, range: StorageRange) -> Result<ObjectResponse, TusError> {
    let total_size = response.body.len() as u64;
    let spec = range
        .resolve(total_size)
        .ok_or(TusError::RangeNotSatisfiable { total_size })?;
    let mut headers: Vec<(String, String)> = response
        .headers
        .into_iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case(header::CONTENT_RANGE.as_str()))
        .collect();
    headers.push((header::CONTENT_RANGE.to_string(), spec.content_range()));
    Ok(ObjectResponse {
        status: StatusCode::PARTIAL_CONTENT,
        headers,
        body: response.body.slice(spec.as_slice_range()),
    })
}
