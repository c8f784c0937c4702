//! AWS S3 storage backend.
//!
//! Stores finished uploads as objects in a single S3 bucket, and in-flight
//! upload segments as temporary objects next to them.
//!
//! Key mapping:
//!   Objects:   `{prefix}{key}`
//!   Segments:  `{prefix}.segments/{upload_key}/{offset:020}`
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.).

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ChecksumMode;
use aws_sdk_s3::Client;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

use super::backend::{
    compute_composite_etag, compute_etag, hashed_key, verify_sha256, ObjectInfo, PutOptions,
    StorageBackend, StoredObject,
};
use super::error::{StorageError, StorageResult};
use crate::range::StorageRange;

/// S3 refuses multipart parts below this size, except for the last one.
const MIN_MULTIPART_PART_SIZE: i64 = 5 * 1024 * 1024;

/// Backend that stores objects in an AWS S3 bucket.
pub struct AwsBackend {
    /// AWS S3 SDK client.
    client: Client,
    /// The upstream S3 bucket name.
    bucket: String,
    /// Key prefix for all objects in the upstream bucket.
    prefix: String,
}

impl AwsBackend {
    /// Create a new AWS backend.
    ///
    /// Loads AWS credentials from the default credential chain
    /// (environment variables, `~/.aws/credentials`, IAM role, etc.)
    /// unless explicit keys are given.
    pub async fn new(
        bucket: String,
        region: String,
        prefix: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ref ak), Some(ref sk)) = (&access_key_id, &secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "tusstore-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "AWS backend initialized: bucket={} prefix='{}'",
            bucket, prefix
        );

        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    fn s3_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn segment_prefix(&self, upload_key: &str) -> String {
        segment_prefix(&self.prefix, upload_key)
    }

    fn segment_key(&self, upload_key: &str, offset: u64) -> String {
        segment_key(&self.prefix, upload_key, offset)
    }

    /// Read a whole object body (used for segments during assembly).
    async fn read_body(&self, s3_key: &str) -> StorageResult<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(s3_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("get_object", e))?;
        collect_body(resp.body).await
    }

    /// Sizes of the stored segments of an upload, keyed by S3 key.
    async fn list_segments(&self, upload_key: &str) -> StorageResult<HashMap<String, i64>> {
        let prefix = self.segment_prefix(upload_key);
        let mut sizes = HashMap::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| classify_sdk_error("list_objects_v2", e))?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    sizes.insert(key.to_string(), obj.size().unwrap_or(0));
                }
            }
            if resp.is_truncated() == Some(true) {
                continuation_token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(sizes)
    }

    /// Assemble by downloading every segment and writing one object.
    /// Used when segments are too small for S3 multipart copy.
    async fn assemble_by_download(
        &self,
        key: &str,
        segment_keys: &[String],
        options: PutOptions,
    ) -> StorageResult<ObjectInfo> {
        let mut combined = Vec::new();
        for segment_key in segment_keys {
            combined.extend_from_slice(&self.read_body(segment_key).await?);
        }
        let data = Bytes::from(combined);
        if let Some(expected) = &options.sha256 {
            verify_sha256(key, &data, expected)?;
        }
        let mut info = self.put_object(key, data, &options).await?;
        // Keep the assembled-object ETag shape regardless of the write path.
        info.etag = format!("\"{}-{}\"", info.etag.trim_matches('"'), segment_keys.len());
        Ok(info)
    }

    /// Server-side assembly through an S3 multipart upload.
    async fn assemble_by_multipart_copy(
        &self,
        key: &str,
        segment_keys: &[String],
        options: &PutOptions,
    ) -> StorageResult<ObjectInfo> {
        let final_key = self.s3_key(key);
        let create_resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&final_key)
            .content_type(content_type_or_default(options))
            .set_metadata(Some(to_hash_map(&options.custom_metadata)))
            .send()
            .await
            .map_err(|e| classify_sdk_error("create_multipart_upload", e))?;

        let aws_upload_id = create_resp
            .upload_id()
            .ok_or_else(|| StorageError::Backend("AWS did not return upload ID".into()))?
            .to_string();

        match self
            .copy_parts(&final_key, &aws_upload_id, segment_keys)
            .await
        {
            Ok((etag, size)) => Ok(ObjectInfo {
                key: key.to_string(),
                size,
                etag,
                content_type: content_type_or_default(options),
                sha256: None,
                custom_metadata: options.custom_metadata.clone(),
            }),
            Err(e) => {
                warn!(
                    "Aborting AWS multipart upload {} due to error: {}",
                    aws_upload_id, e
                );
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&final_key)
                    .upload_id(&aws_upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "Failed to abort AWS multipart upload: {}",
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(e)
            }
        }
    }

    async fn copy_parts(
        &self,
        final_key: &str,
        aws_upload_id: &str,
        segment_keys: &[String],
    ) -> StorageResult<(String, u64)> {
        use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};

        let mut completed_parts = Vec::with_capacity(segment_keys.len());
        let mut combined_md5_bytes: Vec<u8> = Vec::new();

        for (idx, segment_key) in segment_keys.iter().enumerate() {
            let copy_source = format!("{}/{}", self.bucket, segment_key);
            let part_number = (idx + 1) as i32;

            let etag = match self
                .client
                .upload_part_copy()
                .bucket(&self.bucket)
                .key(final_key)
                .upload_id(aws_upload_id)
                .part_number(part_number)
                .copy_source(&copy_source)
                .send()
                .await
            {
                Ok(copy_resp) => copy_resp
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .unwrap_or("")
                    .to_string(),
                Err(e) if e.code() == Some("EntityTooSmall") => {
                    debug!(
                        "EntityTooSmall for segment {}, falling back to download+upload",
                        segment_key
                    );
                    let body = self.read_body(segment_key).await?;
                    let upload_resp = self
                        .client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(final_key)
                        .upload_id(aws_upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(body))
                        .send()
                        .await
                        .map_err(|e| classify_sdk_error("upload_part", e))?;
                    upload_resp.e_tag().unwrap_or("").to_string()
                }
                Err(e) => return Err(classify_sdk_error("upload_part_copy", e)),
            };

            if let Ok(md5) = hex::decode(etag.trim_matches('"')) {
                combined_md5_bytes.extend_from_slice(&md5);
            }
            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(&etag)
                    .part_number(part_number)
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(final_key)
            .upload_id(aws_upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete_multipart_upload", e))?;

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(final_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("head_object", e))?;
        let size = head.content_length().unwrap_or(0).max(0) as u64;

        Ok((
            compute_composite_etag(&combined_md5_bytes, segment_keys.len()),
            size,
        ))
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StorageResult<ObjectInfo> {
        let s3_key = self.s3_key(key);

        // Compute MD5 locally for a consistent ETag
        // (AWS may return a different ETag with server-side encryption).
        let etag = compute_etag(&data);
        let size = data.len() as u64;

        debug!("AWS put_object: bucket={} key={}", self.bucket, s3_key);

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .content_type(content_type_or_default(options))
            .set_metadata(Some(to_hash_map(&options.custom_metadata)))
            .body(ByteStream::from(data));
        if let Some(digest) = &options.sha256 {
            req = req.checksum_sha256(base64::engine::general_purpose::STANDARD.encode(digest));
        }
        req.send()
            .await
            .map_err(|e| classify_sdk_error("put_object", e))?;

        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            etag,
            content_type: content_type_or_default(options),
            sha256: options.sha256.map(|d| d.to_vec()),
            custom_metadata: options.custom_metadata.clone(),
        })
    }
}

/// Map an SDK failure onto [`StorageError`] so the retry layer can
/// classify it.
fn classify_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
{
    let message = format!("AWS S3 {context}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) => return StorageError::Timeout(message),
        SdkError::DispatchFailure(failure) => {
            if failure.is_timeout() {
                return StorageError::Timeout(message);
            }
            return StorageError::Connection(message);
        }
        _ => {}
    }
    let status = err.raw_response().map(|r| r.status().as_u16());
    match status {
        Some(404) => StorageError::NotFound(message),
        Some(412) => StorageError::PreconditionFailed(message),
        Some(401) | Some(403) => StorageError::Unauthorized(message),
        Some(416) => StorageError::InvalidRange(message),
        Some(status) => StorageError::Server { status, message },
        None => StorageError::Backend(message),
    }
}

async fn collect_body(body: ByteStream) -> StorageResult<Bytes> {
    body.collect()
        .await
        .map(|aggregated| aggregated.into_bytes())
        .map_err(|e| StorageError::Connection(format!("AWS S3 body read: {e}")))
}

/// Header value for a range descriptor, in S3's `Range` syntax.
fn range_header(range: &StorageRange) -> String {
    match *range {
        StorageRange::Offset {
            offset,
            length: Some(len),
        } => format!("bytes={}-{}", offset, offset + len.saturating_sub(1)),
        StorageRange::Offset {
            offset,
            length: None,
        } => format!("bytes={offset}-"),
        StorageRange::Suffix(n) => format!("bytes=-{n}"),
    }
}

/// Total object size from a `Content-Range` value like `bytes 0-9/100`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn content_type_or_default(options: &PutOptions) -> String {
    if options.content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        options.content_type.clone()
    }
}

fn to_hash_map(metadata: &BTreeMap<String, String>) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn decode_checksum(value: Option<&str>) -> Option<Vec<u8>> {
    // Composite checksums of multipart objects look like "<b64>-<n>" and are
    // not a digest of the whole object.
    let value = value?;
    if value.contains('-') {
        return None;
    }
    base64::engine::general_purpose::STANDARD.decode(value).ok()
}

impl StorageBackend for AwsBackend {
    fn get(
        &self,
        key: &str,
        range: Option<StorageRange>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("AWS get_object: bucket={} key={}", self.bucket, s3_key);

            let mut req = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .checksum_mode(ChecksumMode::Enabled);
            if let Some(r) = &range {
                req = req.range(range_header(r));
            }
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => match classify_sdk_error("get_object", e) {
                    StorageError::NotFound(_) => return Ok(None),
                    other => return Err(other),
                },
            };

            let size = resp
                .content_range()
                .and_then(total_from_content_range)
                .unwrap_or_else(|| resp.content_length().unwrap_or(0).max(0) as u64);
            let info = ObjectInfo {
                key: key.clone(),
                size,
                etag: resp.e_tag().unwrap_or("").to_string(),
                content_type: resp
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                sha256: decode_checksum(resp.checksum_sha256()),
                custom_metadata: resp
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            };
            let data = collect_body(resp.body).await?;
            Ok(Some(StoredObject { info, data, range }))
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<ObjectInfo>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("AWS head_object: bucket={} key={}", self.bucket, s3_key);

            let resp = match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .checksum_mode(ChecksumMode::Enabled)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => match classify_sdk_error("head_object", e) {
                    StorageError::NotFound(_) => return Ok(None),
                    other => return Err(other),
                },
            };

            Ok(Some(ObjectInfo {
                key,
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                etag: resp.e_tag().unwrap_or("").to_string(),
                content_type: resp
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                sha256: decode_checksum(resp.checksum_sha256()),
                custom_metadata: resp
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            }))
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
            // Fail before the round trip; S3 would reject it as well.
            if let Some(expected) = &options.sha256 {
                let actual: [u8; 32] = Sha256::digest(&data).into();
                if &actual != expected {
                    return Err(StorageError::ChecksumMismatch(key));
                }
            }
            self.put_object(&key, data, &options).await
        })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("AWS delete_object: bucket={} key={}", self.bucket, s3_key);

            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| classify_sdk_error("delete_object", e))?;

            Ok(())
        })
    }

    fn put_segment(
        &self,
        upload_key: &str,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let segment_key = self.segment_key(upload_key, offset);
        Box::pin(async move {
            let etag = compute_etag(&data);

            debug!(
                "AWS put_segment: bucket={} key={}",
                self.bucket, segment_key
            );

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&segment_key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| classify_sdk_error("put_segment", e))?;

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
        let segment_keys: Vec<String> = offsets
            .iter()
            .map(|offset| self.segment_key(&upload_key, *offset))
            .collect();
        Box::pin(async move {
            debug!(
                "AWS assemble_segments: bucket={} key={} segments={}",
                self.bucket,
                key,
                segment_keys.len()
            );

            let sizes = self.list_segments(&upload_key).await?;
            let mut all_large = true;
            for (idx, segment_key) in segment_keys.iter().enumerate() {
                let size = sizes.get(segment_key).ok_or_else(|| {
                    StorageError::NotFound(format!("segment {segment_key}"))
                })?;
                if idx + 1 < segment_keys.len() && *size < MIN_MULTIPART_PART_SIZE {
                    all_large = false;
                }
            }

            // Multipart copy cannot verify the digest, so it is only used
            // when the caller did not ask for verification.
            if all_large && options.sha256.is_none() {
                self.assemble_by_multipart_copy(&key, &segment_keys, &options)
                    .await
            } else {
                self.assemble_by_download(&key, &segment_keys, options)
                    .await
            }
        })
    }

    fn delete_segments(
        &self,
        upload_key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let upload_key = upload_key.to_string();
        Box::pin(async move {
            debug!(
                "AWS delete_segments: bucket={} upload={}",
                self.bucket, upload_key
            );

            let keys: Vec<String> = self.list_segments(&upload_key).await?.into_keys().collect();

            // Batch delete, at most 1000 keys per call.
            for batch in keys.chunks(1000) {
                let objects: Vec<aws_sdk_s3::types::ObjectIdentifier> = batch
                    .iter()
                    .filter_map(|k| {
                        aws_sdk_s3::types::ObjectIdentifier::builder()
                            .key(k)
                            .build()
                            .ok()
                    })
                    .collect();
                if objects.is_empty() {
                    continue;
                }
                let delete = aws_sdk_s3::types::Delete::builder()
                    .set_objects(Some(objects))
                    .quiet(true)
                    .build()
                    .map_err(|e| StorageError::Backend(format!("delete_objects build: {e}")))?;

                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error("delete_objects", e))?;
            }

            Ok(())
        })
    }
}

/// Listing prefix of one upload's segments. The upload key is hashed so
/// that ids like `a` and `a/b` get disjoint prefixes.
fn segment_prefix(prefix: &str, upload_key: &str) -> String {
    format!("{}.segments/{}/", prefix, hashed_key(upload_key))
}

fn segment_key(prefix: &str, upload_key: &str, offset: u64) -> String {
    format!("{}{offset:020}", segment_prefix(prefix, upload_key))
}

// -- Tests -------------------------------------------------------------------
