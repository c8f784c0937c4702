//! Upload lifecycle handlers: capability discovery, creation, append and
//! status (tus `OPTIONS`, `POST`, `PATCH`, `HEAD`).

use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;

use crate::errors::TusError;
use crate::tus::coordinator::Chunk;
use crate::tus::headers::{
    check_offset_content_type, check_tus_resumable, header_str, parse_declared_length,
    parse_u64_header, parse_upload_checksum, TUS_CHECKSUM_ALGORITHM, TUS_CHECKSUM_ALGORITHMS,
    TUS_EXTENSION, TUS_EXTENSIONS, TUS_MAX_SIZE, TUS_VERSION, TUS_VERSION_HEADER,
    UPLOAD_DEFER_LENGTH, UPLOAD_EXPIRES, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
};
use crate::tus::metadata::{parse_upload_metadata, upload_id_from_metadata};
use crate::tus::session::UploadStatus;
use crate::AppState;

/// Characters escaped when an upload id is placed in a `Location` URL.
/// `/` is kept so nested ids stay readable.
const LOCATION_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Unknown namespaces look exactly like unmatched routes.
pub(crate) fn check_namespace(state: &AppState, namespace: &str) -> Result<(), TusError> {
    if namespace == state.config.uploads.namespace {
        Ok(())
    } else {
        Err(TusError::NotFound)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TusError> {
    HeaderValue::from_str(value)
        .map_err(|_| TusError::Internal(format!("unencodable header value: {value}")))
}

/// Progress headers shared by creation, append and status responses.
fn progress_headers(status: &UploadStatus) -> Result<HeaderMap, TusError> {
    let mut headers = HeaderMap::new();
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(status.offset));
    if let Some(expires_at) = status.expires_at {
        headers.insert(
            UPLOAD_EXPIRES,
            header_value(&httpdate::fmt_http_date(expires_at))?,
        );
    }
    Ok(headers)
}

// -- OPTIONS ------------------------------------------------------------------

/// `OPTIONS /files/{namespace}[/{id}]` -- capability discovery.
#[utoipa::path(
    options,
    path = "/files/{namespace}",
    tag = "Upload",
    operation_id = "UploadOptions",
    params(("namespace" = String, Path, description = "Upload namespace")),
    responses(
        (status = 204, description = "Server capabilities in Tus-* headers"),
        (status = 404, description = "Unknown namespace")
    )
)]
pub async fn upload_options(state: Arc<AppState>, namespace: &str) -> Result<Response, TusError> {
    check_namespace(&state, namespace)?;
    let mut headers = HeaderMap::new();
    headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(
        TUS_CHECKSUM_ALGORITHM,
        HeaderValue::from_static(TUS_CHECKSUM_ALGORITHMS),
    );
    headers.insert(
        TUS_MAX_SIZE,
        HeaderValue::from(state.config.uploads.max_upload_length),
    );
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}

// -- POST ---------------------------------------------------------------------

/// `POST /files/{namespace}` -- create an upload, optionally with a first
/// chunk in the body.
///
/// The upload id is the `filename` entry of `Upload-Metadata`.
#[utoipa::path(
    post,
    path = "/files/{namespace}",
    tag = "Upload",
    operation_id = "CreateUpload",
    params(("namespace" = String, Path, description = "Upload namespace")),
    responses(
        (status = 201, description = "Upload created; Location names it"),
        (status = 400, description = "Malformed creation request"),
        (status = 401, description = "Missing or wrong Authorization"),
        (status = 409, description = "Upload or object already exists"),
        (status = 412, description = "Unsupported Tus-Resumable version"),
        (status = 415, description = "Body sent without the upload content type")
    )
)]
pub async fn create_upload(
    state: Arc<AppState>,
    namespace: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, TusError> {
    check_namespace(&state, namespace)?;
    check_tus_resumable(headers)?;

    let length = parse_declared_length(headers)?;
    let metadata = parse_upload_metadata(header_str(headers, UPLOAD_METADATA)?.unwrap_or(""))?;
    let id = upload_id_from_metadata(&metadata)?;

    let initial = if body.is_empty() {
        None
    } else {
        check_offset_content_type(headers)?;
        Some(Chunk {
            offset: 0,
            checksum: parse_upload_checksum(headers)?,
            data: body,
        })
    };

    let status = state.uploads.create(&id, metadata, length, initial).await?;
    debug!("created upload {} at offset {}", id, status.offset);

    let location = format!(
        "/files/{}/{}",
        namespace,
        utf8_percent_encode(&id, LOCATION_ESCAPES)
    );
    let mut response_headers = progress_headers(&status)?;
    response_headers.insert(header::LOCATION, header_value(&location)?);
    Ok((StatusCode::CREATED, response_headers).into_response())
}

// -- PATCH --------------------------------------------------------------------

/// `PATCH /files/{namespace}/{id}` -- append a chunk at `Upload-Offset`.
#[utoipa::path(
    patch,
    path = "/files/{namespace}/{id}",
    tag = "Upload",
    operation_id = "AppendUpload",
    params(
        ("namespace" = String, Path, description = "Upload namespace"),
        ("id" = String, Path, description = "Upload id"),
    ),
    responses(
        (status = 204, description = "Chunk applied; Upload-Offset is the new offset"),
        (status = 400, description = "Malformed request or capacity exceeded"),
        (status = 404, description = "Unknown upload"),
        (status = 409, description = "Upload-Offset does not match"),
        (status = 410, description = "Upload expired"),
        (status = 415, description = "Wrong Content-Type"),
        (status = 460, description = "Checksum mismatch")
    )
)]
pub async fn append_upload(
    state: Arc<AppState>,
    namespace: &str,
    id: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, TusError> {
    check_namespace(&state, namespace)?;
    check_tus_resumable(headers)?;
    check_offset_content_type(headers)?;

    let offset = parse_u64_header(headers, UPLOAD_OFFSET)?
        .ok_or_else(|| TusError::Protocol(format!("{UPLOAD_OFFSET} header required")))?;
    let checksum = parse_upload_checksum(headers)?;
    let length = parse_u64_header(headers, UPLOAD_LENGTH)?;

    let status = state
        .uploads
        .append(
            id,
            Chunk {
                offset,
                checksum,
                data: body,
            },
            length,
        )
        .await?;

    Ok((StatusCode::NO_CONTENT, progress_headers(&status)?).into_response())
}

// -- HEAD ---------------------------------------------------------------------

/// `HEAD /files/{namespace}/{id}` -- current offset and length.
#[utoipa::path(
    head,
    path = "/files/{namespace}/{id}",
    tag = "Upload",
    operation_id = "UploadStatus",
    params(
        ("namespace" = String, Path, description = "Upload namespace"),
        ("id" = String, Path, description = "Upload id"),
    ),
    responses(
        (status = 200, description = "Upload-Offset and Upload-Length of the upload"),
        (status = 404, description = "Unknown upload"),
        (status = 410, description = "Upload expired")
    )
)]
pub async fn upload_status(
    state: Arc<AppState>,
    namespace: &str,
    id: &str,
    headers: &HeaderMap,
) -> Result<Response, TusError> {
    check_namespace(&state, namespace)?;
    check_tus_resumable(headers)?;

    let status = state.uploads.status(id).await?;
    let mut response_headers = progress_headers(&status)?;
    match status.declared_length {
        Some(length) => {
            response_headers.insert(UPLOAD_LENGTH, HeaderValue::from(length));
        }
        None => {
            response_headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
        }
    }
    if let Some(metadata) = &status.metadata {
        response_headers.insert(UPLOAD_METADATA, header_value(metadata)?);
    }
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok((StatusCode::OK, response_headers).into_response())
}

