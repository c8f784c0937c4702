//! Read-back of completed uploads.

use std::sync::Arc;

use axum::http::{header, HeaderMap, Uri};
use axum::response::{IntoResponse, Response};

use super::upload::check_namespace;
use crate::errors::TusError;
use crate::AppState;

/// `GET /files/{namespace}/{id}` -- serve a completed upload.
///
/// Honors a single `Range: bytes=...` header with a 206. Full responses
/// are cached at the edge keyed by method and URI.
#[utoipa::path(
    get,
    path = "/files/{namespace}/{id}",
    tag = "Object",
    operation_id = "GetObject",
    params(
        ("namespace" = String, Path, description = "Upload namespace"),
        ("id" = String, Path, description = "Upload id"),
    ),
    responses(
        (status = 200, description = "Object data"),
        (status = 206, description = "Partial content (range request)"),
        (status = 404, description = "Object not found"),
        (status = 416, description = "Range not satisfiable"),
        (status = 500, description = "Internal error")
    )
)]
pub async fn get_object(
    state: Arc<AppState>,
    namespace: &str,
    id: &str,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Response, TusError> {
    check_namespace(&state, namespace)?;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let cache_key = format!("GET {uri}");
    let response = state.reader.read(&cache_key, id, range).await?;
    Ok(response.into_response())
}
