//! End-to-end tests driving the router through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::Engine;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use tusstore::config::Config;
use tusstore::storage::memory::MemoryBackend;
use tusstore::AppState;

const OFFSET_STREAM: &str = "application/offset+octet-stream";

fn test_app(token: Option<&str>) -> Router {
    let mut config = Config::default();
    config.uploads.max_upload_length = 1024 * 1024;
    config.auth.token = token.map(String::from);
    let state = Arc::new(AppState::new(config, Arc::new(MemoryBackend::default())));
    tusstore::server::app(state)
}

fn b64(value: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(value)
}

fn metadata_for(filename: &str) -> String {
    format!("filename {},filetype {}", b64(filename), b64("text/plain"))
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn error_message(response: Response) -> String {
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    json["error"].as_str().unwrap_or_default().to_string()
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn create_request(filename: &str, length: u64) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("tus-resumable", "1.0.0")
        .header("upload-length", length.to_string())
        .header("upload-metadata", metadata_for(filename))
        .body(Body::empty())
        .unwrap()
}

fn patch_request(path: &str, offset: u64, data: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method(Method::PATCH)
        .uri(path)
        .header("tus-resumable", "1.0.0")
        .header("content-type", OFFSET_STREAM)
        .header("upload-offset", offset.to_string())
        .body(Body::from(data))
        .unwrap()
}

fn head_request(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::HEAD)
        .uri(path)
        .header("tus-resumable", "1.0.0")
        .body(Body::empty())
        .unwrap()
}

fn get_request(path: &str, range: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(path);
    if let Some(range) = range {
        builder = builder.header("range", range);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_options_advertises_capabilities() {
    let app = test_app(None);
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/files/attachments")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "tus-version"), Some("1.0.0"));
    assert_eq!(header(&response, "tus-resumable"), Some("1.0.0"));
    assert_eq!(header(&response, "tus-max-size"), Some("1048576"));
    assert_eq!(header(&response, "tus-checksum-algorithm"), Some("sha256"));
    assert!(header(&response, "tus-extension")
        .unwrap()
        .contains("creation-defer-length"));
    assert_eq!(header(&response, "access-control-allow-origin"), Some("*"));
    assert!(header(&response, "access-control-expose-headers")
        .unwrap()
        .contains("Upload-Offset"));
}

#[tokio::test]
async fn test_chunked_upload_then_read_back() {
    let app = test_app(None);

    let response = send(&app, create_request("report.txt", 11)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header(&response, "location"),
        Some("/files/attachments/report.txt")
    );
    assert_eq!(header(&response, "upload-offset"), Some("0"));
    assert!(header(&response, "upload-expires").is_some());

    let path = "/files/attachments/report.txt";
    let response = send(&app, patch_request(path, 0, b"hello ")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("6"));

    let response = send(&app, head_request(path)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "upload-offset"), Some("6"));
    assert_eq!(header(&response, "upload-length"), Some("11"));
    assert_eq!(header(&response, "cache-control"), Some("no-store"));
    assert!(header(&response, "upload-metadata").is_some());

    let response = send(&app, patch_request(path, 6, b"world")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("11"));
    assert!(header(&response, "upload-expires").is_none());

    let response = send(&app, get_request(path, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), Some("text/plain"));
    assert_eq!(header(&response, "accept-ranges"), Some("bytes"));
    let expected = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(b"hello world"));
    assert_eq!(
        header(&response, "x-checksum-sha256"),
        Some(expected.as_str())
    );
    assert_eq!(body_bytes(response).await, b"hello world");

    let response = send(&app, get_request(path, Some("bytes=-5"))).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&response, "content-range"), Some("bytes 6-10/11"));
    assert_eq!(body_bytes(response).await, b"world");
}

#[tokio::test]
async fn test_creation_with_upload_completes_immediately() {
    let app = test_app(None);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("upload-length", "5")
        .header("upload-metadata", metadata_for("note.txt"))
        .header("content-type", OFFSET_STREAM)
        .body(Body::from("hello"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header(&response, "upload-offset"), Some("5"));
    assert!(header(&response, "upload-expires").is_none());

    let response = send(&app, get_request("/files/attachments/note.txt", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn test_deferred_length_resolved_by_patch() {
    let app = test_app(None);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("upload-defer-length", "1")
        .header("upload-metadata", metadata_for("stream.log"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::CREATED);

    let path = "/files/attachments/stream.log";
    let response = send(&app, head_request(path)).await;
    assert_eq!(header(&response, "upload-defer-length"), Some("1"));
    assert!(header(&response, "upload-length").is_none());

    let request = Request::builder()
        .method(Method::PATCH)
        .uri(path)
        .header("content-type", OFFSET_STREAM)
        .header("upload-offset", "0")
        .header("upload-length", "4")
        .body(Body::from("abcd"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("4"));

    let response = send(&app, head_request(path)).await;
    assert_eq!(header(&response, "upload-length"), Some("4"));
}

#[tokio::test]
async fn test_offset_conflict_is_409() {
    let app = test_app(None);
    send(&app, create_request("a.txt", 10)).await;
    let response = send(&app, patch_request("/files/attachments/a.txt", 3, b"abc")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(error_message(response).await.contains("does not match"));
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_offset_unchanged() {
    let app = test_app(None);
    send(&app, create_request("sum.txt", 10)).await;

    let wrong = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(b"other"));
    let request = Request::builder()
        .method(Method::PATCH)
        .uri("/files/attachments/sum.txt")
        .header("content-type", OFFSET_STREAM)
        .header("upload-offset", "0")
        .header("upload-checksum", format!("sha256 {wrong}"))
        .body(Body::from("abc"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status().as_u16(), 460);

    let response = send(&app, head_request("/files/attachments/sum.txt")).await;
    assert_eq!(header(&response, "upload-offset"), Some("0"));

    let right = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(b"abc"));
    let request = Request::builder()
        .method(Method::PATCH)
        .uri("/files/attachments/sum.txt")
        .header("content-type", OFFSET_STREAM)
        .header("upload-offset", "0")
        .header("upload-checksum", format!("sha256 {right}"))
        .body(Body::from("abc"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("3"));
}

#[tokio::test]
async fn test_duplicate_create_is_rejected() {
    let app = test_app(None);
    assert_eq!(
        send(&app, create_request("dup.txt", 4)).await.status(),
        StatusCode::CREATED
    );
    assert_eq!(
        send(&app, create_request("dup.txt", 4)).await.status(),
        StatusCode::CONFLICT
    );
}

#[tokio::test]
async fn test_creation_errors() {
    let app = test_app(None);

    let response = send(&app, create_request("../etc/passwd", 4)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, create_request("huge.bin", 10 * 1024 * 1024)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("upload-length", "4")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("upload-length", "4")
        .header("upload-defer-length", "1")
        .header("upload-metadata", metadata_for("both.txt"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("upload-length", "4")
        .header("upload-metadata", "filename !!!notbase64")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_version_mismatch_is_412() {
    let app = test_app(None);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("tus-resumable", "0.2.2")
        .header("upload-length", "4")
        .header("upload-metadata", metadata_for("old.txt"))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(header(&response, "tus-version"), Some("1.0.0"));
}

#[tokio::test]
async fn test_patch_requires_offset_content_type() {
    let app = test_app(None);
    send(&app, create_request("ct.txt", 4)).await;
    let request = Request::builder()
        .method(Method::PATCH)
        .uri("/files/attachments/ct.txt")
        .header("content-type", "application/json")
        .header("upload-offset", "0")
        .body(Body::from("abcd"))
        .unwrap();
    assert_eq!(
        send(&app, request).await.status(),
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    );
}

#[tokio::test]
async fn test_unknown_routes_and_uploads_are_404() {
    let app = test_app(None);

    let response = send(&app, create_request_in("/files/other")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&response, "access-control-allow-origin"), Some("*"));
    assert_eq!(error_message(response).await, "Not Found");

    let response = send(&app, get_request("/nowhere", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, head_request("/files/attachments/missing.txt")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, get_request("/files/attachments/missing.txt", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, patch_request("/files/attachments/missing.txt", 0, b"x")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

fn create_request_in(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("upload-length", "4")
        .header("upload-metadata", metadata_for("x.txt"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_unsatisfiable_range_is_416() {
    let app = test_app(None);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/attachments")
        .header("upload-length", "3")
        .header("upload-metadata", metadata_for("r.txt"))
        .header("content-type", OFFSET_STREAM)
        .body(Body::from("abc"))
        .unwrap();
    send(&app, request).await;

    let response = send(&app, get_request("/files/attachments/r.txt", Some("bytes=10-"))).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header(&response, "content-range"), Some("bytes */3"));
}

#[tokio::test]
async fn test_upload_routes_require_token() {
    let app = test_app(Some("Bearer s3cret"));

    let response = send(&app, create_request("secure.txt", 4)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(header(&response, "tus-resumable"), Some("1.0.0"));

    let mut request = create_request("secure.txt", 4);
    request
        .headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    assert_eq!(send(&app, request).await.status(), StatusCode::UNAUTHORIZED);

    let mut request = create_request("secure.txt", 4);
    request
        .headers_mut()
        .insert("authorization", "Bearer s3cret".parse().unwrap());
    assert_eq!(send(&app, request).await.status(), StatusCode::CREATED);

    // Reads and discovery stay open.
    let response = send(&app, get_request("/files/attachments/secure.txt", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/files/attachments")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_health_and_openapi() {
    let app = test_app(None);
    let response = send(&app, get_request("/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, br#"{"status":"ok"}"#);

    let response = send(&app, get_request("/openapi.json", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let doc: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(doc["paths"]["/files/{namespace}/{id}"].is_object());
}

#[tokio::test]
async fn test_body_larger_than_max_upload_is_413() {
    let app = test_app(None);
    send(&app, create_request("big.bin", 1024)).await;

    let request = Request::builder()
        .method(Method::PATCH)
        .uri("/files/attachments/big.bin")
        .header("content-type", OFFSET_STREAM)
        .header("upload-offset", "0")
        .body(Body::from(vec![0u8; 1024 * 1024 + 1]))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(header(&response, "tus-resumable"), Some("1.0.0"));
    assert!(error_message(response).await.contains("maximum upload length"));

    let response = send(&app, head_request("/files/attachments/big.bin")).await;
    assert_eq!(header(&response, "upload-offset"), Some("0"));
}
