//! Axum router construction and tus route mapping.
//!
//! The [`app`] function wires the upload and read endpoints to their
//! handlers and returns a ready-to-serve [`axum::Router`].
//!
//! Both upload routes live under `/files/{namespace}`: the collection
//! accepts `POST` (create), the member accepts `PATCH` (append), `HEAD`
//! (status) and `GET` (read back). `OPTIONS` on either answers
//! capability discovery.

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::debug;
use utoipa::OpenApi;

use crate::errors::{generate_request_id, TusError};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::tus::headers::{
    ALLOWED_HEADERS, ALLOWED_METHODS, EXPOSED_HEADERS, TUS_RESUMABLE, TUS_VERSION,
};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the tusstore API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "tusstore",
        version = "0.1.0",
        description = "Resumable-upload (tus 1.0.0) server"
    ),
    paths(
        health_check,
        crate::handlers::upload::upload_options,
        crate::handlers::upload::create_upload,
        crate::handlers::upload::append_upload,
        crate::handlers::upload::upload_status,
        crate::handlers::object::get_object,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "tus upload lifecycle"),
        (name = "Object", description = "Completed upload read-back"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`] with the upload, read and infrastructure routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    // No single body can be larger than a whole upload.
    let body_limit = usize::try_from(state.config.uploads.max_upload_length).unwrap_or(usize::MAX);
    let mut router = Router::new().route("/openapi.json", get(openapi_json));
    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .route(
            "/files/:namespace",
            get(handle_not_found)
                .post(handle_create)
                .options(handle_options),
        )
        .route(
            "/files/:namespace/*id",
            get(handle_get)
                .head(handle_head)
                .patch(handle_patch)
                .options(handle_options_member),
        )
        .fallback(handle_not_found)
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        // auth_middleware is innermost (closest to handlers, after routing).
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        // protocol_headers_middleware stamps every response, errors included.
        .layer(middleware::from_fn(protocol_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Protocol and CORS headers -----------------------------------------------

/// Adds to every response:
/// - `Tus-Resumable: 1.0.0`
/// - wildcard CORS headers with the tus allow/expose lists
/// - `x-request-id` unless the error renderer already set one
async fn protocol_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", id);
        }
    }
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static("86400"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Upload-token check.
///
/// Applies to mutating and status requests under `/files/`. `GET` reads and
/// `OPTIONS` discovery are open. With no token configured every request
/// passes.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, TusError> {
    let Some(token) = state.config.auth.token.as_deref() else {
        return Ok(next.run(req).await);
    };
    let open = matches!(*req.method(), Method::GET | Method::OPTIONS)
        || !req.uri().path().starts_with("/files/");
    if open {
        return Ok(next.run(req).await);
    }

    let provided = req
        .headers()
        .get("authorization")
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if bool::from(provided.ct_eq(token.as_bytes())) {
        Ok(next.run(req).await)
    } else {
        debug!("rejected {} {}: bad authorization", req.method(), req.uri().path());
        Err(TusError::Unauthorized)
    }
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- the generated API document.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

async fn handle_not_found() -> TusError {
    TusError::NotFound
}

/// Surface body buffering failures as JSON errors.
fn request_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, TusError> {
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            TusError::PayloadTooLarge
        } else {
            TusError::Protocol(rejection.body_text())
        }
    })
}

// -- Route handlers ----------------------------------------------------------

/// `OPTIONS /files/:namespace`
async fn handle_options(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> Result<Response, TusError> {
    crate::handlers::upload::upload_options(state, &namespace).await
}

/// `OPTIONS /files/:namespace/*id`
async fn handle_options_member(
    State(state): State<Arc<AppState>>,
    Path((namespace, _id)): Path<(String, String)>,
) -> Result<Response, TusError> {
    crate::handlers::upload::upload_options(state, &namespace).await
}

/// `POST /files/:namespace` -> create
async fn handle_create(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, TusError> {
    let body = request_body(body)?;
    crate::handlers::upload::create_upload(state, &namespace, &headers, body).await
}

/// `PATCH /files/:namespace/*id` -> append
async fn handle_patch(
    State(state): State<Arc<AppState>>,
    Path((namespace, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, TusError> {
    let body = request_body(body)?;
    crate::handlers::upload::append_upload(state, &namespace, &id, &headers, body).await
}

/// `HEAD /files/:namespace/*id` -> status
async fn handle_head(
    State(state): State<Arc<AppState>>,
    Path((namespace, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, TusError> {
    crate::handlers::upload::upload_status(state, &namespace, &id, &headers).await
}

/// `GET /files/:namespace/*id` -> read
async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path((namespace, id)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, TusError> {
    crate::handlers::object::get_object(state, &namespace, &id, &uri, &headers).await
}
