//! Axum router construction.
//!
//! The [`app`] function wires the blob API under `/api/v1` plus the
//! infrastructure endpoints and returns a ready-to-serve [`axum::Router`].
//! Ownership transfer and re-authorization are only mounted for
//! deployments storing full records.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::auth::Identity;
use crate::errors::{generate_request_id, StoreError};
use crate::handlers::blob;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::storage::provider::RecordKind;
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the blob API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "blobgate API",
        version = "0.1.0",
        description = "Blob storage gateway with per-blob access policies"
    ),
    paths(
        health_check,
        crate::handlers::blob::add_blob,
        crate::handlers::blob::get_blob,
        crate::handlers::blob::remove_blob,
        crate::handlers::blob::transfer_ownership,
        crate::handlers::blob::authorize,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Blob", description = "Blob operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all routes and middleware.
pub fn app(state: Arc<AppState>) -> Router {
    let mut api: Router<Arc<AppState>> = Router::new()
        .route("/add-blob", post(blob::add_blob))
        .route("/blob/:id", get(blob::get_blob))
        .route("/remove-blob", post(blob::remove_blob));

    if state.storage.kind() == RecordKind::Full {
        api = api
            .route("/transfer-ownership", post(blob::transfer_ownership))
            .route("/authorize", post(blob::authorize));
    }

    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .nest("/api/v1", api)
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        // CORS answers preflights before auth runs.
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Blobs have no size limit at this layer.
        .layer(DefaultBodyLimit::disable())
}

/// CORS for browser clients: `x-metadata` must be both sendable and readable.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let x_metadata = HeaderName::from_static(blob::X_METADATA);

    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect::<Vec<_>>(),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, x_metadata.clone()])
        .expose_headers([CONTENT_TYPE, CONTENT_DISPOSITION, x_metadata])
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id`, `date` and `server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry their own request id.
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("blobgate"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass identity resolution.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/metrics", "/openapi.json"];

/// Resolves the caller from the `Authorization` header and attaches an
/// [`Identity`] to the request. Anonymous callers pass through; a header
/// that does not verify is rejected with 401.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StoreError> {
    if AUTH_SKIP_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .map(|v| {
            v.to_str().map_err(|_| StoreError::Unauthenticated {
                message: "authorization header is not valid text".to_string(),
            })
        })
        .transpose()?;

    let principal = state.identity.identify(header)?;
    req.extensions_mut().insert(Identity(principal));

    Ok(next.run(req).await)
}

// -- Infrastructure endpoints ------------------------------------------------

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

/// `GET /openapi.json` -- The OpenAPI document.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// -- Tests --------------------------------------------------------------------
