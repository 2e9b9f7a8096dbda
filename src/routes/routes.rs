//! Defines the gateway's routes.
//!
//! - `GET  /healthz`, `GET /readyz` — probes
//! - `POST <upload_route>` — multipart upload, answers with a signed read URL
//! - `GET | HEAD | PUT | DELETE /{container}/{*key}` — signed blob access
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        blob_handlers::{delete_blob, get_blob, head_blob, put_blob},
        health_handlers::{healthz, readyz},
        upload_handlers::upload_file,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_upload_bytes` caps request bodies on the upload
/// and blob write routes.
pub fn routes(upload_route: &str, max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(upload_route, post(upload_file))
        // Blob-level routes
        .route(
            "/{container}/{*key}",
            get(get_blob)
                .head(head_blob)
                .put(put_blob)
                .delete(delete_blob),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
