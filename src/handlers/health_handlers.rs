//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that probes the storage backend

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs every probe the storage backend exposes (for the local store: a
/// `SELECT 1` against SQLite and a write/read/delete under the payload
/// directory). HTTP 200 when all checks pass, HTTP 503 when any fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let probes = state.gateway.readiness().await;
    let overall_ok = probes.iter().all(|p| p.is_ok());

    let checks = probes
        .into_iter()
        .map(|p| {
            (
                p.name,
                CheckStatus {
                    ok: p.error.is_none(),
                    error: p.error,
                },
            )
        })
        .collect::<HashMap<_, _>>();

    let status = if overall_ok {
        StatusCode::OK
    } else {
        warn!(?checks, "readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize, Debug)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
