//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the database and the storage backend

use crate::handlers::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

const CHECK_CONTENT: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Liveness check; never performs I/O.
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
/// Readiness check that:
/// 1. Runs `SELECT 1` against the metadata database.
/// 2. Writes, reads back and deletes a sentinel object through the storage backend.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let database_check = match state.lifecycle.repository().ping().await {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let storage_check = check_storage(&state).await;

    let overall_ok = database_check.ok && storage_check.ok;
    let mut checks = HashMap::new();
    checks.insert("database", database_check);
    checks.insert("storage", storage_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_storage(state: &AppState) -> CheckStatus {
    let storage = state.lifecycle.storage();
    let key = format!("readyz-check/{}", Uuid::new_v4());

    if let Err(e) = storage.put(&key, Bytes::from_static(CHECK_CONTENT)).await {
        return CheckStatus::failed(format!("could not write sentinel object: {}", e));
    }
    let read_back = storage.get(&key).await;
    let removed = storage.delete(&key).await;

    let bytes = match read_back {
        Ok(bytes) => bytes,
        Err(e) => return CheckStatus::failed(format!("could not read sentinel object: {}", e)),
    };
    if bytes.as_ref() != CHECK_CONTENT {
        return CheckStatus::failed("sentinel object content mismatch".to_string());
    }
    match removed {
        Ok(()) => CheckStatus::ok(),
        // a leftover sentinel object does not make the backend unusable
        Err(e) => CheckStatus {
            ok: true,
            error: Some(format!("could not remove sentinel object: {}", e)),
        },
    }
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

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
