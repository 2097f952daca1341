//! Liveness and readiness checks.
//!
//! `/readyz` only gates on SQLite. Remote backends are checked through
//! `/api/storage/health` so a flaky bucket does not pull the service out of
//! rotation.

use crate::{models::file_object::ProviderType, state::AppState};
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

#[derive(Serialize)]
pub struct Liveness {
    status: &'static str,
}

#[derive(Serialize)]
pub struct Readiness {
    status: &'static str,
    database: DatabaseCheck,
    /// Backends with configuration; listed, never contacted.
    providers: Vec<ProviderType>,
}

#[derive(Serialize)]
struct DatabaseCheck {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `GET /healthz`
pub async fn healthz() -> Json<Liveness> {
    Json(Liveness { status: "ok" })
}

/// `GET /readyz`: 200 when `SELECT 1` succeeds, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let database = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => DatabaseCheck {
            ok: true,
            error: None,
        },
        Ok(other) => DatabaseCheck {
            ok: false,
            error: Some(format!("unexpected result: {}", other)),
        },
        Err(err) => {
            tracing::warn!("readiness check failed: {}", err);
            DatabaseCheck {
                ok: false,
                error: Some(err.to_string()),
            }
        }
    };

    let (code, status) = if database.ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "error")
    };
    let body = Readiness {
        status,
        database,
        providers: state.media.registry().configured_types(),
    };
    (code, Json(body))
}
