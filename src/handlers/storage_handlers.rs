//! Backend discovery and health endpoints under `/api/storage`.

use crate::{
    errors::AppError,
    models::file_object::ProviderType,
    services::health_service::HealthReport,
    state::AppState,
    storage::registry::{ProviderInfo, supported_providers},
};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    pub configured: Vec<ProviderType>,
    pub default: ProviderType,
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub provider: Option<String>,
}

/// GET `/api/storage/providers`
pub async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: supported_providers(),
        configured: state.media.registry().configured_types(),
        default: state.media.default_provider(),
    })
}

/// GET `/api/storage/health?provider=`
///
/// 200 when every checked backend is healthy, 503 otherwise. The body is the
/// same report either way.
pub async fn storage_health(
    State(state): State<AppState>,
    Query(q): Query<HealthQuery>,
) -> Result<(StatusCode, Json<HealthReport>), AppError> {
    let report = match q.provider.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(name) => state.health.check_named(name).await?,
        None => state.health.check_all().await,
    };
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(report)))
}
