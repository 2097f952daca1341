use crate::services::{health_service::HealthService, media_service::MediaService};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub media: MediaService,
    pub health: HealthService,
    /// Secret used to verify signed `/files/...` URLs for the local backend.
    pub local_signing_secret: Option<Arc<[u8]>>,
}
