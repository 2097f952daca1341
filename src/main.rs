use anyhow::Result;
use axum::Router;
use media_store::{
    config,
    db,
    routes,
    services::{health_service::HealthService, media_service::MediaService},
    state::AppState,
    storage::registry::ProviderRegistry,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-store with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backends (built lazily on first use) ---
    let local_signing_secret = cfg
        .storage
        .local
        .as_ref()
        .and_then(|local| local.signing_secret.as_ref())
        .map(|secret| Arc::<[u8]>::from(secret.as_bytes()));
    let registry = Arc::new(ProviderRegistry::new(cfg.storage.clone()));
    tracing::info!(
        "Configured storage providers: {:?} (default: {})",
        registry.configured_types(),
        cfg.default_provider
    );
    if !cfg.storage.is_configured(cfg.default_provider) {
        tracing::warn!(
            "Default provider `{}` has no configuration; uploads without an explicit provider will fail",
            cfg.default_provider
        );
    }

    // --- Initialize core services ---
    let state = AppState {
        db: db.clone(),
        media: MediaService::new(db, registry.clone(), cfg.default_provider),
        health: HealthService::new(registry, cfg.health_timeout),
        local_signing_secret,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
