use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use blob_uploader::{
    config, routes,
    services::{
        local_store::LocalBlobStore,
        storage_gateway::{GatewaySettings, StorageGateway},
    },
    state,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting blob-uploader with config: {:?}", cfg);

    // --- Open metadata database + payload directory ---
    let store = LocalBlobStore::connect(&cfg.database_url, &cfg.storage_dir).await?;
    let applied = store.run_migrations().await?;
    tracing::debug!("Applied {} schema statements", applied);

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize gateway ---
    let gateway = StorageGateway::new(
        Arc::new(store),
        cfg.credentials.clone(),
        GatewaySettings {
            default_sas_ttl: cfg.default_sas_ttl,
            operation_timeout: cfg.storage_timeout,
        },
    );
    let state = state::AppState::new(gateway, cfg.upload_sas_ttl);

    // --- Build router ---
    let app: Router =
        routes::routes::routes(&cfg.upload_route, cfg.max_upload_bytes).with_state(state);

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
