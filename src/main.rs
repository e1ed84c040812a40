use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod shutdown;

use services::{
    image_store::ImageStore, ingestion::IngestionGate, record_store::SqliteRecordStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-store with config: {:?}", cfg);

    // --- Ensure the database directory exists ---
    if let Some(parent) = sqlite_file_path(&cfg.database_url).and_then(Path::parent) {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Open the process-wide record store ---
    let records = SqliteRecordStore::connect(&cfg.database_url, cfg.max_connections).await?;

    // --- Handle migration mode ---
    if migrate {
        records.migrate().await?;
        tracing::info!("Database migration complete.");
        records.close().await;
        return Ok(()); // exit after migration
    }
    records.migrate().await?;

    // --- Initialize core service ---
    let gate = IngestionGate::new(cfg.max_object_bytes);
    let body_limit = routes::image_routes::upload_body_limit(&gate);
    let store = ImageStore::new(Arc::new(records.clone()), gate, cfg.chunk_size);

    // --- Build router ---
    let app: Router = routes::image_routes::routes(body_limit).with_state(store);

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;

    // --- Teardown ---
    records.close().await;
    tracing::info!("Record store closed, shutting down.");

    Ok(())
}

/// Local file behind a `sqlite:` URL, or `None` for in-memory databases.
fn sqlite_file_path(database_url: &str) -> Option<&Path> {
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        None
    } else {
        Some(Path::new(path))
    }
}
