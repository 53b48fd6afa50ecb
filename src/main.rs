use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod pipeline;
mod routes;
mod services;
mod state;

use pipeline::Pipeline;
use services::storage_service::StorageService;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting gallery-zip with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone());
    let (pipeline, failure_handler) =
        Pipeline::start(cfg.pipeline(), Arc::new(storage.clone()), db);
    let engine = pipeline.engine.clone();
    tracing::info!("Archive pipeline started: {:?}", pipeline.config);

    // --- Drop scratch left behind by runs that died with a previous process ---
    match pipeline.sweep_scratch().await {
        Ok(0) => {}
        Ok(swept) => tracing::info!("Discarded scratch areas of {} abandoned runs", swept),
        Err(err) => tracing::warn!("Scratch sweep failed: {}", err),
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState { storage, pipeline });

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
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let running archives finish so none is left GENERATING until the
    // timeout supersedes it.
    engine.shutdown().await;
    drop(engine);
    match tokio::time::timeout(Duration::from_secs(10), failure_handler).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!("failure handler exited abnormally: {}", err),
        Err(_) => tracing::warn!("failure handler still draining; exiting anyway"),
    }
    tracing::info!("Shutdown complete.");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not install Ctrl+C handler: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining.");
}
