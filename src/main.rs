use anyhow::{Context, Result};
use axum::Router;
use file_uploads::{
    config::{AppConfig, Mode, StorageBackend},
    handlers::AppState,
    repository::{self, FileRepository},
    routes,
    services::{StaleUploadReaper, UploadLifecycle},
    storage::{LocalStorage, MemoryStorage, StorageClient},
};
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-uploads with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        repository::connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );

    // --- Handle migration mode ---
    if mode == Mode::Migrate {
        repository::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backend ---
    let storage: Arc<dyn StorageClient> = match cfg.storage_backend {
        StorageBackend::Local => {
            let local = LocalStorage::new(&cfg.storage_dir, cfg.public_url.clone())
                .with_context(|| format!("preparing storage directory {}", cfg.storage_dir))?;
            tracing::info!("Storing objects under {}", local.base_path().display());
            Arc::new(local)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; uploaded content is lost on exit");
            Arc::new(MemoryStorage::new(cfg.public_url.clone()))
        }
    };

    let repo = FileRepository::new(db.clone());
    let reaper = StaleUploadReaper::new(repo.clone(), storage.clone());

    // --- Handle one-shot reap mode ---
    if mode == Mode::ReapStale {
        let count = reaper.reap_stale(cfg.retention()).await?;
        println!("Success cleaning up {} stale file uploads.", count);
        return Ok(());
    }

    if let Some(secs) = cfg.reap_interval_secs {
        spawn_periodic_reaper(reaper, cfg.retention(), Duration::from_secs(secs));
    }

    // --- Initialize core service ---
    let lifecycle = UploadLifecycle::new(repo, storage, cfg.chunk_size);
    let max_body_size = usize::try_from(cfg.max_body_size).unwrap_or(usize::MAX);
    let state = AppState::new(lifecycle, max_body_size);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

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

/// Sweep stale uploads every `period` for as long as the server runs.
fn spawn_periodic_reaper(reaper: StaleUploadReaper, retention: Duration, period: Duration) {
    tracing::info!(
        "Reaping uploads older than {}h every {}s",
        retention.as_secs() / 3600,
        period.as_secs()
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match reaper.reap_stale(retention).await {
                Ok(0) => tracing::debug!("No stale uploads to reclaim"),
                Ok(count) => tracing::info!("Reclaimed {} stale uploads", count),
                Err(err) => tracing::warn!("Stale upload sweep failed: {}", err),
            }
        }
    });
}
