use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use share_authorityd::api;
use share_authorityd::catalog::FileCatalog;
use share_authorityd::config::Config;
use share_authorityd::friends::FileFriendSource;
use share_authorityd::identity::{HeaderIdentity, WorkerAuth};
use share_authorityd::service::ShareService;
use share_authorityd::store::db::StoreDb;
use share_authorityd::store_manager::{self, StoreHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("share_authorityd=info"))
        )
        .init();

    tracing::info!("Starting share-authorityd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/share-authority/authorityd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite database
    let db = StoreDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let store = StoreHandle::spawn(db);

    let pending = store
        .count_undelivered()
        .await
        .context("Failed to read notification queue")?;
    if pending > 0 {
        tracing::info!("{} notifications awaiting delivery", pending);
    }

    let identity = HeaderIdentity::new(&config.identity.header)?;
    let friends = FileFriendSource::new(config.friends.path.clone());
    let catalog = FileCatalog::load(&config.catalog.path);
    let worker = WorkerAuth::new(config.worker.token.as_deref());
    if !worker.is_configured() {
        tracing::warn!("No worker token configured, notification queue routes will reject all requests");
    }

    let service = ShareService::new(store.clone(), Arc::new(friends), Arc::new(catalog));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn store maintenance task
    let mgr_cancel = cancel.clone();
    let mgr_config = config.store.clone();
    let mgr_store = store.clone();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = store_manager::run(mgr_store, mgr_config, mgr_cancel).await {
            tracing::error!("Store maintenance error: {}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        service,
        identity: Arc::new(identity),
        worker: Arc::new(worker),
    };
    let app = api::routes::router(app_state.clone());
    let worker_app = api::routes::worker_router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let worker_listener = tokio::net::TcpListener::bind(&config.api.worker_listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.worker_listen))?;

    tracing::info!("Worker API listening on {}", config.api.worker_listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    let worker_cancel = cancel.clone();
    let worker_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            worker_listener,
            worker_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { worker_cancel.cancelled().await })
        .await
        {
            tracing::error!("Worker server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(mgr_handle, server_handle, worker_handle);

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
