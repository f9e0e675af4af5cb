mod api;
mod config;
mod context;
mod error;
mod gateway;
mod logging;
mod query;
mod store;
mod validation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::{BackendKind, Config};
use crate::context::RequestContext;
use crate::gateway::{DocumentStore, ElasticGateway, MemoryGateway};
use crate::logging::LogLevelSwitch;
use crate::store::CatalogueStore;

const DEFAULT_CONFIG_PATH: &str = "/etc/catalogue/catalogued.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let log_switch = Arc::new(LogLevelSwitch::init()?);

    tracing::info!("Starting catalogued");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    log_switch.set_level(&config.app.log_level)?;

    tracing::info!(
        environment = %config.app.environment,
        backend = ?config.backend.kind,
        log_level = %log_switch.level(),
        "Loaded config from {}",
        config_path
    );

    // Pick the document store
    let mut memory = None;
    let backend: Arc<dyn DocumentStore> = match config.backend.kind {
        BackendKind::Elasticsearch => Arc::new(ElasticGateway::new(&config.backend)?),
        BackendKind::Memory => {
            let handle = MemoryGateway::spawn();
            memory = Some(handle.clone());
            Arc::new(handle)
        }
    };

    let collections = config.backend.collections();
    if config.backend.create_indices {
        let ctx = RequestContext::background(&config.app.service_name)
            .with_timeout(config.backend.request_timeout());
        gateway::ensure_collections(backend.as_ref(), &ctx, &collections)
            .await
            .context("Failed to create backend collections")?;
    }

    let store = CatalogueStore::new(backend, collections);

    // Parent of every request's cancellation token
    let shutdown = CancellationToken::new();
    let shutting_down = Arc::new(AtomicBool::new(false));

    // Reload the log level on SIGHUP
    let reload_handle = tokio::spawn(reload_on_hangup(
        config_path.clone(),
        log_switch.clone(),
        shutdown.clone(),
    ));

    let config = Arc::new(config);
    let app = api::routes::router(api::routes::AppState {
        store,
        config: config.clone(),
        shutdown: shutdown.clone(),
        shutting_down: shutting_down.clone(),
    });

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    wait_for_signal().await?;

    tracing::info!("Shutdown signal received");

    // Fail health checks first so traffic drains before in-flight work is cancelled
    shutting_down.store(true, Ordering::SeqCst);
    tokio::time::sleep(config.api.shutdown_grace()).await;
    shutdown.cancel();

    let _ = tokio::join!(server_handle, reload_handle);

    if let Some(memory) = memory {
        if let Err(e) = memory.shutdown().await {
            tracing::error!("Failed to shutdown memory store: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}

#[cfg(unix)]
async fn reload_on_hangup(path: String, log_switch: Arc<LogLevelSwitch>, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to listen for SIGHUP: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                match Config::load(&path) {
                    Ok(config) => {
                        if let Err(e) = log_switch.set_level(&config.app.log_level) {
                            tracing::error!("Failed to apply log level: {:#}", e);
                        }
                    }
                    Err(e) => tracing::error!("Config reload failed: {:#}", e),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_path: String, _log_switch: Arc<LogLevelSwitch>, cancel: CancellationToken) {
    cancel.cancelled().await;
}
