mod auth;
mod error;
mod handlers;
mod redis_store;
mod routes;
mod store;
mod worker;

use anyhow::{Context, Result};
use jexec_common::config::ServiceConfig;
use jexec_common::types::RequestLimits;
use jexec_engine::{select_sandbox, LanguageConfigManager, Sandbox};
use redis_store::RedisJobStore;
use std::sync::Arc;
use std::time::Duration;
use store::{InMemoryJobStore, JobStore};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub struct AppState {
    pub api_secret: String,
    pub limits: RequestLimits,
    pub store: Arc<dyn JobStore>,
    pub sandbox: Arc<dyn Sandbox>,
    /// Submitted job ids waiting for a worker
    pub queue: mpsc::Sender<Uuid>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, draining");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Java execution API booting...");

    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    info!(?config, "Configuration loaded");

    let languages = LanguageConfigManager::load_or_builtin(&config.language_config)?;
    info!(available = ?languages.list_languages(), "Toolchains loaded");
    let language = languages.get_config(&config.language)?.clone();
    info!(language = %language.name, version = %language.version, "Toolchain selected");

    let sandbox = select_sandbox(
        config.sandbox_mode,
        config.allow_unisolated,
        language,
        &config.scratch_dir,
    )
    .await?;
    info!(sandbox = sandbox.kind(), isolated = sandbox.is_isolated(), "Sandbox ready");

    let store: Arc<dyn JobStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisJobStore::connect(url, config.job_ttl_secs)
                .await
                .context("Failed to connect to Redis job store")?,
        ),
        None => Arc::new(InMemoryJobStore::new()),
    };
    info!(store = store.backend(), "Job store ready");

    let (sender, receiver) = mpsc::channel(config.queue_capacity);
    let workers = worker::spawn_workers(
        config.worker_count,
        receiver,
        store.clone(),
        sandbox.clone(),
        config.limits,
    );
    let stall_after = Duration::from_secs(config.limits.max_timeout_secs) + worker::STALL_GRACE;
    let reaper = worker::spawn_reaper(
        store.clone(),
        Duration::from_secs(config.job_ttl_secs),
        stall_after,
    );
    info!(workers = config.worker_count, queue_capacity = config.queue_capacity, "Worker pool started");

    // Jobs a previous process accepted but never started
    {
        let store = store.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            match worker::requeue_pending(store.as_ref(), &sender).await {
                Ok(0) => {}
                Ok(queued) => info!(queued, "Re-queued pending jobs"),
                Err(e) => warn!(error = %e, "Could not re-queue pending jobs"),
            }
        });
    }

    let state = Arc::new(AppState {
        api_secret: config.api_secret.clone(),
        limits: config.limits,
        store,
        sandbox,
        queue: sender,
    });
    let app = routes::routes(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router, and with it the queue sender, is gone; workers finish
    // whatever is still queued and exit.
    reaper.abort();
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker ended abnormally");
        }
    }
    info!("Shutdown complete");
    Ok(())
}
