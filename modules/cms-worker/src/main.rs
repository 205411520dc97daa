use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cms_dispatch::{spawn_dispatcher, spawn_nightly_stats, Dispatcher, HandlerRegistry};
use cms_outbox::PgOutboxStore;
use cms_ratelimit::{spawn_bucket_sweeper, PgBucketStore, QuotaGate, RateLimiter};
use cms_worker::routes::{self, AppState};
use cms_worker::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("Starting cms-worker");

    let config = Config::from_env()?;
    config.log_summary();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Migrations complete");

    // ─── Outbox ──────────────────────────────────────────────────────────────

    let outbox = PgOutboxStore::new(pool.clone());

    let mut dispatcher = Dispatcher::new(outbox.clone(), HandlerRegistry::audit());
    if let Some(after) = config.reclaim_after {
        dispatcher = dispatcher.with_reclaim_after(after);
    }
    let dispatcher = spawn_dispatcher(Arc::new(dispatcher), config.poll_interval);

    let cancel = CancellationToken::new();
    let nightly = spawn_nightly_stats(outbox, config.nightly_stats, cancel.clone());

    // ─── Rate limiting ───────────────────────────────────────────────────────

    let buckets = PgBucketStore::new(pool.clone());
    let sweeper = spawn_bucket_sweeper(
        buckets.clone(),
        config.rate_limit_sweep_interval,
        cancel.clone(),
    );
    let rate_limiter = Arc::new(RateLimiter::with_bucket_store(
        buckets,
        config.rate_limit_backend_timeout,
    ));
    let gate = Arc::new(
        QuotaGate::new(rate_limiter.clone(), config.quota_policies())
            .trust_forwarded_for(config.rate_limit_trust_forwarded_for),
    );

    // ─── HTTP ────────────────────────────────────────────────────────────────

    let app = routes::router(
        AppState {
            dispatcher: dispatcher.status(),
            rate_limiter,
        },
        gate,
    );

    let addr = format!("{}:{}", config.web_host, config.web_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // ─── Shutdown ────────────────────────────────────────────────────────────

    info!("Shutting down");
    cancel.cancel();
    dispatcher.shutdown().await;
    for (name, task) in [("nightly stats", nightly), ("bucket sweeper", sweeper)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task ended abnormally");
        }
    }
    pool.close().await;
    info!("Stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
