//! Kiro credential pool daemon
//!
//! Single-binary Rust service that:
//! 1. Loads Kiro credential files from the auth directory
//! 2. Keeps their access tokens fresh in the background
//! 3. Checks each account's usage quota and cools down exhausted ones
//! 4. Tracks per-account failures, cooldowns and health scores
//! 5. Serves pool health on `/health` and Prometheus metrics on `/metrics`

mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiro_auth::{HttpRefreshClient, HttpUsageClient};
use kiro_pool::{
    BackgroundRefresher, FileRepository, PoolManager, QuotaMonitor, RateLimiter, TokenScorer,
};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<PoolManager>,
    repository: Arc<FileRepository>,
    refresher: Arc<BackgroundRefresher>,
    quota_monitor: Option<Arc<QuotaMonitor>>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON output, LOG_LEVEL then RUST_LOG, default info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting kiro-pool-daemon");

    // Install before any component emits
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let refresher_config = config.refresher_config();
    info!(
        listen_addr = %config.daemon.listen_addr,
        auth_dir = ?config.daemon.auth_dir,
        refresh_interval_secs = refresher_config.interval.as_secs(),
        refresh_concurrency = refresher_config.concurrency,
        "configuration loaded"
    );
    if config.daemon.auth_dir.is_none() {
        warn!("no auth_dir configured, credential refresh is disabled");
    }

    let repository = Arc::new(FileRepository::new(config.daemon.auth_dir.clone()));

    let rate_limiter = RateLimiter::new(config.rate_limiter_config())
        .with_classifier(Arc::new(config.suspension_classifier()));
    let pool = Arc::new(PoolManager::new(
        rate_limiter,
        TokenScorer::default(),
        config.sweep_interval(),
    ));

    let http = reqwest::Client::builder()
        .timeout(refresher_config.timeout)
        .build()
        .context("failed to build HTTP client")?;
    let refresher = Arc::new(BackgroundRefresher::new(
        Arc::clone(&repository),
        Arc::new(HttpRefreshClient::new(http.clone())),
        refresher_config,
    ));

    let quota_monitor = config.quota.enabled.then(|| {
        Arc::new(QuotaMonitor::new(
            Arc::clone(&repository),
            Arc::clone(&pool),
            Arc::new(HttpUsageClient::new(http)),
            config.quota_monitor_config(),
        ))
    });
    if quota_monitor.is_none() {
        info!("quota monitor disabled by configuration");
    }

    // A fresh token clears failures that a stale one caused
    let limiter = Arc::clone(pool.rate_limiter());
    refresher
        .set_on_refreshed(Arc::new(move |id, _credential| {
            let limiter = Arc::clone(&limiter);
            let id = id.to_string();
            tokio::spawn(async move { limiter.mark_success(&id).await });
        }))
        .await;

    let shutdown = CancellationToken::new();
    pool.start(&shutdown).await;
    refresher.start(&shutdown).await;
    if let Some(monitor) = &quota_monitor {
        monitor.start(&shutdown).await;
    }

    let app_state = AppState {
        pool: Arc::clone(&pool),
        repository,
        refresher: Arc::clone(&refresher),
        quota_monitor: quota_monitor.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.daemon.max_connections);

    let listen_addr = config.daemon.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;
    shutdown.cancel();

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    if let Some(monitor) = &quota_monitor {
        monitor.stop().await;
    }
    refresher.stop().await;
    pool.stop().await;

    info!("shutdown complete");
    Ok(())
}

/// Pool health: 200 while at least one account is usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ids: Vec<String> = state
        .repository
        .list_all()
        .await
        .into_iter()
        .map(|credential| credential.id)
        .collect();

    let mut body = state.pool.health(&ids).await;
    let count = |field: &str| body[field].as_u64().unwrap_or(0) as usize;
    metrics::record_pool_health(
        count("accounts_total"),
        count("accounts_available"),
        count("accounts_cooling_down"),
        count("accounts_suspended"),
    );

    let status_code = if body["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();
    body["refresher_running"] = state.refresher.is_running().await.into();
    body["quota_monitor_running"] = match &state.quota_monitor {
        Some(monitor) => monitor.is_running().await,
        None => false,
    }
    .into();

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
