use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenantdesk::api::metrics::init_metrics;
use tenantdesk::api::rate_limit::spawn_cleanup_task;
use tenantdesk::cli::{run_command, Cli};
use tenantdesk::config::Config;
use tenantdesk::engine::{spawn_maintenance_task, spawn_pipeline_scheduler};
use tenantdesk::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    init_logging(&cli, &config);

    if !cli.is_serve() {
        return run_command(&cli, &config).await;
    }

    tracing::info!("Starting tenantdesk v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let db = tenantdesk::db::init(&config.database).await?;

    // Create the bootstrap admin on an empty database
    tenantdesk::api::auth::ensure_bootstrap_admin(&db, &config.auth).await?;

    let metrics_handle = init_metrics()?;
    let state = Arc::new(AppState::new(config.clone(), db.clone()).with_metrics(metrics_handle));

    // Background tasks
    spawn_maintenance_task(db.clone(), state.dispatcher.clone(), config.retention.clone());
    spawn_pipeline_scheduler(db.clone(), config.pipelines.clone());
    if config.rate_limit.enabled {
        spawn_cleanup_task(state.rate_limiter.clone(), config.rate_limit.cleanup_interval);
    }

    let app = tenantdesk::api::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("API server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// RUST_LOG wins, then `--log-level`, then `logging.level`
fn init_logging(cli: &Cli, config: &Config) {
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let (json_layer, text_layer) = if config.logging.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
