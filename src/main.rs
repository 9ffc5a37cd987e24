//! MeigaHub - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use meigahub::{ResidencyMonitor, api, config::GatewayConfig, metrics};
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "meigahub")]
#[command(about = "OpenAI-compatible gateway arbitrating GPU backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting MeigaHub gateway");

    // Load configuration
    let mut config = GatewayConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        auto_switch = config.auto_switch,
        switch_timeout_secs = config.switch_timeout_secs,
        models_dir = ?config.models_dir,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let app_state = api::AppState::build(&config, prometheus_handle).await?;
    let coordinator = app_state.coordinator().clone();
    let downloads = app_state.downloads.clone();

    // Pick up a backend left running by a previous session
    match coordinator.adopt_running().await {
        Some(state) => tracing::info!(
            kind = %state.kind,
            model = ?state.loaded_model,
            "Adopted running backend"
        ),
        None => tracing::info!("No backend running; will start on demand"),
    }
    metrics::update_resident(coordinator.supervisor().resident_kind().await);

    // Start residency monitor
    let monitor = ResidencyMonitor::new(coordinator.clone(), config.monitor_interval_secs);
    let monitor_handle = tokio::spawn(monitor.run());

    let app = api::create_router(app_state);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {addr}"))?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");
    monitor_handle.abort();

    tracing::info!("Canceling downloads");
    downloads.shutdown().await;

    tracing::info!("Stopping resident backend");
    if let Err(e) = coordinator.deactivate().await {
        tracing::error!(error = %e, "Failed to stop backend during shutdown");
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
