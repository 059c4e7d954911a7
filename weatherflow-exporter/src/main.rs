//! Prometheus exporter for the WeatherFlow Tempest API.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use weatherflow_common::init_tracing;
use weatherflow_exporter::config::ServerConfig;
use weatherflow_exporter::{
    ExporterConfig, ExporterMetrics, HttpServer, MetricCatalog, SessionManager,
    WebSocketConnector,
};

/// Prometheus exporter for WeatherFlow Tempest stations.
#[derive(Parser, Debug)]
#[command(name = "weatherflow-exporter")]
#[command(about = "Serve WeatherFlow Tempest observations as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config and PORT).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    apply_listen_overrides(&mut config.server, args.listen, std::env::var("PORT").ok())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("TLS crypto provider already installed");
    }

    info!("Starting WeatherFlow exporter");

    let catalog = Arc::new(MetricCatalog::standard(&config.prometheus.prefix)?);
    info!(
        metrics = catalog.len(),
        prefix = %config.prometheus.prefix,
        "Metric catalog ready"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(ExporterMetrics::new());
    let connector = Arc::new(WebSocketConnector::new(config.feed.clone()));
    let sessions = Arc::new(SessionManager::new(
        &config,
        catalog,
        connector,
        metrics.clone(),
    ));

    let listen_addr = config
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
    let http_server = HttpServer::new(
        sessions.clone(),
        metrics,
        listen_addr,
        config.server.scrape_path.clone(),
        config.server.metrics_path.clone(),
    );

    let mut http_task = tokio::spawn(http_server.run(shutdown_rx));

    let outcome = wait_for_shutdown(&mut http_task, shutdown_signal()).await;
    if let Err(e) = &outcome {
        error!(error = %e, "HTTP server failed");
    }

    let _ = shutdown_tx.send(true);
    if outcome.is_ok() {
        let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;
    }

    sessions.shutdown();

    let stats = sessions.stats();
    info!(
        sessions_created = stats.created,
        sessions_evicted = stats.evicted,
        "Final statistics"
    );

    info!("Exporter stopped");
    outcome
}

/// Apply `--listen`, or a non-empty `PORT` when `--listen` is absent.
fn apply_listen_overrides(
    server: &mut ServerConfig,
    listen: Option<String>,
    port: Option<String>,
) -> anyhow::Result<()> {
    if let Some(listen) = listen {
        server.listen = listen;
        return Ok(());
    }

    let Some(port) = port.filter(|p| !p.trim().is_empty()) else {
        return Ok(());
    };
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|e| anyhow::anyhow!("Invalid PORT {:?}: {}", port, e))?;
    server.set_port(port)?;
    Ok(())
}

/// Wait for a stop signal. The HTTP server exiting first is an error.
async fn wait_for_shutdown(
    server: &mut JoinHandle<anyhow::Result<()>>,
    signal: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tokio::select! {
        _ = signal => Ok(()),
        result = server => match result {
            Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server stopped unexpectedly")),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
        },
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
