//! Multi-tenant scrape proxy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use multitude::cache::run_sweeper;
use multitude::{Dispatcher, HttpServer, ProbeExporterFactory, ProxyConfig, ProxyError};

/// Multi-tenant scrape proxy keeping one exporter per target.
#[derive(Parser, Debug)]
#[command(name = "multitude")]
#[command(about = "Serve per-target database exporters behind one scrape endpoint")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(long, env = "MULTITUDE_CONFIG", default_value = "./config/config.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long = "web.listen-address", env = "LISTEN_ADDRESS")]
    listen: Option<String>,

    /// Scrape endpoint path (overrides config).
    #[arg(long = "web.telemetry-path", env = "TELEMETRY_PATH")]
    telemetry_path: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long = "log.level", env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable all collectors.
    #[arg(long)]
    collect_all: bool,
}

fn load_config(args: &Args) -> Result<ProxyConfig, ProxyError> {
    let mut config = ProxyConfig::load_from_file(&args.config).map_err(|e| {
        ProxyError::config(format!("{}: {}", args.config.display(), e))
    })?;

    if let Some(listen) = &args.listen {
        config.web.listen = listen.clone();
    }
    if let Some(path) = &args.telemetry_path {
        config.web.telemetry_path = path.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.collect_all {
        config.collectors.collect_all = true;
    }

    config
        .validate()
        .map_err(|e| ProxyError::config(e.to_string()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;

    multitude_common::init_tracing(&config.logging).map_err(ProxyError::from)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting multitude"
    );

    if let Some(tls_config) = &config.web.tls_config {
        warn!(
            path = %tls_config.display(),
            "TLS config is passed to exporters only; the listener serves plain HTTP"
        );
    }

    let listen_addr: SocketAddr = config
        .web
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.web.listen))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let policy = config.eviction.policy();
    let sweep_interval = config.eviction.sweep_interval();
    let dispatcher = Arc::new(Dispatcher::new(ProbeExporterFactory, config));
    let cache = dispatcher.cache().clone();

    // Start eviction sweeper
    let sweeper_task = if policy.is_noop() {
        None
    } else {
        info!(?policy, interval = ?sweep_interval, "Starting eviction sweeper");
        Some(tokio::spawn(run_sweeper(
            cache.clone(),
            policy,
            sweep_interval,
            shutdown_rx.clone(),
        )))
    };

    // Start HTTP server
    let http_server = HttpServer::new(dispatcher, listen_addr);
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_task.await;
        if let Some(task) = sweeper_task {
            let _ = task.await;
        }
    })
    .await;

    let stats = cache.stats();
    info!(
        targets = cache.count(),
        hits = stats.hits,
        constructions = stats.constructions,
        construction_failures = stats.construction_failures,
        evictions = stats.evictions,
        "Final statistics"
    );

    info!("Proxy stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
