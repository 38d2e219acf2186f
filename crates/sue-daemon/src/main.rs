//! sue-daemon entry point.
//!
//! Loads configuration, checks the inventory is reachable, starts the
//! metrics scheduler and serves the HTTP endpoints. Handlers live in
//! `routes.rs`, the update loop in `scheduler.rs`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use sue_agg::Aggregator;
use sue_daemon::{metrics::MetricsUpdater, routes, scheduler, state};
use sue_du::local::LocalInventoryReader;
use sue_du::Reader;
use tokio::{signal, sync::watch};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "sue-daemon")]
#[command(about = "Exports blob inventory storage usage as Prometheus metrics", long_about = None)]
struct Cli {
    /// Config file(s); later files are merged over earlier ones.
    #[arg(long = "config", env = "CONFIG", required = true, value_delimiter = ',')]
    config: Vec<PathBuf>,

    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: SocketAddr,

    /// Overrides `inventory.root` from the config file.
    #[arg(long, env = "INVENTORY_ROOT")]
    inventory_root: Option<PathBuf>,

    #[arg(long, env = "UPDATE_INTERVAL_SECS", default_value_t = 3600)]
    update_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();

    let loaded =
        sue_config::load_layered_yaml(cli.config.as_slice()).context("loading config failed")?;
    info!(config_hash = %loaded.config_hash, files = ?cli.config, "config loaded");
    let mut config = loaded.config;
    if let Some(root) = cli.inventory_root {
        config.override_inventory_root(root);
    }
    let inventory = config.inventory()?.clone();
    let max_rows = inventory.max_rows;

    let reader = LocalInventoryReader::new(inventory);
    reader
        .test_connection()
        .await
        .context("inventory is not reachable")?;
    info!(
        reader = reader.name(),
        storage_account = %reader.storage_account_name(),
        "inventory reachable"
    );

    let aggregator = Aggregator::new(Arc::new(reader), config.labels, config.rules)
        .context("invalid aggregation config")?
        .with_max_rows(max_rows);

    let registry = Registry::new();
    let updater = MetricsUpdater::new(Arc::new(aggregator), &config.metrics, &registry)?;
    let shared = Arc::new(state::AppState::new(registry));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = scheduler::spawn_scheduler(
        updater,
        Arc::clone(&shared),
        Duration::from_secs(cli.update_interval_secs),
        shutdown_rx,
    );

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    info!("sue-daemon listening on http://{}", cli.bind_address);
    let listener = tokio::net::TcpListener::bind(cli.bind_address)
        .await
        .with_context(|| format!("binding {} failed", cli.bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = scheduler.await {
        warn!(error = %err, "metrics scheduler did not stop cleanly");
    }

    info!("sue-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler installation failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler installation failed");
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

    info!("shutdown signal received");
}
