//! Relay Storage Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! relay-storage
//!
//! # Start with custom config
//! relay-storage --config /path/to/config.toml
//!
//! # Time-based handles, SQLite index, admin API enabled
//! RELAY_ADMIN_TOKEN=secret relay-storage --handle-strategy time --index-backend sqlite
//! ```

use anyhow::Context;
use clap::Parser;
use relay_storage::{Config, HandleStrategy, HttpServer, IndexBackend, RelayStore, RetentionSweeper};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-storage")]
#[command(about = "Ephemeral file relay with bounded retention")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "RELAY_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Address to bind the HTTP API to
    #[arg(long)]
    bind_address: Option<String>,

    /// Base URL for returned download links
    #[arg(long, env = "RELAY_PUBLIC_URL")]
    public_url: Option<String>,

    /// Handle derivation
    #[arg(long, value_enum)]
    handle_strategy: Option<HandleStrategy>,

    /// Metadata index backend
    #[arg(long, value_enum)]
    index_backend: Option<IndexBackend>,

    /// Bearer token enabling the /admin routes
    #[arg(long, env = "RELAY_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("relay_storage=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(addr) = args.bind_address {
        config.bind_address = addr;
    }
    if let Some(url) = args.public_url {
        config.public_url = url;
    }
    if let Some(strategy) = args.handle_strategy {
        config.handle_strategy = strategy;
    }
    if let Some(backend) = args.index_backend {
        config.index_backend = backend;
    }
    if args.admin_token.is_some() {
        config.admin_token = args.admin_token;
    }
    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        "Starting relay-storage"
    );

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.storage_dir.display()))?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        let mut persisted = config.clone();
        persisted.admin_token = None;
        match persisted.save(&config_path) {
            Ok(()) => info!(path = %config_path.display(), "Created default config"),
            Err(e) => warn!(path = %config_path.display(), error = %e, "Failed to write default config"),
        }
    }

    let store = Arc::new(
        RelayStore::open(&config)
            .await
            .context("Failed to open relay store")?,
    );

    // Retention sweeper
    let sweeper = Arc::new(RetentionSweeper::new(store.clone(), config.sweep_interval()));
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let sweeper_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run(shutdown_rx).await })
    };

    let http_addr: SocketAddr = format!("{}:{}", config.bind_address, config.http_port)
        .parse()
        .context("Invalid bind address")?;
    let public_url = url::Url::parse(&config.public_url).context("Invalid public_url")?;
    let http_server = Arc::new(
        HttpServer::new(store.clone(), http_addr, public_url)
            .with_admin_token(config.admin_token.clone())
            .with_require_content_length(config.require_content_length)
            .with_sweeper(sweeper),
    );

    info!("HTTP API available at http://{}", http_addr);
    if config.admin_token.is_none() {
        info!("Admin routes disabled (set RELAY_ADMIN_TOKEN to enable)");
    }
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    // Stop the sweeper
    let _ = shutdown_tx.send(());
    let _ = sweeper_handle.await;

    if let Err(e) = store.index().flush() {
        error!(error = %e, "Failed to flush metadata index");
    }

    // Print stats before exit
    match store.object_count() {
        Ok(objects) => info!(objects = objects, "Final storage stats"),
        Err(e) => warn!(error = %e, "Failed to read final stats"),
    }

    Ok(())
}
