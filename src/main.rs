//! CLI for popmq
//!
//! Subcommands:
//! - `server`: run the broker with its WebSocket front end

use std::sync::Arc;

use clap::Parser;
use popmq::Broker;
use popmq::config::{DEFAULT_CONFIG_PATH, Settings, StorageBackend, load_config_from};
use popmq::persistence::{MemoryStore, MessageStore, SledStore};
use popmq::transport::websocket::start_websocket_server;
use popmq::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popmq")]
enum Command {
    /// Start the broker and its WebSocket server
    Server {
        /// Configuration file, without extension (default: config/default)
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cmd = Command::parse();

    match cmd {
        Command::Server { config } => {
            if let Err(e) = run_server(config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH)).await {
                // no-op when the configured subscriber is already installed
                logging::init("info");
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn open_store(settings: &Settings) -> Result<Arc<dyn MessageStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn MessageStore> = match settings.storage.backend {
        StorageBackend::Sled => Arc::new(SledStore::open(
            &settings.storage.path,
            settings.storage.flush_every_write,
        )?),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    info!(backend = ?settings.storage.backend, path = %settings.storage.path, "message store ready");
    Ok(store)
}

async fn run_server(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config_from(config_path)?;
    logging::init(&config.logging.level);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let store = open_store(&config)?;
    let broker = Broker::open(config.broker.clone(), store)?;

    tokio::spawn(broker.clone().run_sweeper());

    tokio::select! {
        result = start_websocket_server(&addr, broker) => {
            result?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}
