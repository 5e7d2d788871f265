//! Quire relay binary.
//!
//! Hosts one remote store over WebSocket for any number of document
//! sessions. Without `--storage` everything lives in memory and is lost on
//! exit; with it, documents, presence and history are kept in RocksDB.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;
use quire_collab::relay::{RelayConfig, RelayServer};
use quire_collab::store::{MemoryStore, RemoteStore, RocksStore, StoreConfig};

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "quire-relay")]
#[command(about = "WebSocket relay for Quire document sessions")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; in-memory when omitted
    #[arg(short, long, value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Notifications buffered per connection
    #[arg(long, default_value_t = 256)]
    outgoing_capacity: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind.clone(),
            outgoing_capacity: self.outgoing_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("Starting Quire relay...");

    let store: Arc<dyn RemoteStore> = match &args.storage {
        Some(path) => {
            let store = RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            info!(
                "Opened RocksDB store at {} ({} document(s))",
                path.display(),
                store.list_documents()?.len()
            );
            Arc::new(store)
        }
        None => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let server = RelayServer::new(args.relay_config(), store);
    let listener = server.bind().await?;

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "Shutting down after {} connection(s), {} request(s)",
                stats.total_connections, stats.total_requests
            );
        }
    }

    Ok(())
}
