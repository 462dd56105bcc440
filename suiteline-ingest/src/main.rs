//! suiteline-ingest: accepts test runner connections and records their
//! suites into a local document store.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::info;
use tokio::sync::watch;

use suiteline_ingest::{Detachment, IngestServer, ServerConfig};
use suiteline_store::{DocumentStore, StoreConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TrackerKind {
    /// Window judged from `disconnected_at` on the suite document
    Persisted,
    /// Window kept in memory, swept periodically
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "suiteline-ingest", version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:7070")]
    bind: String,
    #[arg(long, default_value = "suiteline_data")]
    data_dir: PathBuf,
    #[arg(long, default_value_t = 300)]
    reconnect_ttl_secs: u64,
    #[arg(long, default_value_t = 10_000)]
    op_timeout_ms: u64,
    #[arg(long, value_enum, default_value_t = TrackerKind::Persisted)]
    tracker: TrackerKind,
    #[arg(long, default_value_t = 30)]
    sweep_interval_secs: u64,
    #[arg(long)]
    max_line_bytes: Option<usize>,
    /// Log every store change at info level
    #[arg(long)]
    log_changes: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let store = Arc::new(DocumentStore::open(StoreConfig {
        path: args.data_dir.clone(),
        ..StoreConfig::default()
    })?);

    if args.log_changes {
        let changes = store.changes();
        // A slow reader here stalls every store write
        thread::Builder::new()
            .name("change-log".into())
            .spawn(move || {
                while let Ok(change) = changes.recv() {
                    info!(
                        "{:?} {}/{} {}",
                        change.operation,
                        change.collection,
                        change.doc_id,
                        change
                            .changed_fields
                            .as_ref()
                            .map(|f| serde_json::Value::Object(f.clone()).to_string())
                            .unwrap_or_default()
                    );
                }
            })?;
    }

    let mut config = ServerConfig {
        bind_addr: args.bind,
        op_timeout: Duration::from_millis(args.op_timeout_ms),
        reconnect_ttl: Duration::from_secs(args.reconnect_ttl_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        ..ServerConfig::default()
    };
    if let Some(max) = args.max_line_bytes {
        config.max_line_bytes = max;
    }

    let detachment = match args.tracker {
        TrackerKind::Persisted => Detachment::Persisted,
        TrackerKind::Memory => Detachment::memory(),
    };
    let server = IngestServer::new(config, store.clone()).with_detachment(detachment);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => log::error!("Cannot listen for Ctrl-C: {e}"),
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    store.sync()?;
    info!("Store flushed to {}", store.path().display());
    Ok(())
}
