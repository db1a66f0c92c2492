//! # relay
//!
//! Chat relay binary: loads settings, connects the broker and store
//! collaborators, and serves WebSocket clients until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_broker::{BrokerTransport, MemoryBroker};
use relay_server::metrics::install_recorder;
use relay_server::{JwtAuthenticator, RelayNode, RelayServer};
use relay_settings::{BrokerBackend, BrokerSettings, RelaySettings, StoreBackend, StoreSettings};
use relay_store::{ChatStore, Database, MemoryPresence, MemoryStore, PresenceSet, SqlitePresence, SqliteStore};

/// Chat relay server.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time chat relay")]
struct Cli {
    /// Path to a JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Node id used for the consumer group and presence ownership (overrides settings).
    #[arg(long)]
    node_id: Option<String>,
}

fn load_settings(cli: &Cli) -> Result<RelaySettings> {
    let mut settings = relay_settings::load_settings_from_path(cli.config.as_deref())
        .context("Failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(node_id) = &cli.node_id {
        settings.broker.node_id.clone_from(node_id);
    }
    Ok(settings)
}

async fn connect_broker(settings: &BrokerSettings) -> Result<Arc<dyn BrokerTransport>> {
    match settings.backend {
        BrokerBackend::Memory => {
            tracing::warn!("using in-process broker; messages will not cross processes");
            Ok(Arc::new(MemoryBroker::new()))
        }
        #[cfg(feature = "kafka")]
        BrokerBackend::Kafka => {
            let transport = relay_broker::KafkaTransport::connect(settings)
                .await
                .with_context(|| format!("Failed to connect to Kafka at {}", settings.bootstrap_servers.join(",")))?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(feature = "kafka"))]
        BrokerBackend::Kafka => anyhow::bail!("kafka backend requested but this build lacks the `kafka` feature"),
    }
}

fn open_store(settings: &StoreSettings) -> Result<(Arc<dyn ChatStore>, Arc<dyn PresenceSet>)> {
    match settings.backend {
        StoreBackend::Memory => Ok((Arc::new(MemoryStore::new()), Arc::new(MemoryPresence::new()))),
        StoreBackend::Sqlite => {
            let db = Database::open(Path::new(&settings.path))
                .with_context(|| format!("Failed to open database at {}", settings.path))?;
            Ok((Arc::new(SqliteStore::new(db.clone())), Arc::new(SqlitePresence::new(db))))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    relay_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = install_recorder().context("Failed to install metrics recorder")?;
    let transport = connect_broker(&settings.broker).await?;
    let (store, presence) = open_store(&settings.store)?;

    let node = Arc::new(RelayNode::new(&settings, transport, store, presence));
    let _subscriptions = node.start().await;

    let auth = Arc::new(JwtAuthenticator::from_settings(&settings.auth));
    let server = RelayServer::new(settings.server.clone(), Arc::clone(&node), auth, metrics);
    let addr = server.listen().await.context("Failed to bind server")?;
    server
        .shutdown()
        .track("sweeper", node.spawn_sweeper(server.shutdown().token()));

    tracing::info!(node_id = node.node_id(), "relay listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    node.registry().close_all().await;
    let report = server
        .shutdown()
        .graceful_shutdown(Some(settings.server.shutdown_timeout()))
        .await;
    if !report.aborted.is_empty() {
        tracing::warn!(aborted = ?report.aborted, "some tasks were aborted");
    }
    node.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
