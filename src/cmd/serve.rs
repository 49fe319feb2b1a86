//! Serve command
//!
//! Runs the responder against an in-memory store seeded from the config
//! file, until Ctrl+C.

use crate::config::FileConfig;
use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use metalrelay_dhcp::{DhcpEvent, DhcpServer, PluginChain};
use metalrelay_store::{MemoryStore, PoolAllocator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to the YAML config file
    #[arg(short, long)]
    pub config: PathBuf,
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let file = FileConfig::load(&args.config)?;
    let store = Arc::new(MemoryStore::new());
    let seeded = file.seed_store(store.as_ref()).await?;

    let chain = PluginChain::from_config(&file.responder, store.clone())
        .wrap_err("invalid plugin configuration")?;
    info!(
        namespace = %file.responder.namespace,
        plugins = ?chain.names(),
        seeded,
        "Plugin chain ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if file.dev_allocator {
        let allocator = PoolAllocator::new(store.clone(), file.responder.namespace.clone());
        tokio::spawn(allocator.run(shutdown_rx.clone()));
    } else {
        warn!("No allocator running; reservations wait for an external controller");
    }

    let server = DhcpServer::new(file.responder.server.clone(), Arc::new(chain));
    tokio::spawn(log_events(server.subscribe()));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    server.run(shutdown_rx).await?;
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<DhcpEvent>) {
    loop {
        match events.recv().await {
            Ok(DhcpEvent::Stopped) => break,
            Ok(DhcpEvent::Error { mac, error }) => {
                warn!(mac = ?mac, error = %error, "Request failed");
            }
            Ok(event) => debug!(event = ?event, "DHCP event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "Event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
