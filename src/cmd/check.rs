//! Configuration check command
//!
//! Builds the plugin chain exactly as `serve` would, without binding any
//! socket, and prints what would be installed.

use crate::config::FileConfig;
use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use metalrelay_dhcp::PluginChain;
use metalrelay_store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the YAML config file
    #[arg(short, long)]
    pub config: PathBuf,
}

pub async fn run_check(args: CheckArgs) -> Result<()> {
    let file = FileConfig::load(&args.config)?;
    let subnets = file.seed_subnets()?;
    let chain = PluginChain::from_config(&file.responder, Arc::new(MemoryStore::new()))
        .wrap_err("invalid plugin configuration")?;

    let server = &file.responder.server;
    println!("Config: {}", args.config.display());
    println!("Namespace: {}", file.responder.namespace);
    println!("Server identifier: {}", server.server_ip);
    println!(
        "Listeners: v4={} v6={}",
        server.listen_v4.map_or("off".to_string(), |a| a.to_string()),
        server.listen_v6.map_or("off".to_string(), |a| a.to_string()),
    );
    if chain.is_empty() {
        println!("Plugins: (none)");
    } else {
        println!("Plugins: {}", chain.names().join(" -> "));
    }
    if !subnets.is_empty() {
        println!("Seed subnets: {}", subnets.len());
    }
    Ok(())
}
