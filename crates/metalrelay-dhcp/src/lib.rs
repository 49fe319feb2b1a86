//! metalrelay DHCP responder
//!
//! Answers relayed DHCPv4 and DHCPv6 requests for bare metal fleets. Each
//! request runs through a configured chain of plugins that derive the
//! client's address, reserve it with the IPAM controller through the
//! resource store, and publish the machine's endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 DhcpServer                          │
//! │   UDP :67 (v4)  |  UDP :547 (v6, relayed)           │
//! │                       │                             │
//! │                       ▼                             │
//! │  ┌───────────────────────────────────────────────┐  │
//! │  │            PluginChain                        │  │
//! │  │   ipam | metal | oob | onmetal                │  │
//! │  │   Verdict: Continue | Drop | Error            │  │
//! │  └───────────────────────────────────────────────┘  │
//! │        │               │                │           │
//! │        ▼               ▼                ▼           │
//! │   derive::*     SubnetSelector   ReservationManager │
//! │                                 EndpointPublisher   │
//! │                       │                             │
//! │                       ▼                             │
//! │               ResourceStore                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use metalrelay_dhcp::{Config, DhcpServer, PluginChain};
//! use metalrelay_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let config: Config = serde_yaml::from_str(&yaml)?;
//! let chain = PluginChain::from_config(&config, Arc::new(MemoryStore::new()))?;
//! let server = DhcpServer::new(config.server.clone(), Arc::new(chain));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! server.run(shutdown_rx).await?;
//! ```

pub mod config;
pub mod derive;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod plugins;
pub mod reservation;
pub mod server;
pub mod subnet;

pub use config::*;
pub use error::*;
pub use plugins::{Plugin, PluginChain, Verdict};
pub use server::*;
