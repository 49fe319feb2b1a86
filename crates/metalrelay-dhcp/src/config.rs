//! Responder configuration
//!
//! These types are deserialized once at startup, validated, and turned into
//! immutable plugin objects. Anything malformed here is fatal at setup:
//! a plugin with a bad configuration is never installed.

use crate::derive::DelegationLength;
use crate::error::{DhcpError, Result};
use metalrelay_crd::{LabelSelector, MacAddr};
use metalrelay_store::WaitStrategy;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Top-level responder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Namespace holding subnets, reservations and endpoints
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub wait: WaitSettings,

    /// Plugins in chain order
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// DHCPv4 listen address; `None` disables the v4 listener
    #[serde(default = "default_listen_v4")]
    pub listen_v4: Option<SocketAddr>,

    /// DHCPv6 listen address; `None` disables the v6 listener
    #[serde(default = "default_listen_v6")]
    pub listen_v6: Option<SocketAddr>,

    /// Server identifier placed in DHCPv4 replies
    #[serde(default = "default_server_ip")]
    pub server_ip: Ipv4Addr,
}

fn default_listen_v4() -> Option<SocketAddr> {
    Some(SocketAddr::from(([0, 0, 0, 0], 67)))
}

fn default_listen_v6() -> Option<SocketAddr> {
    Some(SocketAddr::from(([0u16; 8], 547)))
}

fn default_server_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_v4: default_listen_v4(),
            listen_v6: default_listen_v6(),
            server_ip: default_server_ip(),
        }
    }
}

impl ServerConfig {
    /// Create a server config with a server identifier
    pub fn new(server_ip: Ipv4Addr) -> Self {
        Self {
            server_ip,
            ..Default::default()
        }
    }

    /// Set the DHCPv4 listen address
    pub fn with_listen_v4(mut self, addr: Option<SocketAddr>) -> Self {
        self.listen_v4 = addr;
        self
    }

    /// Set the DHCPv6 listen address
    pub fn with_listen_v6(mut self, addr: Option<SocketAddr>) -> Self {
        self.listen_v6 = addr;
        self
    }
}

/// Which wait implementation to use
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    #[default]
    Poll,
    Watch,
}

/// Bounded wait settings as written in the config file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WaitSettings {
    pub strategy: WaitKind,
    pub poll_interval_ms: u64,
    pub reservation_timeout_secs: u64,
    pub deletion_timeout_secs: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            strategy: WaitKind::Poll,
            poll_interval_ms: 250,
            reservation_timeout_secs: 10,
            deletion_timeout_secs: 5,
        }
    }
}

/// Validated wait settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub strategy: WaitStrategy,

    /// Ceiling for a new reservation to reach a terminal state
    pub reservation_timeout: Duration,

    /// Ceiling for a deleted reservation to disappear
    pub deletion_timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        WaitConfig {
            strategy: WaitStrategy::default(),
            reservation_timeout: Duration::from_secs(10),
            deletion_timeout: Duration::from_secs(5),
        }
    }
}

impl WaitSettings {
    pub fn validate(&self) -> Result<WaitConfig> {
        if self.reservation_timeout_secs == 0 || self.deletion_timeout_secs == 0 {
            return Err(DhcpError::ConfigError(
                "wait timeouts must be at least one second".to_string(),
            ));
        }
        let strategy = match self.strategy {
            WaitKind::Poll => {
                if self.poll_interval_ms == 0 {
                    return Err(DhcpError::ConfigError(
                        "wait.poll_interval_ms must be positive".to_string(),
                    ));
                }
                WaitStrategy::Poll {
                    interval: Duration::from_millis(self.poll_interval_ms),
                }
            }
            WaitKind::Watch => WaitStrategy::Watch,
        };
        Ok(WaitConfig {
            strategy,
            reservation_timeout: Duration::from_secs(self.reservation_timeout_secs),
            deletion_timeout: Duration::from_secs(self.deletion_timeout_secs),
        })
    }
}

/// One entry of the plugin chain
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginConfig {
    Ipam(IpamConfig),
    Metal(MetalConfig),
    Oob(OobConfig),
    Onmetal(OnmetalConfig),
}

impl PluginConfig {
    pub fn name(&self) -> &'static str {
        match self {
            PluginConfig::Ipam(_) => "ipam",
            PluginConfig::Metal(_) => "metal",
            PluginConfig::Oob(_) => "oob",
            PluginConfig::Onmetal(_) => "onmetal",
        }
    }
}

/// IPAM plugin: reservations for relayed DHCPv6 clients
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpamConfig {
    /// Candidate subnets, tried in order
    pub subnets: Vec<String>,
}

impl IpamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subnets.is_empty() {
            return Err(DhcpError::ConfigError(
                "ipam: at least one subnet is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metal plugin: reservations plus endpoint publishing
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MetalConfig {
    /// Candidate subnets; empty means publish the client's own address
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Static inventory, MAC → endpoint name
    #[serde(default)]
    pub inventory: HashMap<String, String>,

    /// MAC-prefix filter for dynamic onboarding
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

/// MAC-prefix table with an optional naming prefix
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub mac_prefixes: Vec<String>,

    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

fn default_name_prefix() -> String {
    "compute-".to_string()
}

impl MetalConfig {
    /// Parse the static inventory
    pub fn parse_inventory(&self) -> Result<HashMap<MacAddr, String>> {
        self.inventory
            .iter()
            .map(|(mac, name)| {
                let mac: MacAddr = mac
                    .parse()
                    .map_err(|e| DhcpError::ConfigError(format!("metal inventory: {}", e)))?;
                if name.is_empty() {
                    return Err(DhcpError::ConfigError(format!(
                        "metal inventory: empty name for {}",
                        mac
                    )));
                }
                Ok((mac, name.clone()))
            })
            .collect()
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mac_prefixes.is_empty() {
            return Err(DhcpError::ConfigError(
                "metal filter: at least one MAC prefix is required".to_string(),
            ));
        }
        for prefix in &self.mac_prefixes {
            let digits: String = prefix.chars().filter(|c| *c != ':' && *c != '-').collect();
            if digits.is_empty()
                || digits.len() > 12
                || !digits.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(DhcpError::ConfigError(format!(
                    "metal filter: invalid MAC prefix '{}'",
                    prefix
                )));
            }
        }
        Ok(())
    }
}

/// Out-of-band plugin: leases from label-discovered subnets
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OobConfig {
    /// Label selector (`key=value[,key=value]`) for candidate subnets
    pub subnet_label: String,

    #[serde(default = "default_lease_time")]
    pub lease_time_secs: u32,
}

fn default_lease_time() -> u32 {
    3600
}

impl OobConfig {
    pub fn selector(&self) -> Result<LabelSelector> {
        self.subnet_label
            .parse()
            .map_err(|e| DhcpError::ConfigError(format!("oob: {}", e)))
    }
}

/// Legacy onmetal plugin: link-derived address and delegated prefix
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnmetalConfig {
    /// Default delegated prefix length, in [1, 127]
    #[serde(default = "default_delegation_length")]
    pub prefix_delegation_length: u8,

    #[serde(default = "default_preferred_lifetime")]
    pub preferred_lifetime_secs: u32,

    #[serde(default = "default_valid_lifetime")]
    pub valid_lifetime_secs: u32,
}

fn default_delegation_length() -> u8 {
    80
}

fn default_preferred_lifetime() -> u32 {
    3600
}

fn default_valid_lifetime() -> u32 {
    7200
}

impl OnmetalConfig {
    pub fn delegation_length(&self) -> Result<DelegationLength> {
        DelegationLength::new(self.prefix_delegation_length)
    }
}
