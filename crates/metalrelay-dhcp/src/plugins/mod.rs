//! Request plugins
//!
//! Each plugin sees every request in chain order together with the reply
//! built so far, and returns a [`Verdict`]:
//!
//! - `Continue(reply)` hands the (possibly augmented) reply to the next plugin
//! - `Drop` stops the chain silently; the request was not ours to answer
//! - `Error(cause)` stops the chain; the request failed and gets no reply
//!
//! Plugins only touch the reply after their reservation has reached a
//! terminal state, so a failed request never leaves a half-filled reply.

mod ipam;
mod metal;
mod oob;
mod onmetal;

pub use ipam::IpamPlugin;
pub use metal::MetalPlugin;
pub use oob::OobPlugin;
pub use onmetal::OnmetalPlugin;

use crate::config::{Config, PluginConfig};
use crate::endpoint::{EndpointPublisher, OnboardingStrategy};
use crate::error::{DhcpError, Result};
use crate::packet::{DhcpRequest, Dhcpv6Packet, RelayedRequest};
use crate::reservation::ReservationManager;
use crate::subnet::{SubnetSelector, SubnetSource};
use async_trait::async_trait;
use dhcproto::{v4, v6};
use metalrelay_store::ResourceStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one plugin for one request
#[derive(Debug)]
pub enum Verdict<R> {
    Continue(R),
    Drop,
    Error(DhcpError),
}

impl<R> Verdict<R> {
    /// The reply, if the chain should go on
    pub fn continued(self) -> Option<R> {
        match self {
            Verdict::Continue(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Verdict::Drop)
    }
}

/// A request handler in the chain
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name, as used in configuration
    fn name(&self) -> &str;

    /// Handle a DHCPv4 request; plugins without v4 support pass through
    async fn handle_v4(&self, request: &DhcpRequest, reply: v4::Message) -> Verdict<v4::Message> {
        let _ = request;
        Verdict::Continue(reply)
    }

    /// Handle a DHCPv6 datagram; plugins without v6 support pass through
    async fn handle_v6(&self, packet: &Dhcpv6Packet, reply: v6::Message) -> Verdict<v6::Message> {
        let _ = packet;
        Verdict::Continue(reply)
    }
}

/// Unwrap the relay chain, logging why not when that fails
pub(crate) fn decapsulate(plugin: &str, packet: &Dhcpv6Packet) -> Option<RelayedRequest> {
    match RelayedRequest::decapsulate(packet) {
        Ok(request) => Some(request),
        Err(e) => {
            debug!(plugin, error = %e, "Cannot process message, dropping");
            None
        }
    }
}

/// Plugins in configuration order
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate every configured plugin
    ///
    /// Any configuration error aborts setup; nothing is installed.
    pub fn from_config(config: &Config, store: Arc<dyn ResourceStore>) -> Result<Self> {
        let wait = config.wait.validate()?;
        let namespace = config.namespace.as_str();
        let manager = Arc::new(ReservationManager::new(store.clone(), namespace, wait));

        let mut chain = Self::new();
        for entry in &config.plugins {
            let plugin: Arc<dyn Plugin> = match entry {
                PluginConfig::Ipam(c) => {
                    c.validate()?;
                    Arc::new(IpamPlugin::new(
                        manager.clone(),
                        SubnetSelector::new(
                            store.clone(),
                            namespace,
                            SubnetSource::Named(c.subnets.clone()),
                        ),
                    ))
                }
                PluginConfig::Metal(c) => Arc::new(MetalPlugin::new(
                    manager.clone(),
                    SubnetSelector::new(
                        store.clone(),
                        namespace,
                        SubnetSource::Named(c.subnets.clone()),
                    ),
                    EndpointPublisher::new(
                        store.clone(),
                        namespace,
                        OnboardingStrategy::from_config(c)?,
                    ),
                )),
                PluginConfig::Oob(c) => Arc::new(OobPlugin::new(
                    manager.clone(),
                    SubnetSelector::new(
                        store.clone(),
                        namespace,
                        SubnetSource::Labeled(c.selector()?),
                    ),
                    c.lease_time_secs,
                )),
                PluginConfig::Onmetal(c) => Arc::new(OnmetalPlugin::new(
                    c.delegation_length()?,
                    c.preferred_lifetime_secs,
                    c.valid_lifetime_secs,
                )),
            };
            info!(plugin = entry.name(), "Installed plugin");
            chain.push(plugin);
        }
        Ok(chain)
    }

    pub fn push(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run a DHCPv4 request through every plugin
    pub async fn handle_v4(
        &self,
        request: &DhcpRequest,
        reply: v4::Message,
    ) -> Verdict<v4::Message> {
        let mut reply = reply;
        for plugin in &self.plugins {
            match plugin.handle_v4(request, reply).await {
                Verdict::Continue(next) => reply = next,
                Verdict::Drop => {
                    debug!(plugin = plugin.name(), mac = %request.mac, "Request dropped");
                    return Verdict::Drop;
                }
                Verdict::Error(e) => {
                    warn!(plugin = plugin.name(), mac = %request.mac, error = %e, "Plugin failed");
                    return Verdict::Error(e);
                }
            }
        }
        Verdict::Continue(reply)
    }

    /// Run a DHCPv6 datagram through every plugin
    pub async fn handle_v6(
        &self,
        packet: &Dhcpv6Packet,
        reply: v6::Message,
    ) -> Verdict<v6::Message> {
        let mut reply = reply;
        for plugin in &self.plugins {
            match plugin.handle_v6(packet, reply).await {
                Verdict::Continue(next) => reply = next,
                Verdict::Drop => {
                    debug!(plugin = plugin.name(), "Request dropped");
                    return Verdict::Drop;
                }
                Verdict::Error(e) => {
                    warn!(plugin = plugin.name(), error = %e, "Plugin failed");
                    return Verdict::Error(e);
                }
            }
        }
        Verdict::Continue(reply)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IpamConfig, MetalConfig, OnmetalConfig, WaitSettings};
    use metalrelay_store::MemoryStore;

    struct Dropper;

    #[async_trait]
    impl Plugin for Dropper {
        fn name(&self) -> &str {
            "dropper"
        }

        async fn handle_v6(
            &self,
            _packet: &Dhcpv6Packet,
            _reply: v6::Message,
        ) -> Verdict<v6::Message> {
            Verdict::Drop
        }
    }

    struct Passthrough;

    #[async_trait]
    impl Plugin for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }
    }

    fn config(plugins: Vec<PluginConfig>) -> Config {
        Config {
            namespace: "default".to_string(),
            server: Default::default(),
            wait: WaitSettings::default(),
            plugins,
        }
    }

    #[test]
    fn test_chain_from_config_keeps_order() {
        let store = Arc::new(MemoryStore::new());
        let mut metal = MetalConfig::default();
        metal
            .inventory
            .insert("aa:bb:cc:dd:ee:ff".to_string(), "server-01".to_string());

        let chain = PluginChain::from_config(
            &config(vec![
                PluginConfig::Onmetal(OnmetalConfig {
                    prefix_delegation_length: 80,
                    preferred_lifetime_secs: 60,
                    valid_lifetime_secs: 120,
                }),
                PluginConfig::Metal(metal),
                PluginConfig::Ipam(IpamConfig {
                    subnets: vec!["a".to_string()],
                }),
            ]),
            store,
        )
        .unwrap();
        assert_eq!(chain.names(), vec!["onmetal", "metal", "ipam"]);
    }

    #[test]
    fn test_invalid_plugin_config_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        for plugin in [
            PluginConfig::Onmetal(OnmetalConfig {
                prefix_delegation_length: 0,
                preferred_lifetime_secs: 60,
                valid_lifetime_secs: 120,
            }),
            PluginConfig::Onmetal(OnmetalConfig {
                prefix_delegation_length: 128,
                preferred_lifetime_secs: 60,
                valid_lifetime_secs: 120,
            }),
            PluginConfig::Ipam(IpamConfig { subnets: vec![] }),
            PluginConfig::Metal(MetalConfig::default()),
        ] {
            let result = PluginChain::from_config(&config(vec![plugin]), store.clone());
            assert!(matches!(result, Err(DhcpError::ConfigError(_))));
        }
    }

    #[tokio::test]
    async fn test_drop_stops_the_chain() {
        let mut chain = PluginChain::new();
        chain.push(Arc::new(Passthrough));
        chain.push(Arc::new(Dropper));
        assert_eq!(chain.len(), 2);

        let bytes = crate::packet::testing::solicit(&[]);
        let packet = Dhcpv6Packet::parse(&bytes).unwrap();
        let reply = v6::Message::new(v6::MessageType::Reply);
        assert!(chain.handle_v6(&packet, reply).await.is_drop());
    }

    #[tokio::test]
    async fn test_default_handlers_pass_through() {
        let mut chain = PluginChain::new();
        chain.push(Arc::new(Passthrough));

        let message = crate::packet::testing::v4_message(
            "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            v4::MessageType::Discover,
        );
        let request = crate::packet::testing::v4_request(message);
        let reply = v4::Message::default();
        assert!(chain.handle_v4(&request, reply).await.continued().is_some());
    }
}
