//! Endpoint publishing
//!
//! Two onboarding strategies decide how a machine's endpoint record is
//! named and reconciled. The strategy is chosen once from configuration.

use crate::config::MetalConfig;
use crate::error::{DhcpError, Result};
use metalrelay_crd::{Endpoint, EndpointPatch, LabelSelector, MacAddr};
use metalrelay_store::{Preconditions, ResourceStore, StoreError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of publishing an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Created(String),
    Patched(String),

    /// The endpoint already says what we would write
    AlreadyExists(String),

    /// The MAC is not one of our managed machines
    Unmanaged,
}

/// Known MAC → endpoint name mapping
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    names: HashMap<MacAddr, String>,
}

impl StaticInventory {
    pub fn new(names: HashMap<MacAddr, String>) -> Self {
        Self { names }
    }

    pub fn name_of(&self, mac: &MacAddr) -> Option<&str> {
        self.names.get(mac).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// MAC prefixes of managed machines and the prefix for generated names
#[derive(Debug, Clone)]
pub struct PrefixInventory {
    prefixes: Vec<String>,
    name_prefix: String,
}

impl PrefixInventory {
    pub fn new(prefixes: Vec<String>, name_prefix: impl Into<String>) -> Self {
        Self {
            prefixes,
            name_prefix: name_prefix.into(),
        }
    }

    pub fn matches(&self, mac: &MacAddr) -> bool {
        self.prefixes.iter().any(|p| mac.has_prefix(p))
    }

    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }
}

/// How endpoint names are determined
#[derive(Debug, Clone)]
pub enum OnboardingStrategy {
    /// Names known in advance
    Static(StaticInventory),

    /// Names generated from a prefix on first sight
    Dynamic(PrefixInventory),
}

impl OnboardingStrategy {
    /// Pick the strategy from the metal plugin configuration
    ///
    /// A static inventory wins over a prefix filter.
    pub fn from_config(config: &MetalConfig) -> Result<Self> {
        let inventory = config.parse_inventory()?;
        if !inventory.is_empty() {
            return Ok(OnboardingStrategy::Static(StaticInventory::new(inventory)));
        }
        match &config.filter {
            Some(filter) => {
                filter.validate()?;
                Ok(OnboardingStrategy::Dynamic(PrefixInventory::new(
                    filter.mac_prefixes.clone(),
                    filter.name_prefix.clone(),
                )))
            }
            None => Err(DhcpError::ConfigError(
                "metal: either an inventory or a filter is required".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OnboardingStrategy::Static(_) => "static",
            OnboardingStrategy::Dynamic(_) => "dynamic",
        }
    }

    /// Whether this MAC is one of our machines
    pub fn manages(&self, mac: &MacAddr) -> bool {
        match self {
            OnboardingStrategy::Static(inventory) => inventory.name_of(mac).is_some(),
            OnboardingStrategy::Dynamic(inventory) => inventory.matches(mac),
        }
    }

    /// Reconcile the endpoint for `mac` to carry `address`
    pub async fn apply(
        &self,
        store: &dyn ResourceStore,
        namespace: &str,
        mac: &MacAddr,
        address: IpAddr,
    ) -> Result<PublishOutcome> {
        match self {
            OnboardingStrategy::Static(inventory) => match inventory.name_of(mac) {
                Some(name) => apply_static(store, namespace, name, mac, address).await,
                None => Ok(unmanaged(mac)),
            },
            OnboardingStrategy::Dynamic(inventory) if inventory.matches(mac) => {
                apply_dynamic(store, namespace, inventory.name_prefix(), mac, address).await
            }
            OnboardingStrategy::Dynamic(_) => Ok(unmanaged(mac)),
        }
    }
}

fn unmanaged(mac: &MacAddr) -> PublishOutcome {
    debug!(mac = %mac, "MAC not in inventory, skipping endpoint");
    PublishOutcome::Unmanaged
}

/// Create or patch the endpoint with a known name
///
/// Any other endpoint still holding the MAC, left behind by an inventory
/// rename, is removed first.
async fn apply_static(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    mac: &MacAddr,
    address: IpAddr,
) -> Result<PublishOutcome> {
    let previous = store
        .list_endpoints(namespace, &LabelSelector::everything())
        .await?
        .into_iter()
        .filter(|e| e.spec.mac_address == *mac && e.name() != name);
    for endpoint in previous {
        let preconditions = Preconditions::uid(endpoint.metadata.uid);
        match store
            .delete_endpoint(namespace, endpoint.name(), preconditions)
            .await
        {
            Ok(()) => {
                info!(
                    endpoint = %endpoint.name(),
                    mac = %mac,
                    renamed_to = %name,
                    "Removed endpoint under previous name"
                );
            }
            // Already gone or replaced by someone else
            Err(StoreError::NotFound(_)) | Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    match store.get_endpoint(namespace, name).await? {
        Some(existing)
            if existing.spec.mac_address == *mac && existing.spec.ip == address =>
        {
            debug!(endpoint = %name, mac = %mac, "Endpoint up to date");
            Ok(PublishOutcome::AlreadyExists(name.to_string()))
        }
        Some(_) => {
            let patch = EndpointPatch {
                mac_address: Some(*mac),
                ip: Some(address),
                resource_version: None,
            };
            store.patch_endpoint(namespace, name, &patch).await?;
            info!(endpoint = %name, mac = %mac, ip = %address, "Patched endpoint");
            Ok(PublishOutcome::Patched(name.to_string()))
        }
        None => {
            let endpoint = Endpoint::new(name, namespace, *mac, address);
            match store.create_endpoint(&endpoint).await {
                Ok(_) => {
                    info!(endpoint = %name, mac = %mac, ip = %address, "Created endpoint");
                    Ok(PublishOutcome::Created(name.to_string()))
                }
                Err(StoreError::AlreadyExists(_)) => {
                    debug!(endpoint = %name, "Endpoint created concurrently");
                    Ok(PublishOutcome::AlreadyExists(name.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Find the endpoint by MAC; create it under a generated name if missing
async fn apply_dynamic(
    store: &dyn ResourceStore,
    namespace: &str,
    name_prefix: &str,
    mac: &MacAddr,
    address: IpAddr,
) -> Result<PublishOutcome> {
    let existing = store
        .list_endpoints(namespace, &LabelSelector::everything())
        .await?
        .into_iter()
        .find(|e| e.spec.mac_address == *mac);

    match existing {
        Some(endpoint) if endpoint.spec.ip == address => {
            debug!(endpoint = %endpoint.name(), mac = %mac, "Endpoint already exists");
            Ok(PublishOutcome::AlreadyExists(endpoint.name().to_string()))
        }
        Some(endpoint) => {
            // A concurrent writer surfaces as a conflict; not retried here
            let patch =
                EndpointPatch::ip(address).at_version(endpoint.metadata.resource_version.clone());
            store
                .patch_endpoint(namespace, endpoint.name(), &patch)
                .await?;
            info!(
                endpoint = %endpoint.name(),
                mac = %mac,
                from = %endpoint.spec.ip,
                to = %address,
                "Updated endpoint address"
            );
            Ok(PublishOutcome::Patched(endpoint.name().to_string()))
        }
        None => {
            let created = store
                .create_endpoint(&Endpoint::generated(name_prefix, namespace, *mac, address))
                .await?;
            info!(endpoint = %created.name(), mac = %mac, ip = %address, "Created endpoint");
            Ok(PublishOutcome::Created(created.name().to_string()))
        }
    }
}

/// Publishes endpoints with one strategy into one namespace
pub struct EndpointPublisher {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    strategy: OnboardingStrategy,
}

impl EndpointPublisher {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        namespace: impl Into<String>,
        strategy: OnboardingStrategy,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            strategy,
        }
    }

    pub fn strategy(&self) -> &OnboardingStrategy {
        &self.strategy
    }

    pub fn manages(&self, mac: &MacAddr) -> bool {
        self.strategy.manages(mac)
    }

    pub async fn publish(&self, mac: &MacAddr, address: IpAddr) -> Result<PublishOutcome> {
        self.strategy
            .apply(self.store.as_ref(), &self.namespace, mac, address)
            .await
    }
}
