//! Config file loading
//!
//! The responder settings live at the top level of the YAML file. Two
//! development-only keys sit beside them: `seed` pre-populates the memory
//! store with subnets and `dev_allocator` runs the pool allocator in place
//! of an external IPAM controller.

use color_eyre::eyre::{bail, Result, WrapErr};
use ipnetwork::IpNetwork;
use metalrelay_crd::Subnet;
use metalrelay_dhcp::Config;
use metalrelay_store::ResourceStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub responder: Config,

    #[serde(default)]
    pub seed: Seed,

    #[serde(default)]
    pub dev_allocator: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Seed {
    #[serde(default)]
    pub subnets: Vec<SeedSubnet>,
}

/// A subnet as written under `seed.subnets`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedSubnet {
    pub name: String,
    pub cidr: IpNetwork,
    #[serde(default)]
    pub reserved: Option<IpNetwork>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl SeedSubnet {
    fn to_subnet(&self, namespace: &str) -> Result<Subnet> {
        let mut subnet = Subnet::new(&self.name, namespace, self.cidr);
        if let Some(reserved) = self.reserved {
            if reserved.is_ipv4() != self.cidr.is_ipv4()
                || reserved.prefix() < self.cidr.prefix()
                || !self.cidr.contains(reserved.network())
            {
                bail!("subnet {}: reserved {} is not inside {}", self.name, reserved, self.cidr);
            }
            subnet = subnet.with_reserved(reserved);
        }
        for (key, value) in &self.labels {
            subnet = subnet.with_label(key, value);
        }
        subnet
            .validate()
            .wrap_err_with(|| format!("invalid seed subnet {}", self.name))?;
        Ok(subnet)
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        debug!(path = %path.display(), plugins = config.responder.plugins.len(), "Loaded config");
        Ok(config)
    }

    /// Seed subnets, validated, in the responder's namespace
    pub fn seed_subnets(&self) -> Result<Vec<Subnet>> {
        self.seed
            .subnets
            .iter()
            .map(|s| s.to_subnet(&self.responder.namespace))
            .collect()
    }

    /// Write the seed subnets into a store
    pub async fn seed_store(&self, store: &dyn ResourceStore) -> Result<usize> {
        let subnets = self.seed_subnets()?;
        for subnet in &subnets {
            store.put_subnet(subnet).await?;
            info!(subnet = %subnet.name(), cidr = %subnet.spec.cidr, "Seeded subnet");
        }
        Ok(subnets.len())
    }
}
