//! Subnet resource types

use crate::{CrdError, ObjectMeta, Result, TypeMeta};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// IP address family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IpFamily {
    IPv4,
    IPv6,
}

/// Subnet resource: a named, namespaced address range
///
/// Managed by an external IPAM controller and only read by the responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    #[serde(flatten)]
    pub type_meta: TypeMeta,

    pub metadata: ObjectMeta,

    pub spec: SubnetSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubnetStatus>,
}

/// Subnet specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Declared address family
    pub family: IpFamily,

    /// Address range of the subnet
    pub cidr: IpNetwork,
}

/// Subnet status, set by the IPAM controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    /// Block reserved from the parent network for this subnet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved: Option<IpNetwork>,
}

impl Subnet {
    /// Create a new Subnet in a namespace; the family follows the CIDR
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, cidr: IpNetwork) -> Self {
        let family = if cidr.is_ipv4() {
            IpFamily::IPv4
        } else {
            IpFamily::IPv6
        };
        Self {
            type_meta: TypeMeta::subnet(),
            metadata: ObjectMeta::with_namespace(name, namespace),
            spec: SubnetSpec { family, cidr },
            status: None,
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Set the reserved block
    pub fn with_reserved(mut self, reserved: IpNetwork) -> Self {
        self.status = Some(SubnetStatus {
            reserved: Some(reserved),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Range used for containment tests: the reserved block, else the CIDR
    pub fn reserved_range(&self) -> IpNetwork {
        self.status
            .as_ref()
            .and_then(|s| s.reserved)
            .unwrap_or(self.spec.cidr)
    }

    /// Check whether an address lies in the reserved range
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.reserved_range().contains(addr)
    }

    /// Validate the subnet resource
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(CrdError::MissingField("metadata.name".to_string()));
        }
        let cidr_family = if self.spec.cidr.is_ipv4() {
            IpFamily::IPv4
        } else {
            IpFamily::IPv6
        };
        if cidr_family != self.spec.family {
            return Err(CrdError::InvalidFieldValue {
                field: "spec.cidr".to_string(),
                message: format!("{} is not {:?}", self.spec.cidr, self.spec.family),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_follows_cidr() {
        let v4 = Subnet::new("a", "default", "10.0.0.0/24".parse().unwrap());
        assert_eq!(v4.spec.family, IpFamily::IPv4);
        let v6 = Subnet::new("b", "default", "2001:db8::/64".parse().unwrap());
        assert_eq!(v6.spec.family, IpFamily::IPv6);
        assert!(v6.validate().is_ok());
    }

    #[test]
    fn test_contains_prefers_reserved_block() {
        let subnet = Subnet::new("a", "default", "10.0.0.0/16".parse().unwrap());
        assert!(subnet.contains("10.0.200.1".parse().unwrap()));

        let subnet = subnet.with_reserved("10.0.1.0/24".parse().unwrap());
        assert!(subnet.contains("10.0.1.7".parse().unwrap()));
        assert!(!subnet.contains("10.0.200.1".parse().unwrap()));
        assert!(!subnet.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_validate_family_mismatch() {
        let mut subnet = Subnet::new("a", "default", "10.0.0.0/24".parse().unwrap());
        subnet.spec.family = IpFamily::IPv6;
        assert!(matches!(
            subnet.validate(),
            Err(CrdError::InvalidFieldValue { .. })
        ));
    }

    #[test]
    fn test_subnet_serialization() {
        let subnet = Subnet::new("oob-fra", "default", "192.168.0.0/24".parse().unwrap())
            .with_label("oob", "true");
        let json = serde_json::to_string(&subnet).unwrap();
        assert!(json.contains("\"kind\":\"Subnet\""));
        let parsed: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, subnet);
    }
}
