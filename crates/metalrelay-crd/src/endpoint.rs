//! Endpoint resource types
//!
//! An endpoint publishes the binding of a machine name to its MAC and
//! assigned address for inventory, netboot and out-of-band consumers.

use crate::{MacAddr, ObjectMeta, TypeMeta, LABEL_MAC, LABEL_ORIGIN, ORIGIN};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Endpoint resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(flatten)]
    pub type_meta: TypeMeta,

    pub metadata: ObjectMeta,

    pub spec: EndpointSpec,
}

/// Endpoint specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub mac_address: MacAddr,
    pub ip: IpAddr,
}

impl Endpoint {
    /// Endpoint with a known name
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        mac: MacAddr,
        ip: IpAddr,
    ) -> Self {
        Self::with_metadata(ObjectMeta::with_namespace(name, namespace), mac, ip)
    }

    /// Endpoint whose name the store generates from a prefix
    pub fn generated(
        prefix: impl Into<String>,
        namespace: impl Into<String>,
        mac: MacAddr,
        ip: IpAddr,
    ) -> Self {
        Self::with_metadata(ObjectMeta::generated(prefix, namespace), mac, ip)
    }

    fn with_metadata(metadata: ObjectMeta, mac: MacAddr, ip: IpAddr) -> Self {
        Self {
            type_meta: TypeMeta::endpoint(),
            metadata: metadata
                .with_label(LABEL_MAC, mac.sanitized())
                .with_label(LABEL_ORIGIN, ORIGIN),
            spec: EndpointSpec {
                mac_address: mac,
                ip,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Partial update for an endpoint
///
/// When `resource_version` is set the store rejects the patch with a
/// conflict if the stored record has moved on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointPatch {
    pub mac_address: Option<MacAddr>,
    pub ip: Option<IpAddr>,
    pub resource_version: Option<String>,
}

impl EndpointPatch {
    /// Patch only the address
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Default::default()
        }
    }

    /// Require the stored record to be at this version
    pub fn at_version(mut self, version: Option<String>) -> Self {
        self.resource_version = version;
        self
    }

    /// Apply to an endpoint spec in place
    pub fn apply_to(&self, spec: &mut EndpointSpec) {
        if let Some(mac) = self.mac_address {
            spec.mac_address = mac;
        }
        if let Some(ip) = self.ip {
            spec.ip = ip;
        }
    }
}
