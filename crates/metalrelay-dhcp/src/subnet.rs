//! Subnet selection
//!
//! Picks the first candidate subnet whose reserved range contains a
//! candidate address. The unknown-address sentinel matches any subnet of
//! the right family, so a client with no address yet still gets one.

use crate::derive::Candidate;
use crate::error::{DhcpError, Result};
use metalrelay_crd::{IpFamily, LabelSelector, Subnet};
use metalrelay_store::ResourceStore;
use std::sync::Arc;
use tracing::debug;

/// Where candidate subnets come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetSource {
    /// Explicit names, tried in the given order
    Named(Vec<String>),

    /// Every subnet matching a label selector, in name order
    Labeled(LabelSelector),
}

impl SubnetSource {
    /// True for an explicitly empty name list
    pub fn is_empty(&self) -> bool {
        matches!(self, SubnetSource::Named(names) if names.is_empty())
    }
}

pub struct SubnetSelector {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    source: SubnetSource,
}

impl SubnetSelector {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        namespace: impl Into<String>,
        source: SubnetSource,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            source,
        }
    }

    pub fn source(&self) -> &SubnetSource {
        &self.source
    }

    /// Find the first subnet of `family` that accepts `candidate`
    pub async fn select(&self, candidate: &Candidate, family: IpFamily) -> Result<Subnet> {
        let (subnets, tried) = self.candidates().await?;

        for subnet in subnets {
            if subnet.spec.family != family {
                debug!(
                    subnet = %subnet.name(),
                    family = ?family,
                    "Subnet family mismatch, skipping"
                );
                continue;
            }
            if candidate.is_unknown() || subnet.contains(candidate.address) {
                debug!(
                    subnet = %subnet.name(),
                    address = %candidate.address,
                    "Selected subnet"
                );
                return Ok(subnet);
            }
        }

        Err(DhcpError::NoMatchingSubnet {
            address: candidate.address,
            candidates: tried.join(", "),
        })
    }

    /// Resolve the source into subnets, plus the names that were looked up
    async fn candidates(&self) -> Result<(Vec<Subnet>, Vec<String>)> {
        match &self.source {
            SubnetSource::Named(names) => {
                let mut subnets = Vec::with_capacity(names.len());
                for name in names {
                    match self.store.get_subnet(&self.namespace, name).await? {
                        Some(subnet) => subnets.push(subnet),
                        None => {
                            debug!(
                                subnet = %name,
                                namespace = %self.namespace,
                                "Subnet not found, skipping"
                            )
                        }
                    }
                }
                Ok((subnets, names.clone()))
            }
            SubnetSource::Labeled(selector) => {
                let mut subnets = self.store.list_subnets(&self.namespace, selector).await?;
                subnets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
                let names = if subnets.is_empty() {
                    vec![format!("<none matching {}>", selector)]
                } else {
                    subnets.iter().map(|s| s.metadata.name.clone()).collect()
                };
                Ok((subnets, names))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{UNKNOWN_V4, UNKNOWN_V6};
    use metalrelay_store::MemoryStore;
    use std::net::{Ipv4Addr, Ipv6Addr};

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (name, cidr) in [
            ("wide", "10.0.0.0/16"),
            ("narrow", "10.0.1.0/24"),
            ("other", "192.168.0.0/24"),
            ("v6", "2001:db8::/64"),
        ] {
            store
                .put_subnet(&Subnet::new(name, "default", cidr.parse().unwrap()))
                .await
                .unwrap();
        }
        store
            .put_subnet(
                &Subnet::new("oob-b", "default", "172.16.1.0/24".parse().unwrap())
                    .with_label("oob", "true"),
            )
            .await
            .unwrap();
        store
            .put_subnet(
                &Subnet::new("oob-a", "default", "172.16.0.0/16".parse().unwrap())
                    .with_label("oob", "true"),
            )
            .await
            .unwrap();
        store
    }

    fn named(store: Arc<MemoryStore>, names: &[&str]) -> SubnetSelector {
        SubnetSelector::new(
            store,
            "default",
            SubnetSource::Named(names.iter().map(|n| n.to_string()).collect()),
        )
    }

    #[tokio::test]
    async fn test_first_match_in_order_wins() {
        let store = store().await;
        let candidate = Candidate::exact(Ipv4Addr::new(10, 0, 1, 5));

        let subnet = named(store.clone(), &["wide", "narrow"])
            .select(&candidate, IpFamily::IPv4)
            .await
            .unwrap();
        assert_eq!(subnet.name(), "wide");

        let subnet = named(store, &["narrow", "wide"])
            .select(&candidate, IpFamily::IPv4)
            .await
            .unwrap();
        assert_eq!(subnet.name(), "narrow");
    }

    #[tokio::test]
    async fn test_missing_subnets_are_skipped() {
        let store = store().await;
        let subnet = named(store, &["ghost", "narrow"])
            .select(&Candidate::hint(Ipv4Addr::new(10, 0, 1, 1)), IpFamily::IPv4)
            .await
            .unwrap();
        assert_eq!(subnet.name(), "narrow");
    }

    #[tokio::test]
    async fn test_no_match_is_an_error() {
        let store = store().await;
        let err = named(store, &["other", "ghost"])
            .select(&Candidate::exact(Ipv4Addr::new(10, 9, 9, 9)), IpFamily::IPv4)
            .await
            .unwrap_err();
        match err {
            DhcpError::NoMatchingSubnet { candidates, .. } => {
                assert_eq!(candidates, "other, ghost")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_sentinel_bypasses_containment() {
        let store = store().await;
        let subnet = named(store.clone(), &["other", "wide"])
            .select(&Candidate::hint(UNKNOWN_V4), IpFamily::IPv4)
            .await
            .unwrap();
        assert_eq!(subnet.name(), "other");

        // Still bound to the family
        let subnet = named(store, &["other", "v6"])
            .select(&Candidate::hint(UNKNOWN_V6), IpFamily::IPv6)
            .await
            .unwrap();
        assert_eq!(subnet.name(), "v6");
    }

    #[tokio::test]
    async fn test_family_filter() {
        let store = store().await;
        let addr: Ipv6Addr = "2001:db8::10".parse().unwrap();
        let err = named(store, &["v6"])
            .select(&Candidate::exact(addr), IpFamily::IPv4)
            .await
            .unwrap_err();
        assert!(matches!(err, DhcpError::NoMatchingSubnet { .. }));
    }

    #[tokio::test]
    async fn test_labeled_source_sorted_by_name() {
        let store = store().await;
        let selector = SubnetSelector::new(
            store,
            "default",
            SubnetSource::Labeled(LabelSelector::everything().with("oob", "true")),
        );

        let subnet = selector
            .select(&Candidate::exact(Ipv4Addr::new(172, 16, 1, 9)), IpFamily::IPv4)
            .await
            .unwrap();
        assert_eq!(subnet.name(), "oob-a");

        let subnet = selector
            .select(&Candidate::unknown_v4(), IpFamily::IPv4)
            .await
            .unwrap();
        assert_eq!(subnet.name(), "oob-a");
    }

    #[test]
    fn test_source_is_empty() {
        assert!(SubnetSource::Named(vec![]).is_empty());
        assert!(!SubnetSource::Named(vec!["a".to_string()]).is_empty());
        assert!(!SubnetSource::Labeled(LabelSelector::everything()).is_empty());
    }
}
