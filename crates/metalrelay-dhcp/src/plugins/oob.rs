//! Out-of-band plugin: leases for management controllers
//!
//! Subnets are discovered by label. The reservation is tagged with the
//! subnet it came from and the reply carries the reserved address.

use super::{decapsulate, Plugin, Verdict};
use crate::derive::Candidate;
use crate::error::{DhcpError, Result};
use crate::packet::{assign_ia_na, assign_v4, DhcpRequest, Dhcpv6Packet};
use crate::reservation::{ReservationManager, ReserveRequest};
use crate::subnet::SubnetSelector;
use async_trait::async_trait;
use dhcproto::{v4, v6};
use ipnetwork::IpNetwork;
use metalrelay_crd::{IpFamily, MacAddr, Subnet, LABEL_SUBNET};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub struct OobPlugin {
    manager: Arc<ReservationManager>,
    subnets: SubnetSelector,
    lease_time: u32,
}

impl OobPlugin {
    pub fn new(manager: Arc<ReservationManager>, subnets: SubnetSelector, lease_time: u32) -> Self {
        Self {
            manager,
            subnets,
            lease_time,
        }
    }

    async fn lease(
        &self,
        mac: MacAddr,
        candidate: Candidate,
        family: IpFamily,
    ) -> Result<(Subnet, IpAddr)> {
        let subnet = self.subnets.select(&candidate, family).await?;
        let request = ReserveRequest::new(mac, &subnet, candidate)
            .with_label(LABEL_SUBNET, subnet.name());
        let address = self.manager.reserve(request).await?;
        info!(mac = %mac, subnet = %subnet.name(), address = %address, "Out-of-band lease");
        Ok((subnet, address))
    }
}

#[async_trait]
impl Plugin for OobPlugin {
    fn name(&self) -> &str {
        "oob"
    }

    async fn handle_v4(&self, request: &DhcpRequest, reply: v4::Message) -> Verdict<v4::Message> {
        let candidate = request.candidate(&reply);
        let (subnet, address) = match self.lease(request.mac, candidate, IpFamily::IPv4).await {
            Ok(lease) => lease,
            Err(e) => return Verdict::Error(e),
        };

        let (IpAddr::V4(address), IpNetwork::V4(cidr)) = (address, subnet.spec.cidr) else {
            return Verdict::Error(DhcpError::MissingAddress(format!(
                "{} has no IPv4 address for {}",
                subnet.name(),
                request.mac
            )));
        };

        let mut reply = reply;
        if request.message_type == v4::MessageType::Inform {
            // The client already holds its address: no yiaddr, no lease
            reply
                .opts_mut()
                .insert(v4::DhcpOption::SubnetMask(cidr.mask()));
        } else {
            assign_v4(&mut reply, address, cidr.mask(), self.lease_time);
        }
        Verdict::Continue(reply)
    }

    async fn handle_v6(&self, packet: &Dhcpv6Packet, reply: v6::Message) -> Verdict<v6::Message> {
        let Some(request) = decapsulate(self.name(), packet) else {
            return Verdict::Drop;
        };
        let mac = match request.hardware_address() {
            Ok(mac) => mac,
            Err(e) => {
                debug!(error = %e, "No hardware address, dropping");
                return Verdict::Drop;
            }
        };
        let (Some(candidate), Some(iaid)) =
            (request.candidate(&mac, false), request.ia_na().map(|ia| ia.id))
        else {
            debug!(mac = %mac, "No IA_NA requested");
            return Verdict::Continue(reply);
        };

        let (subnet, address) = match self.lease(mac, candidate, IpFamily::IPv6).await {
            Ok(lease) => lease,
            Err(e) => return Verdict::Error(e),
        };
        let IpAddr::V6(address) = address else {
            return Verdict::Error(DhcpError::MissingAddress(format!(
                "{} has no IPv6 address for {}",
                subnet.name(),
                mac
            )));
        };

        let mut reply = reply;
        assign_ia_na(&mut reply, iaid, address, self.lease_time, self.lease_time);
        Verdict::Continue(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::packet::testing::{ia_na, relayed, reply_ia_address, solicit, v4_message, v4_request};
    use crate::packet::{base_reply_v4, reply_type_v4};
    use crate::subnet::SubnetSource;
    use metalrelay_crd::{IpReservation, LabelSelector};
    use metalrelay_store::{MemoryStore, ResourceStore};
    use std::net::Ipv4Addr;

    fn mac() -> MacAddr {
        "aa:bb:cc:dd:ee:ff".parse().unwrap()
    }

    async fn oob_store() -> Arc<MemoryStore> {
        store_with(&[
            subnet("data", "10.0.0.0/24"),
            subnet("bmc-v4", "10.9.0.0/24").with_label("oob", "true"),
            subnet("bmc-v6", "2001:db8:9::/64").with_label("oob", "true"),
        ])
        .await
    }

    fn plugin(store: Arc<MemoryStore>) -> OobPlugin {
        OobPlugin::new(
            manager(store.clone()),
            SubnetSelector::new(
                store,
                "default",
                SubnetSource::Labeled(LabelSelector::everything().with("oob", "true")),
            ),
            600,
        )
    }

    #[tokio::test]
    async fn test_v4_lease_fills_reply() {
        let store = oob_store().await;
        let _allocator = spawn_allocator(store.clone());

        let request = v4_request(v4_message(mac(), v4::MessageType::Discover));
        let reply = base_reply_v4(&request, Ipv4Addr::UNSPECIFIED).unwrap();
        let reply = plugin(store.clone())
            .handle_v4(&request, reply)
            .await
            .continued()
            .unwrap();

        assert_eq!(reply_type_v4(&reply), Some(v4::MessageType::Offer));
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 9, 0, 1));
        assert!(matches!(
            reply.opts().get(v4::OptionCode::SubnetMask),
            Some(v4::DhcpOption::SubnetMask(mask)) if *mask == Ipv4Addr::new(255, 255, 255, 0)
        ));
        assert!(matches!(
            reply.opts().get(v4::OptionCode::AddressLeaseTime),
            Some(v4::DhcpOption::AddressLeaseTime(600))
        ));

        let reservation = store
            .get_reservation("default", &IpReservation::name_for("bmc-v4", &mac()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reservation.metadata.labels.get(LABEL_SUBNET).map(String::as_str),
            Some("bmc-v4")
        );
    }

    #[tokio::test]
    async fn test_inform_ack_leaves_yiaddr_empty() {
        let store = oob_store().await;
        let _allocator = spawn_allocator(store.clone());
        let held = Ipv4Addr::new(10, 9, 0, 7);

        let mut message = v4_message(mac(), v4::MessageType::Inform);
        message.set_ciaddr(held);
        let request = v4_request(message);
        let reply = base_reply_v4(&request, Ipv4Addr::UNSPECIFIED).unwrap();
        let reply = plugin(store.clone())
            .handle_v4(&request, reply)
            .await
            .continued()
            .unwrap();

        assert_eq!(reply_type_v4(&reply), Some(v4::MessageType::Ack));
        assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(reply.ciaddr(), held);
        assert!(reply.opts().get(v4::OptionCode::SubnetMask).is_some());
        assert!(reply.opts().get(v4::OptionCode::AddressLeaseTime).is_none());

        let reservation = store
            .get_reservation("default", &IpReservation::name_for("bmc-v4", &mac()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.reserved_address(), Some(IpAddr::V4(held)));
    }

    #[tokio::test]
    async fn test_v6_lease_adds_ia_na() {
        let store = oob_store().await;
        let _allocator = spawn_allocator(store.clone());

        let packet = relayed("2001:db8:9::1", "fe80::1", Some(mac()), &solicit(&[ia_na(4, None)]));
        let reply = plugin(store)
            .handle_v6(&packet, v6::Message::new(v6::MessageType::Advertise))
            .await
            .continued()
            .unwrap();

        assert_eq!(
            reply_ia_address(&reply),
            Some("2001:db8:9::1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_no_labelled_subnet_fails_without_reply() {
        let store = store_with(&[subnet("data", "10.0.0.0/24")]).await;
        let request = v4_request(v4_message(mac(), v4::MessageType::Discover));
        let reply = base_reply_v4(&request, Ipv4Addr::new(10, 0, 0, 1)).unwrap();

        let verdict = plugin(store.clone()).handle_v4(&request, reply).await;
        assert!(matches!(
            verdict,
            Verdict::Error(DhcpError::NoMatchingSubnet { .. })
        ));
        assert_eq!(store.operation_counts().creates, 0);
    }

    #[tokio::test]
    async fn test_existing_reservation_gains_subnet_label() {
        let store = oob_store().await;
        let _allocator = spawn_allocator(store.clone());
        let unlabelled = store
            .create_reservation(&IpReservation::new("default", "bmc-v4", &mac()))
            .await
            .unwrap();

        let request = v4_request(v4_message(mac(), v4::MessageType::Discover));
        let reply = base_reply_v4(&request, Ipv4Addr::UNSPECIFIED).unwrap();
        assert!(plugin(store.clone())
            .handle_v4(&request, reply)
            .await
            .continued()
            .is_some());

        let stored = store
            .get_reservation("default", unlabelled.name())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.metadata.uid, unlabelled.metadata.uid);
        assert_eq!(
            stored.metadata.labels.get(LABEL_SUBNET).map(String::as_str),
            Some("bmc-v4")
        );
    }
}
