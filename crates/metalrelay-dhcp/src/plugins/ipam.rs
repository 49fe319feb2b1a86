//! IPAM plugin: reservations for relayed DHCPv6 clients
//!
//! Registers the client's address with the IPAM controller and leaves the
//! reply alone. Answering with the address is another plugin's job.

use super::{decapsulate, Plugin, Verdict};
use crate::derive::Candidate;
use crate::error::Result;
use crate::packet::Dhcpv6Packet;
use crate::reservation::{ReservationManager, ReserveRequest};
use crate::subnet::SubnetSelector;
use async_trait::async_trait;
use dhcproto::v6;
use metalrelay_crd::{IpFamily, MacAddr};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub struct IpamPlugin {
    manager: Arc<ReservationManager>,
    subnets: SubnetSelector,
}

impl IpamPlugin {
    pub fn new(manager: Arc<ReservationManager>, subnets: SubnetSelector) -> Self {
        Self { manager, subnets }
    }

    async fn reserve(&self, mac: MacAddr, candidate: Candidate) -> Result<IpAddr> {
        let subnet = self.subnets.select(&candidate, IpFamily::IPv6).await?;
        self.manager
            .reserve(ReserveRequest::new(mac, &subnet, candidate))
            .await
    }
}

#[async_trait]
impl Plugin for IpamPlugin {
    fn name(&self) -> &str {
        "ipam"
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
        let Some(candidate) = request.candidate(&mac, true) else {
            debug!(mac = %mac, "No IA_NA requested");
            return Verdict::Continue(reply);
        };

        match self.reserve(mac, candidate).await {
            Ok(address) => {
                info!(mac = %mac, address = %address, "Address reserved");
                Verdict::Continue(reply)
            }
            Err(e) => Verdict::Error(e),
        }
    }
}
