//! Metal plugin: reserve an address and publish the machine's endpoint
//!
//! With no subnets configured the client's own exact address is published
//! as-is, without a reservation.

use super::{decapsulate, Plugin, Verdict};
use crate::derive::Candidate;
use crate::endpoint::{EndpointPublisher, PublishOutcome};
use crate::error::Result;
use crate::packet::{DhcpRequest, Dhcpv6Packet};
use crate::reservation::{ReservationManager, ReserveRequest};
use crate::subnet::SubnetSelector;
use async_trait::async_trait;
use dhcproto::{v4, v6};
use metalrelay_crd::{IpFamily, MacAddr};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

pub struct MetalPlugin {
    manager: Arc<ReservationManager>,
    subnets: SubnetSelector,
    publisher: EndpointPublisher,
}

impl MetalPlugin {
    pub fn new(
        manager: Arc<ReservationManager>,
        subnets: SubnetSelector,
        publisher: EndpointPublisher,
    ) -> Self {
        Self {
            manager,
            subnets,
            publisher,
        }
    }

    /// The address to publish, if one is known yet
    async fn resolve(
        &self,
        mac: MacAddr,
        candidate: Candidate,
        family: IpFamily,
    ) -> Result<Option<IpAddr>> {
        if self.subnets.source().is_empty() {
            return Ok(candidate.pinned());
        }
        let subnet = self.subnets.select(&candidate, family).await?;
        let address = self
            .manager
            .reserve(ReserveRequest::new(mac, &subnet, candidate))
            .await?;
        Ok(Some(address))
    }

    async fn reconcile(
        &self,
        mac: MacAddr,
        candidate: Candidate,
        family: IpFamily,
    ) -> Result<Option<PublishOutcome>> {
        let Some(address) = self.resolve(mac, candidate, family).await? else {
            debug!(mac = %mac, "No address to publish yet");
            return Ok(None);
        };
        let outcome = self.publisher.publish(&mac, address).await?;
        debug!(mac = %mac, address = %address, outcome = ?outcome, "Endpoint reconciled");
        Ok(Some(outcome))
    }

    fn managed(&self, mac: &MacAddr) -> bool {
        let managed = self.publisher.manages(mac);
        if !managed {
            debug!(
                mac = %mac,
                strategy = self.publisher.strategy().kind(),
                "Not a managed machine"
            );
        }
        managed
    }
}

#[async_trait]
impl Plugin for MetalPlugin {
    fn name(&self) -> &str {
        "metal"
    }

    async fn handle_v4(&self, request: &DhcpRequest, reply: v4::Message) -> Verdict<v4::Message> {
        if !self.managed(&request.mac) {
            return Verdict::Continue(reply);
        }
        let candidate = request.candidate(&reply);
        match self.reconcile(request.mac, candidate, IpFamily::IPv4).await {
            Ok(_) => Verdict::Continue(reply),
            Err(e) => Verdict::Error(e),
        }
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
        if !self.managed(&mac) {
            return Verdict::Continue(reply);
        }
        let Some(candidate) = request.candidate(&mac, true) else {
            debug!(mac = %mac, "No IA_NA requested");
            return Verdict::Continue(reply);
        };
        match self.reconcile(mac, candidate, IpFamily::IPv6).await {
            Ok(_) => Verdict::Continue(reply),
            Err(e) => Verdict::Error(e),
        }
    }
}
