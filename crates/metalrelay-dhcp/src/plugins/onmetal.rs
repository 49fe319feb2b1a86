//! On-metal plugin: addresses and prefixes derived from the relay link
//!
//! The client gets the relay's link address plus one, and a prefix
//! delegated from that address. No reservation is made.

use super::{decapsulate, Plugin, Verdict};
use crate::derive::{delegated_prefix, increment_link, DelegationLength};
use crate::packet::{assign_ia_na, assign_ia_pd, Dhcpv6Packet};
use async_trait::async_trait;
use dhcproto::v6;
use tracing::{debug, info};

pub struct OnmetalPlugin {
    delegation_length: DelegationLength,
    preferred_lifetime: u32,
    valid_lifetime: u32,
}

impl OnmetalPlugin {
    pub fn new(
        delegation_length: DelegationLength,
        preferred_lifetime: u32,
        valid_lifetime: u32,
    ) -> Self {
        Self {
            delegation_length,
            preferred_lifetime,
            valid_lifetime,
        }
    }

    /// Client hint when it is a usable length, else the configured one
    fn length_for(&self, hint: Option<u8>) -> DelegationLength {
        hint.and_then(|len| DelegationLength::new(len).ok())
            .unwrap_or(self.delegation_length)
    }
}

#[async_trait]
impl Plugin for OnmetalPlugin {
    fn name(&self) -> &str {
        "onmetal"
    }

    async fn handle_v6(&self, packet: &Dhcpv6Packet, reply: v6::Message) -> Verdict<v6::Message> {
        let Some(request) = decapsulate(self.name(), packet) else {
            return Verdict::Drop;
        };
        let ia_na = request.ia_na().map(|ia| ia.id);
        let ia_pd = request.ia_pd().map(|ia| ia.id);
        if ia_na.is_none() && ia_pd.is_none() {
            debug!("Neither IA_NA nor IA_PD requested");
            return Verdict::Continue(reply);
        }

        let link = request.link_addr();
        if link.is_unspecified() {
            debug!("Relay sent no link address");
            return Verdict::Continue(reply);
        }
        let address = increment_link(link);

        let mut reply = reply;
        if let Some(iaid) = ia_na {
            assign_ia_na(&mut reply, iaid, address, self.preferred_lifetime, self.valid_lifetime);
            info!(link = %link, address = %address, "Link address assigned");
        }

        if let Some(iaid) = ia_pd {
            let length = self.length_for(request.prefix_hint());
            let prefix = match delegated_prefix(address, length) {
                Ok(prefix) => prefix,
                Err(e) => return Verdict::Error(e),
            };
            assign_ia_pd(&mut reply, iaid, prefix, self.preferred_lifetime, self.valid_lifetime);
            info!(link = %link, prefix = %prefix, "Prefix delegated");
        }

        Verdict::Continue(reply)
    }
}
