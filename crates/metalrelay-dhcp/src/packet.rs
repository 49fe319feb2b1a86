//! DHCP packet handling
//!
//! Thin adapters over `dhcproto`: parsing inbound DHCPv4 requests,
//! unwrapping DHCPv6 relay chains, reading identity associations, and
//! building the base replies the plugin chain augments.

use crate::derive::{fe_eui64, mac_from_eui64, prefix64, Candidate};
use crate::error::{DhcpError, Result};
use dhcproto::v4;
use dhcproto::v6;
use dhcproto::{Decodable, Encodable};
use ipnetwork::Ipv6Network;
use metalrelay_crd::MacAddr;
use std::net::{Ipv4Addr, Ipv6Addr};

/// RFC 6939 client link-layer address option
const OPTION_CLIENT_LINKLAYER_ADDR: u16 = 79;

/// ARP hardware type for Ethernet
const HWTYPE_ETHERNET: u16 = 1;

/// First byte of a DHCPv6 Relay-Forward message
const RELAY_FORW: u8 = 12;

/// Parsed DHCPv4 request with extracted information
#[derive(Debug, Clone)]
pub struct DhcpRequest {
    /// Original message
    pub message: v4::Message,

    /// Message type (DISCOVER, REQUEST, etc.)
    pub message_type: v4::MessageType,

    /// Client MAC address
    pub mac: MacAddr,

    /// Requested IP address (from option 50)
    pub requested_ip: Option<Ipv4Addr>,

    /// Transaction ID
    pub xid: u32,

    /// Client IP (ciaddr)
    pub client_ip: Ipv4Addr,

    /// Gateway IP (giaddr) for relayed requests
    pub relay_ip: Ipv4Addr,
}

impl DhcpRequest {
    /// Parse a DHCPv4 request from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let message =
            v4::Message::from_bytes(data).map_err(|e| DhcpError::ParseError(e.to_string()))?;
        Self::from_message(message)
    }

    pub fn from_message(message: v4::Message) -> Result<Self> {
        let message_type = match message.opts().get(v4::OptionCode::MessageType) {
            Some(v4::DhcpOption::MessageType(mt)) => *mt,
            _ => return Err(DhcpError::ParseError("missing message type".to_string())),
        };

        let mac = MacAddr::from_slice(message.chaddr()).ok_or_else(|| {
            DhcpError::NoHardwareAddress("chaddr shorter than six bytes".to_string())
        })?;

        let requested_ip = match message.opts().get(v4::OptionCode::RequestedIpAddress) {
            Some(v4::DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
            _ => None,
        };

        Ok(Self {
            xid: message.xid(),
            client_ip: message.ciaddr(),
            relay_ip: message.giaddr(),
            message,
            message_type,
            mac,
            requested_ip,
        })
    }

    /// Best candidate address for this client
    ///
    /// In order: the address the client already holds, the address it asks
    /// for (pinnable only in a DHCPREQUEST), the responding server's own
    /// address (subnet hint only), and finally the unknown sentinel.
    pub fn candidate(&self, reply: &v4::Message) -> Candidate {
        if !self.client_ip.is_unspecified() {
            return Candidate::exact(self.client_ip);
        }

        if let Some(ip) = self.requested_ip.filter(|ip| !ip.is_unspecified()) {
            return if self.message_type == v4::MessageType::Request {
                Candidate::exact(ip)
            } else {
                Candidate::hint(ip)
            };
        }

        if let Some(v4::DhcpOption::ServerIdentifier(ip)) =
            reply.opts().get(v4::OptionCode::ServerIdentifier)
        {
            if !ip.is_unspecified() {
                return Candidate::hint(*ip);
            }
        }
        if !reply.siaddr().is_unspecified() {
            return Candidate::hint(reply.siaddr());
        }

        Candidate::unknown_v4()
    }
}

/// Build the base DHCPv4 reply for a request, if it warrants one
///
/// DISCOVER gets an OFFER, REQUEST and INFORM get an ACK. Plugins fill in
/// the address and lease options.
pub fn base_reply_v4(request: &DhcpRequest, server_ip: Ipv4Addr) -> Option<v4::Message> {
    let message_type = match request.message_type {
        v4::MessageType::Discover => v4::MessageType::Offer,
        v4::MessageType::Request | v4::MessageType::Inform => v4::MessageType::Ack,
        _ => return None,
    };

    let mut reply = v4::Message::default();
    reply.set_opcode(v4::Opcode::BootReply);
    reply.set_xid(request.xid);
    reply.set_flags(request.message.flags());
    reply.set_chaddr(request.message.chaddr());
    reply.set_giaddr(request.relay_ip);
    reply.set_ciaddr(request.client_ip);
    reply.set_siaddr(server_ip);

    reply
        .opts_mut()
        .insert(v4::DhcpOption::MessageType(message_type));
    reply
        .opts_mut()
        .insert(v4::DhcpOption::ServerIdentifier(server_ip));

    Some(reply)
}

/// Assign an address and lease to a DHCPv4 reply
pub fn assign_v4(reply: &mut v4::Message, address: Ipv4Addr, mask: Ipv4Addr, lease_secs: u32) {
    reply.set_yiaddr(address);
    reply.opts_mut().insert(v4::DhcpOption::SubnetMask(mask));
    reply
        .opts_mut()
        .insert(v4::DhcpOption::AddressLeaseTime(lease_secs));
}

/// Reply message type of a DHCPv4 reply
pub fn reply_type_v4(reply: &v4::Message) -> Option<v4::MessageType> {
    match reply.opts().get(v4::OptionCode::MessageType) {
        Some(v4::DhcpOption::MessageType(mt)) => Some(*mt),
        _ => None,
    }
}

pub fn encode_v4(message: &v4::Message) -> Result<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| DhcpError::EncodeError(e.to_string()))
}

/// A decoded DHCPv6 datagram
#[derive(Debug, Clone)]
pub enum Dhcpv6Packet {
    /// Relay-Forward, possibly wrapping further relays
    Relayed(v6::RelayMessage),

    /// A client message received without a relay
    Direct(v6::Message),
}

impl Dhcpv6Packet {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let first = *data
            .first()
            .ok_or_else(|| DhcpError::ParseError("empty datagram".to_string()))?;
        if first == RELAY_FORW {
            let relay = v6::RelayMessage::from_bytes(data)
                .map_err(|e| DhcpError::ParseError(e.to_string()))?;
            Ok(Dhcpv6Packet::Relayed(relay))
        } else {
            let message =
                v6::Message::from_bytes(data).map_err(|e| DhcpError::ParseError(e.to_string()))?;
            Ok(Dhcpv6Packet::Direct(message))
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, Dhcpv6Packet::Relayed(_))
    }
}

/// Header of one relay agent on the path to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHop {
    pub hop_count: u8,
    pub link_addr: Ipv6Addr,
    pub peer_addr: Ipv6Addr,

    /// Interface-ID option, echoed back in the reply
    pub interface_id: Option<Vec<u8>>,
}

impl RelayHop {
    fn from_relay(relay: &v6::RelayMessage) -> Self {
        let interface_id = match relay.opts().get(v6::OptionCode::InterfaceId) {
            Some(v6::DhcpOption::InterfaceId(id)) => Some(id.clone()),
            _ => None,
        };
        Self {
            hop_count: relay.hop_count(),
            link_addr: relay.link_addr(),
            peer_addr: relay.peer_addr(),
            interface_id,
        }
    }

    fn reply(&self, data: v6::RelayMessageData) -> v6::RelayMessage {
        let mut opts = v6::DhcpOptions::new();
        opts.insert(v6::DhcpOption::RelayMsg(data));
        if let Some(id) = &self.interface_id {
            opts.insert(v6::DhcpOption::InterfaceId(id.clone()));
        }
        v6::RelayMessage {
            msg_type: v6::MessageType::RelayRepl,
            hop_count: self.hop_count,
            link_addr: self.link_addr,
            peer_addr: self.peer_addr,
            opts,
        }
    }
}

/// A client message unwrapped from its relay chain
#[derive(Debug, Clone)]
pub struct RelayedRequest {
    /// Relays above the innermost one, outermost first
    pub outer: Vec<RelayHop>,

    /// The relay closest to the client
    pub innermost: RelayHop,

    /// Client link-layer address advertised by the innermost relay
    pub link_layer_addr: Option<MacAddr>,

    /// The client's own message
    pub message: v6::Message,
}

impl RelayedRequest {
    /// Unwrap a relay chain down to the client message
    pub fn decapsulate(packet: &Dhcpv6Packet) -> Result<Self> {
        let relay = match packet {
            Dhcpv6Packet::Relayed(relay) => relay,
            Dhcpv6Packet::Direct(_) => return Err(DhcpError::NotRelayed),
        };

        let mut outer = Vec::new();
        let mut current = relay;
        loop {
            let data = match current.opts().get(v6::OptionCode::RelayMsg) {
                Some(v6::DhcpOption::RelayMsg(data)) => data,
                _ => {
                    return Err(DhcpError::ParseError(
                        "relay message without a relay-message option".to_string(),
                    ))
                }
            };
            match data {
                v6::RelayMessageData::Relay(next) => {
                    outer.push(RelayHop::from_relay(current));
                    current = next;
                }
                v6::RelayMessageData::Message(message) => {
                    return Ok(Self {
                        outer,
                        innermost: RelayHop::from_relay(current),
                        link_layer_addr: link_layer_address(current.opts()),
                        message: message.clone(),
                    });
                }
            }
        }
    }

    pub fn link_addr(&self) -> Ipv6Addr {
        self.innermost.link_addr
    }

    pub fn peer_addr(&self) -> Ipv6Addr {
        self.innermost.peer_addr
    }

    pub fn message_type(&self) -> v6::MessageType {
        self.message.msg_type()
    }

    /// Hardware address of the client
    ///
    /// An Ethernet link-layer address option on the relay wins; otherwise
    /// the MAC is recovered from the EUI-64 peer address.
    pub fn hardware_address(&self) -> Result<MacAddr> {
        if let Some(mac) = self.link_layer_addr {
            return Ok(mac);
        }
        mac_from_eui64(self.peer_addr()).ok_or_else(|| {
            DhcpError::NoHardwareAddress(format!(
                "peer {} is not EUI-64 and no link-layer option is present",
                self.peer_addr()
            ))
        })
    }

    pub fn ia_na(&self) -> Option<&v6::IANA> {
        match self.message.opts().get(v6::OptionCode::IANA) {
            Some(v6::DhcpOption::IANA(ia)) => Some(ia),
            _ => None,
        }
    }

    pub fn ia_pd(&self) -> Option<&v6::IAPD> {
        match self.message.opts().get(v6::OptionCode::IAPD) {
            Some(v6::DhcpOption::IAPD(ia)) => Some(ia),
            _ => None,
        }
    }

    /// Address the client put in its IA_NA, if any
    pub fn requested_address(&self) -> Option<Ipv6Addr> {
        match self.ia_na()?.opts.get(v6::OptionCode::IAAddr) {
            Some(v6::DhcpOption::IAAddr(addr)) => Some(addr.addr),
            _ => None,
        }
    }

    /// Prefix length hinted in the client's IA_PD, if any
    pub fn prefix_hint(&self) -> Option<u8> {
        match self.ia_pd()?.opts.get(v6::OptionCode::IAPrefix) {
            Some(v6::DhcpOption::IAPrefix(prefix)) if prefix.prefix_len != 0 => {
                Some(prefix.prefix_len)
            }
            _ => None,
        }
    }

    /// Candidate address for this client
    ///
    /// `None` when the client asks for no address at all. An address carried
    /// in the IA_NA is pinnable once the client commits to it. Without one,
    /// `synthesize` derives a stable address from the link prefix and MAC;
    /// otherwise the unknown sentinel is returned.
    pub fn candidate(&self, mac: &MacAddr, synthesize: bool) -> Option<Candidate> {
        self.ia_na()?;

        if let Some(addr) = self.requested_address().filter(|a| !a.is_unspecified()) {
            let committed = matches!(
                self.message_type(),
                v6::MessageType::Request
                    | v6::MessageType::Renew
                    | v6::MessageType::Rebind
                    | v6::MessageType::Confirm
            );
            return Some(if committed {
                Candidate::exact(addr)
            } else {
                Candidate::hint(addr)
            });
        }

        if synthesize && !self.link_addr().is_unspecified() {
            return Some(Candidate::exact(fe_eui64(prefix64(self.link_addr()), mac)));
        }

        Some(Candidate::unknown_v6())
    }

    /// Wrap a reply in Relay-Reply messages mirroring the request's path
    pub fn encapsulate(&self, reply: v6::Message) -> v6::RelayMessage {
        let mut relay = self
            .innermost
            .reply(v6::RelayMessageData::Message(reply));
        for hop in self.outer.iter().rev() {
            relay = hop.reply(v6::RelayMessageData::Relay(relay));
        }
        relay
    }
}

fn link_layer_address(opts: &v6::DhcpOptions) -> Option<MacAddr> {
    opts.iter().find_map(|opt| match opt {
        v6::DhcpOption::Unknown(unknown)
            if u16::from(unknown.code()) == OPTION_CLIENT_LINKLAYER_ADDR =>
        {
            let data: &[u8] = unknown.data();
            if data.len() != 8 || u16::from_be_bytes([data[0], data[1]]) != HWTYPE_ETHERNET {
                return None;
            }
            MacAddr::from_slice(&data[2..])
        }
        _ => None,
    })
}

/// DUID-LL identifying this server, derived from its IPv4 address
pub fn server_duid(server_ip: Ipv4Addr) -> Vec<u8> {
    let ip = server_ip.octets();
    vec![0x00, 0x03, 0x00, 0x01, 0x02, 0x00, ip[0], ip[1], ip[2], ip[3]]
}

/// Build the base DHCPv6 reply for a client message
///
/// SOLICIT gets an ADVERTISE, everything else a REPLY. The client
/// identifier is echoed and our server identifier added.
pub fn base_reply_v6(request: &v6::Message, server_duid: &[u8]) -> v6::Message {
    let message_type = match request.msg_type() {
        v6::MessageType::Solicit => v6::MessageType::Advertise,
        _ => v6::MessageType::Reply,
    };

    let mut reply = v6::Message::new_with_id(message_type, request.xid());
    if let Some(v6::DhcpOption::ClientId(id)) = request.opts().get(v6::OptionCode::ClientId) {
        reply
            .opts_mut()
            .insert(v6::DhcpOption::ClientId(id.clone()));
    }
    reply
        .opts_mut()
        .insert(v6::DhcpOption::ServerId(server_duid.to_vec()));
    reply
}

/// Add an IA_NA holding one address to a DHCPv6 reply
pub fn assign_ia_na(
    reply: &mut v6::Message,
    iaid: u32,
    address: Ipv6Addr,
    preferred_secs: u32,
    valid_secs: u32,
) {
    let mut ia_opts = v6::DhcpOptions::new();
    ia_opts.insert(v6::DhcpOption::IAAddr(v6::IAAddr {
        addr: address,
        preferred_life: preferred_secs,
        valid_life: valid_secs,
        opts: v6::DhcpOptions::new(),
    }));
    reply.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
        id: iaid,
        t1: preferred_secs / 2,
        t2: preferred_secs / 5 * 4,
        opts: ia_opts,
    }));
}

/// Address carried in a reply's IA_NA
pub fn reply_ia_address(reply: &v6::Message) -> Option<Ipv6Addr> {
    match reply.opts().get(v6::OptionCode::IANA) {
        Some(v6::DhcpOption::IANA(ia)) => match ia.opts.get(v6::OptionCode::IAAddr) {
            Some(v6::DhcpOption::IAAddr(addr)) => Some(addr.addr),
            _ => None,
        },
        _ => None,
    }
}

/// Add an IA_PD holding one delegated prefix to a DHCPv6 reply
pub fn assign_ia_pd(
    reply: &mut v6::Message,
    iaid: u32,
    prefix: Ipv6Network,
    preferred_secs: u32,
    valid_secs: u32,
) {
    let mut pd_opts = v6::DhcpOptions::new();
    pd_opts.insert(v6::DhcpOption::IAPrefix(v6::IAPrefix {
        preferred_lifetime: preferred_secs,
        valid_lifetime: valid_secs,
        prefix_len: prefix.prefix(),
        prefix_ip: prefix.network(),
        opts: v6::DhcpOptions::new(),
    }));
    reply.opts_mut().insert(v6::DhcpOption::IAPD(v6::IAPD {
        id: iaid,
        t1: preferred_secs / 2,
        t2: preferred_secs / 5 * 4,
        opts: pd_opts,
    }));
}

pub fn encode_v6_relay(message: &v6::RelayMessage) -> Result<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| DhcpError::EncodeError(e.to_string()))
}

pub fn encode_v6(message: &v6::Message) -> Result<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| DhcpError::EncodeError(e.to_string()))
}

/// Raw datagram builders shared by the unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub use super::reply_ia_address;

    pub fn option(code: u16, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + data.len());
        out.extend_from_slice(&code.to_be_bytes());
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    pub fn client_id() -> Vec<u8> {
        option(1, &[0x00, 0x03, 0x00, 0x01, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
    }

    /// IA_NA (option 3), optionally carrying one IAADDR (option 5)
    pub fn ia_na(iaid: u32, address: Option<Ipv6Addr>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&iaid.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        if let Some(addr) = address {
            let mut ia_addr = addr.octets().to_vec();
            ia_addr.extend_from_slice(&0u32.to_be_bytes());
            ia_addr.extend_from_slice(&0u32.to_be_bytes());
            body.extend_from_slice(&option(5, &ia_addr));
        }
        option(3, &body)
    }

    /// IA_PD (option 25), optionally hinting a prefix length (option 26)
    pub fn ia_pd(iaid: u32, hint: Option<u8>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&iaid.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        if let Some(len) = hint {
            let mut prefix = Vec::new();
            prefix.extend_from_slice(&0u32.to_be_bytes());
            prefix.extend_from_slice(&0u32.to_be_bytes());
            prefix.push(len);
            prefix.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
            body.extend_from_slice(&option(26, &prefix));
        }
        option(25, &body)
    }

    /// Client message: type, transaction id 0x010203, options
    pub fn client_message(msg_type: u8, opts: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![msg_type, 0x01, 0x02, 0x03];
        for opt in opts {
            out.extend_from_slice(opt);
        }
        out
    }

    /// Relay-Forward around `inner`
    pub fn relay_forward(
        link: Ipv6Addr,
        peer: Ipv6Addr,
        link_layer: Option<MacAddr>,
        inner: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![RELAY_FORW, 0];
        out.extend_from_slice(&link.octets());
        out.extend_from_slice(&peer.octets());
        if let Some(mac) = link_layer {
            let mut data = HWTYPE_ETHERNET.to_be_bytes().to_vec();
            data.extend_from_slice(&mac.octets());
            out.extend_from_slice(&option(OPTION_CLIENT_LINKLAYER_ADDR, &data));
        }
        out.extend_from_slice(&option(9, inner));
        out
    }

    pub fn solicit(opts: &[Vec<u8>]) -> Vec<u8> {
        let mut all = vec![client_id()];
        all.extend_from_slice(opts);
        client_message(1, &all)
    }

    pub fn request(opts: &[Vec<u8>]) -> Vec<u8> {
        let mut all = vec![client_id()];
        all.extend_from_slice(opts);
        client_message(3, &all)
    }

    pub fn relayed(
        link: &str,
        peer: &str,
        link_layer: Option<MacAddr>,
        inner: &[u8],
    ) -> Dhcpv6Packet {
        let bytes = relay_forward(
            link.parse().unwrap(),
            peer.parse().unwrap(),
            link_layer,
            inner,
        );
        Dhcpv6Packet::parse(&bytes).unwrap()
    }

    /// DHCPv4 message from a client MAC with a message type
    pub fn v4_message(mac: MacAddr, message_type: v4::MessageType) -> v4::Message {
        let mut message = v4::Message::default();
        message.set_opcode(v4::Opcode::BootRequest);
        message.set_xid(0x12345678);
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac.octets());
        message.set_chaddr(&chaddr);
        message
            .opts_mut()
            .insert(v4::DhcpOption::MessageType(message_type));
        message
    }

    pub fn v4_request(message: v4::Message) -> DhcpRequest {
        DhcpRequest::parse(&message.to_vec().unwrap()).unwrap()
    }

    /// Prefix carried in the reply's IA_PD
    pub fn reply_ia_prefix(reply: &v6::Message) -> Option<(Ipv6Addr, u8)> {
        match reply.opts().get(v6::OptionCode::IAPD) {
            Some(v6::DhcpOption::IAPD(ia)) => match ia.opts.get(v6::OptionCode::IAPrefix) {
                Some(v6::DhcpOption::IAPrefix(p)) => Some((p.prefix_ip, p.prefix_len)),
                _ => None,
            },
            _ => None,
        }
    }
}
