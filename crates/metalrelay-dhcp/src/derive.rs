//! Address derivation
//!
//! Pure functions that recover a hardware address from a relayed request
//! and synthesize candidate addresses. All of them must stay bit-for-bit
//! reproducible: other systems recompute the same addresses.

use crate::error::{DhcpError, Result};
use ipnetwork::Ipv6Network;
use metalrelay_crd::MacAddr;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Placeholder meaning "no candidate address known yet" (IPv4)
pub const UNKNOWN_V4: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Placeholder meaning "no candidate address known yet" (IPv6)
pub const UNKNOWN_V6: Ipv6Addr = Ipv6Addr::UNSPECIFIED;

/// Check for the unknown-address sentinel of either family
pub fn is_unknown(addr: &IpAddr) -> bool {
    addr.is_unspecified()
}

/// A candidate address for a client, and how much we trust it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub address: IpAddr,

    /// True when the client already holds or explicitly asked for this
    /// address, so a reservation may pin it
    pub exact: bool,
}

impl Candidate {
    pub fn exact(address: impl Into<IpAddr>) -> Self {
        Self {
            address: address.into(),
            exact: true,
        }
    }

    /// Address usable for subnet selection only
    pub fn hint(address: impl Into<IpAddr>) -> Self {
        Self {
            address: address.into(),
            exact: false,
        }
    }

    pub fn unknown_v4() -> Self {
        Self::hint(UNKNOWN_V4)
    }

    pub fn unknown_v6() -> Self {
        Self::hint(UNKNOWN_V6)
    }

    pub fn is_unknown(&self) -> bool {
        is_unknown(&self.address)
    }

    /// The address to pin in a reservation, if any
    pub fn pinned(&self) -> Option<IpAddr> {
        (self.exact && !self.is_unknown()).then_some(self.address)
    }
}

/// Recover a MAC from an EUI-64 interface identifier (RFC 4291 appendix A)
///
/// Returns `None` when the identifier is not EUI-64 derived (no `ff:fe`).
pub fn mac_from_eui64(addr: Ipv6Addr) -> Option<MacAddr> {
    let o = addr.octets();
    if o[11] != 0xff || o[12] != 0xfe {
        return None;
    }
    Some(MacAddr::new([o[8] ^ 0x02, o[9], o[10], o[13], o[14], o[15]]))
}

/// Synthesize a global address from a /64 prefix and a MAC
///
/// Bytes 8..11 are the first three MAC octets, bytes 11 and 12 are both
/// `0xFE`, bytes 13..16 are the last three MAC octets. Unlike EUI-64 the
/// universal/local bit is left alone and the filler is `fe:fe`, not
/// `ff:fe`; deployed systems depend on this exact layout.
pub fn fe_eui64(prefix: Ipv6Addr, mac: &MacAddr) -> Ipv6Addr {
    let mut o = prefix.octets();
    let m = mac.octets();
    o[8..11].copy_from_slice(&m[..3]);
    o[11] = 0xfe;
    o[12] = 0xfe;
    o[13..16].copy_from_slice(&m[3..]);
    Ipv6Addr::from(o)
}

/// Legacy derivation: the relay link address with its last byte plus one
///
/// Only the low-order byte changes; it wraps instead of carrying.
pub fn increment_link(link: Ipv6Addr) -> Ipv6Addr {
    let mut o = link.octets();
    o[15] = o[15].wrapping_add(1);
    Ipv6Addr::from(o)
}

/// A validated prefix-delegation length, in [1, 127]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub struct DelegationLength(u8);

impl DelegationLength {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 127;

    pub fn new(len: u8) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&len) {
            return Err(DhcpError::ConfigError(format!(
                "prefix delegation length {} outside [{}, {}]",
                len,
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(len))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DelegationLength {
    type Error = DhcpError;

    fn try_from(len: u8) -> Result<Self> {
        Self::new(len)
    }
}

/// Delegated prefix: `addr` masked to `len` bits
pub fn delegated_prefix(addr: Ipv6Addr, len: DelegationLength) -> Result<Ipv6Network> {
    let bits = u128::from(addr);
    let mask = u128::MAX << (128 - u32::from(len.get()));
    Ipv6Network::new(Ipv6Addr::from(bits & mask), len.get())
        .map_err(|e| DhcpError::ConfigError(e.to_string()))
}

/// The /64 prefix of an address
pub fn prefix64(addr: Ipv6Addr) -> Ipv6Addr {
    let bits = u128::from(addr);
    Ipv6Addr::from(bits & (u128::MAX << 64))
}
