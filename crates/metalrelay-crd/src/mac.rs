//! Hardware (link-layer) address type

use crate::{CrdError, Result};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 6-byte Ethernet hardware address
///
/// Parsing is case-insensitive and accepts `:` or `-` separators. The
/// canonical external form is lowercase, colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(MacAddr6);

impl MacAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        let [a, b, c, d, e, f] = bytes;
        Self(MacAddr6::new(a, b, c, d, e, f))
    }

    /// Take the first six bytes of a hardware address field (e.g. `chaddr`)
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self::new(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0.into_array()
    }

    /// Lowercase hex without separators, used as a label value and lookup key
    pub fn sanitized(&self) -> String {
        self.octets().iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// True when the address starts with the given prefix
    ///
    /// The prefix may be written with or without separators, in any case.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let wanted: String = prefix
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        self.sanitized().starts_with(&wanted)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string().to_ascii_lowercase())
    }
}

impl FromStr for MacAddr {
    type Err = CrdError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<MacAddr6>()
            .map(Self)
            .map_err(|e| CrdError::InvalidMacAddress(format!("{}: {}", s, e)))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = CrdError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(MacAddr6::from(bytes))
    }
}
