//! Error types for the DHCP responder
//!
//! This module provides error types for socket setup, packet handling,
//! configuration and the reservation/endpoint reconciliation chain.

use metalrelay_store::{StoreError, WaitError};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Error type for DHCP operations
#[derive(Debug, Error)]
pub enum DhcpError {
    /// Failed to bind to socket
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse DHCP packet
    #[error("failed to parse DHCP packet: {0}")]
    ParseError(String),

    /// Failed to encode DHCP packet
    #[error("failed to encode DHCP packet: {0}")]
    EncodeError(String),

    /// A relayed message was required
    #[error("message is not relayed")]
    NotRelayed,

    /// No hardware address could be derived from the request
    #[error("cannot derive a hardware address: {0}")]
    NoHardwareAddress(String),

    /// None of the candidate subnets contains the address
    #[error("no subnet matches {address} (candidates: {candidates})")]
    NoMatchingSubnet { address: IpAddr, candidates: String },

    /// The controller marked the reservation as failed
    #[error("reservation {name} failed: {reason}")]
    ReservationFailed { name: String, reason: String },

    /// A reservation finished without an address
    #[error("reservation {0} finished without an address")]
    MissingAddress(String),

    /// Bounded wait exceeded or unavailable
    #[error("wait failed: {0}")]
    Wait(WaitError),

    /// Resource store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Socket send error
    #[error("failed to send packet: {0}")]
    SendError(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<WaitError> for DhcpError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Store(e) => DhcpError::Store(e),
            other => DhcpError::Wait(other),
        }
    }
}

/// Result type for DHCP operations
pub type Result<T> = std::result::Result<T, DhcpError>;
