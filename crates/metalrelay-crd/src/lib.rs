//! metalrelay resource types
//!
//! This crate provides CRD-compatible types for the records the DHCP
//! responder reads and writes in the resource store.
//!
//! # Resources
//!
//! - `Subnet` - Named address range with a reserved CIDR (read-only here)
//! - `IpReservation` - Requested/assigned address for one MAC in one subnet
//! - `Endpoint` - Published name → MAC → IP binding

pub mod endpoint;
pub mod error;
pub mod mac;
pub mod metadata;
pub mod reservation;
pub mod selector;
pub mod subnet;

pub use endpoint::*;
pub use error::*;
pub use mac::*;
pub use metadata::*;
pub use reservation::*;
pub use selector::*;
pub use subnet::*;

/// API version for all metalrelay resources
pub const API_VERSION: &str = "metalrelay.dev/v1";

/// Label carrying the sanitized MAC address of the owning client
pub const LABEL_MAC: &str = "metalrelay.dev/mac";

/// Label marking records created by this responder
pub const LABEL_ORIGIN: &str = "metalrelay.dev/origin";

/// Label carrying subnet membership (out-of-band reservations)
pub const LABEL_SUBNET: &str = "metalrelay.dev/subnet";

/// Value of [`LABEL_ORIGIN`] on records we create
pub const ORIGIN: &str = "metalrelay";
