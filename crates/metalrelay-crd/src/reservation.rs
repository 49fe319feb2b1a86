//! IP reservation resource types
//!
//! A reservation records the intent to allocate one address to one MAC in
//! one subnet. The responder creates and deletes reservations; only the
//! external IPAM controller moves them between states.

use crate::{MacAddr, ObjectMeta, TypeMeta, LABEL_MAC, LABEL_ORIGIN, ORIGIN};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// IpReservation resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpReservation {
    #[serde(flatten)]
    pub type_meta: TypeMeta,

    pub metadata: ObjectMeta,

    pub spec: IpReservationSpec,

    /// Set by the IPAM controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<IpReservationStatus>,
}

/// Reservation specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpReservationSpec {
    /// Name of the owning subnet
    pub subnet: String,

    /// Explicitly requested address; the controller picks any free one when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

/// Reservation status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IpReservationStatus {
    pub state: ReservationState,

    /// Address assigned by the controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved: Option<IpAddr>,

    /// Human-readable reason for a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lifecycle state of a reservation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ReservationState {
    #[default]
    Processing,
    Finished,
    Failed,
}

impl IpReservation {
    /// Deterministic reservation name for a MAC in a subnet
    pub fn name_for(subnet: &str, mac: &MacAddr) -> String {
        format!("{}-{}", subnet, mac.sanitized())
    }

    /// Create a reservation for a MAC in a subnet, labelled for lookup by MAC
    pub fn new(namespace: impl Into<String>, subnet: impl Into<String>, mac: &MacAddr) -> Self {
        let subnet = subnet.into();
        let metadata = ObjectMeta::with_namespace(Self::name_for(&subnet, mac), namespace)
            .with_label(LABEL_MAC, mac.sanitized())
            .with_label(LABEL_ORIGIN, ORIGIN);
        Self {
            type_meta: TypeMeta::ip_reservation(),
            metadata,
            spec: IpReservationSpec { subnet, ip: None },
            status: None,
        }
    }

    /// Request a specific address
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.spec.ip = Some(ip);
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Current state; a reservation without status is still processing
    pub fn state(&self) -> ReservationState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ReservationState::Failed
    }

    /// Check if the controller will no longer transition this record
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            ReservationState::Finished | ReservationState::Failed
        )
    }

    /// Assigned address, once the controller has set one
    pub fn reserved_address(&self) -> Option<IpAddr> {
        self.status.as_ref().and_then(|s| s.reserved)
    }
}
