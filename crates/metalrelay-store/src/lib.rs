//! Resource store for metalrelay
//!
//! This crate provides the `ResourceStore` trait the responder uses to read
//! subnets and to write reservations and endpoints, plus:
//! - `MemoryStore` - In-memory backend with a change feed, for development and tests
//! - `WaitStrategy` - Bounded waits for a reservation to reach a wanted state
//! - `PoolAllocator` - Development stand-in for the external IPAM controller
//!
//! Consistency relies entirely on the store: duplicate creates fail with
//! `AlreadyExists`, patches are last-write-wins unless they carry a
//! resource version precondition, and deletes can be pinned to a uid.

mod allocator;
mod memory;
mod wait;

pub use allocator::PoolAllocator;
pub use memory::{MemoryStore, OperationCounts};
pub use wait::{WaitError, WaitStrategy};

use async_trait::async_trait;
use metalrelay_crd::{
    Endpoint, EndpointPatch, IpReservation, IpReservationStatus, LabelSelector, Subnet,
};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0} was modified concurrently")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Kinds of record held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Subnet,
    IpReservation,
    Endpoint,
}

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Added,
    Modified,
    Deleted,
}

/// Change notification emitted by stores that support watching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: ResourceKind,
    pub action: EventAction,
    pub namespace: String,
    pub name: String,
}

/// Conditions a record must still meet for a delete to go ahead
///
/// A record recreated under the same name gets a new uid, so a uid
/// precondition only ever removes the record the caller actually read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<Uuid>,
}

impl Preconditions {
    /// Delete whatever record holds the name
    pub fn none() -> Self {
        Self::default()
    }

    /// Delete only the record with this uid
    pub fn uid(uid: Option<Uuid>) -> Self {
        Self { uid }
    }
}

/// Storage backend trait
///
/// The trait is object-safe and can be used with `Arc<dyn ResourceStore>`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    // === Subnet Operations ===

    /// Get a subnet by name
    async fn get_subnet(&self, namespace: &str, name: &str) -> Result<Option<Subnet>>;

    /// List subnets matching a label selector
    async fn list_subnets(&self, namespace: &str, selector: &LabelSelector)
        -> Result<Vec<Subnet>>;

    /// Store or update a subnet (IPAM side; the responder never calls this)
    async fn put_subnet(&self, subnet: &Subnet) -> Result<()>;

    // === Reservation Operations ===

    /// Get a reservation by name
    async fn get_reservation(&self, namespace: &str, name: &str)
        -> Result<Option<IpReservation>>;

    /// List reservations matching a label selector
    async fn list_reservations(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<IpReservation>>;

    /// Create a reservation; fails with `AlreadyExists` on a name collision
    async fn create_reservation(&self, reservation: &IpReservation) -> Result<IpReservation>;

    /// Merge labels into an existing reservation
    async fn patch_reservation_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<IpReservation>;

    /// Replace the status of a reservation (controller side)
    async fn update_reservation_status(
        &self,
        namespace: &str,
        name: &str,
        status: IpReservationStatus,
    ) -> Result<IpReservation>;

    /// Delete a reservation; fails with `Conflict` when a precondition no
    /// longer holds
    async fn delete_reservation(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> Result<()>;

    // === Endpoint Operations ===

    /// Get an endpoint by name
    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Endpoint>>;

    /// List endpoints matching a label selector
    async fn list_endpoints(&self, namespace: &str, selector: &LabelSelector)
        -> Result<Vec<Endpoint>>;

    /// Create an endpoint; an empty name is generated from `generate_name`
    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<Endpoint>;

    /// Delete an endpoint; fails with `Conflict` when a precondition no
    /// longer holds
    async fn delete_endpoint(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> Result<()>;

    /// Patch an endpoint; fails with `Conflict` on a stale resource version
    async fn patch_endpoint(
        &self,
        namespace: &str,
        name: &str,
        patch: &EndpointPatch,
    ) -> Result<Endpoint>;

    // === Change Feed ===

    /// Subscribe to change notifications, if the backend has a change feed
    fn watch(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        None
    }
}
