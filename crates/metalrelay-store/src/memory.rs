//! In-memory storage backend
//!
//! Simple storage for development and testing. Every write is broadcast on
//! a change feed so waiters can subscribe instead of polling.

use super::{
    EventAction, Preconditions, ResourceKind, ResourceStore, Result, StoreError, StoreEvent,
};
use async_trait::async_trait;
use metalrelay_crd::{
    Endpoint, EndpointPatch, IpReservation, IpReservationStatus, LabelSelector, ObjectMeta,
    Subnet,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

type Key = (String, String);

/// Number of write operations performed, per operation type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub creates: u64,
    pub patches: u64,
    pub deletes: u64,
}

/// In-memory storage backend
pub struct MemoryStore {
    subnets: RwLock<HashMap<Key, Subnet>>,
    reservations: RwLock<HashMap<Key, IpReservation>>,
    endpoints: RwLock<HashMap<Key, Endpoint>>,
    counts: RwLock<OperationCounts>,
    next_version: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            subnets: RwLock::new(HashMap::new()),
            reservations: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            counts: RwLock::new(OperationCounts::default()),
            next_version: AtomicU64::new(1),
            events,
        }
    }

    /// Write operations performed so far
    pub fn operation_counts(&self) -> OperationCounts {
        self.counts.read().map(|c| *c).unwrap_or_default()
    }

    fn bump_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn record(&self, f: impl FnOnce(&mut OperationCounts)) {
        if let Ok(mut counts) = self.counts.write() {
            f(&mut counts);
        }
    }

    fn emit(&self, kind: ResourceKind, action: EventAction, namespace: &str, name: &str) {
        trace!(?kind, ?action, namespace, name, "store event");
        // No receivers is fine
        let _ = self.events.send(StoreEvent {
            kind,
            action,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    /// Fill in the store-owned metadata of a record being created
    fn admit(&self, meta: &mut ObjectMeta) -> Result<Key> {
        if meta.name.is_empty() {
            let prefix = meta.generate_name.as_deref().ok_or_else(|| {
                StoreError::InvalidData("metadata.name or generateName required".to_string())
            })?;
            meta.name = format!("{}{}", prefix, random_suffix());
        }
        meta.namespace = Some(meta.namespace_or_default().to_string());
        meta.uid = Some(Uuid::new_v4());
        meta.resource_version = Some(self.bump_version());
        meta.creation_timestamp = Some(chrono::Utc::now());
        Ok(key(meta.namespace_or_default(), &meta.name))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| StoreError::Database(format!("lock poisoned: {}", e)))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| StoreError::Database(format!("lock poisoned: {}", e)))
}

fn list_matching<T: Clone>(
    map: &HashMap<Key, T>,
    namespace: &str,
    selector: &LabelSelector,
    meta: impl Fn(&T) -> &ObjectMeta,
) -> Vec<T> {
    let mut items: Vec<T> = map
        .iter()
        .filter(|((ns, _), item)| ns == namespace && selector.matches(&meta(item).labels))
        .map(|(_, item)| item.clone())
        .collect();
    items.sort_by(|a, b| meta(a).name.cmp(&meta(b).name));
    items
}

#[async_trait]
impl ResourceStore for MemoryStore {
    // === Subnet Operations ===

    async fn get_subnet(&self, namespace: &str, name: &str) -> Result<Option<Subnet>> {
        Ok(read(&self.subnets)?.get(&key(namespace, name)).cloned())
    }

    async fn list_subnets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Subnet>> {
        let guard = read(&self.subnets)?;
        Ok(list_matching(&guard, namespace, selector, |s| &s.metadata))
    }

    async fn put_subnet(&self, subnet: &Subnet) -> Result<()> {
        subnet
            .validate()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let mut subnet = subnet.clone();
        let namespace = subnet.metadata.namespace_or_default().to_string();
        subnet.metadata.namespace = Some(namespace.clone());
        subnet.metadata.resource_version = Some(self.bump_version());
        let name = subnet.metadata.name.clone();

        let existed = write(&self.subnets)?
            .insert(key(&namespace, &name), subnet)
            .is_some();
        let action = if existed {
            EventAction::Modified
        } else {
            EventAction::Added
        };
        self.emit(ResourceKind::Subnet, action, &namespace, &name);
        Ok(())
    }

    // === Reservation Operations ===

    async fn get_reservation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IpReservation>> {
        Ok(read(&self.reservations)?.get(&key(namespace, name)).cloned())
    }

    async fn list_reservations(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<IpReservation>> {
        let guard = read(&self.reservations)?;
        Ok(list_matching(&guard, namespace, selector, |r| &r.metadata))
    }

    async fn create_reservation(&self, reservation: &IpReservation) -> Result<IpReservation> {
        let mut created = reservation.clone();
        created.status = None;
        let id = self.admit(&mut created.metadata)?;
        {
            let mut guard = write(&self.reservations)?;
            if guard.contains_key(&id) {
                return Err(StoreError::AlreadyExists(id.1));
            }
            guard.insert(id.clone(), created.clone());
        }
        self.record(|c| c.creates += 1);
        self.emit(ResourceKind::IpReservation, EventAction::Added, &id.0, &id.1);
        Ok(created)
    }

    async fn patch_reservation_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<IpReservation> {
        let patched = {
            let mut guard = write(&self.reservations)?;
            let existing = guard
                .get_mut(&key(namespace, name))
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            existing
                .metadata
                .labels
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            existing.metadata.resource_version = Some(self.bump_version());
            existing.clone()
        };
        self.record(|c| c.patches += 1);
        self.emit(ResourceKind::IpReservation, EventAction::Modified, namespace, name);
        Ok(patched)
    }

    async fn update_reservation_status(
        &self,
        namespace: &str,
        name: &str,
        status: IpReservationStatus,
    ) -> Result<IpReservation> {
        let updated = {
            let mut guard = write(&self.reservations)?;
            let existing = guard
                .get_mut(&key(namespace, name))
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            existing.status = Some(status);
            existing.metadata.resource_version = Some(self.bump_version());
            existing.clone()
        };
        self.emit(ResourceKind::IpReservation, EventAction::Modified, namespace, name);
        Ok(updated)
    }

    async fn delete_reservation(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> Result<()> {
        {
            let mut guard = write(&self.reservations)?;
            let id = key(namespace, name);
            let existing = guard
                .get(&id)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if preconditions.uid.is_some() && existing.metadata.uid != preconditions.uid {
                return Err(StoreError::Conflict(name.to_string()));
            }
            guard.remove(&id);
        }
        self.record(|c| c.deletes += 1);
        self.emit(ResourceKind::IpReservation, EventAction::Deleted, namespace, name);
        Ok(())
    }

    // === Endpoint Operations ===

    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Endpoint>> {
        Ok(read(&self.endpoints)?.get(&key(namespace, name)).cloned())
    }

    async fn list_endpoints(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Endpoint>> {
        let guard = read(&self.endpoints)?;
        Ok(list_matching(&guard, namespace, selector, |e| &e.metadata))
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let mut created = endpoint.clone();
        let id = self.admit(&mut created.metadata)?;
        {
            let mut guard = write(&self.endpoints)?;
            if guard.contains_key(&id) {
                return Err(StoreError::AlreadyExists(id.1));
            }
            guard.insert(id.clone(), created.clone());
        }
        self.record(|c| c.creates += 1);
        self.emit(ResourceKind::Endpoint, EventAction::Added, &id.0, &id.1);
        Ok(created)
    }

    async fn delete_endpoint(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> Result<()> {
        {
            let mut guard = write(&self.endpoints)?;
            let id = key(namespace, name);
            let existing = guard
                .get(&id)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if preconditions.uid.is_some() && existing.metadata.uid != preconditions.uid {
                return Err(StoreError::Conflict(name.to_string()));
            }
            guard.remove(&id);
        }
        self.record(|c| c.deletes += 1);
        self.emit(ResourceKind::Endpoint, EventAction::Deleted, namespace, name);
        Ok(())
    }

    async fn patch_endpoint(
        &self,
        namespace: &str,
        name: &str,
        patch: &EndpointPatch,
    ) -> Result<Endpoint> {
        let patched = {
            let mut guard = write(&self.endpoints)?;
            let existing = guard
                .get_mut(&key(namespace, name))
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if let Some(expected) = &patch.resource_version {
                if existing.metadata.resource_version.as_ref() != Some(expected) {
                    return Err(StoreError::Conflict(name.to_string()));
                }
            }
            patch.apply_to(&mut existing.spec);
            if let Some(mac) = patch.mac_address {
                existing
                    .metadata
                    .labels
                    .insert(metalrelay_crd::LABEL_MAC.to_string(), mac.sanitized());
            }
            existing.metadata.resource_version = Some(self.bump_version());
            existing.clone()
        };
        self.record(|c| c.patches += 1);
        self.emit(ResourceKind::Endpoint, EventAction::Modified, namespace, name);
        Ok(patched)
    }

    // === Change Feed ===

    fn watch(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        Some(self.events.subscribe())
    }
}
