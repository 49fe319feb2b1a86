//! Reservation lifecycle
//!
//! `ReservationManager::reserve` turns (MAC, subnet, candidate) into an
//! assigned address:
//!
//! 1. List the reservations labelled with the MAC.
//! 2. Skip other subnets. Delete a Failed one, pinned to its uid, and wait
//!    until it is gone; reuse a live one (patching in any missing labels).
//!    If the Failed one was already replaced, start over from step 1.
//! 3. Without a live reservation, create one. Losing the create race to a
//!    concurrent request is fine: both then wait on the same record.
//! 4. Wait, bounded, for the controller to finish it.
//! 5. Return the assigned address.
//!
//! There is no in-process locking: deterministic names make the store's
//! "already exists" the only arbiter between concurrent requests.

use crate::config::WaitConfig;
use crate::derive::Candidate;
use crate::error::{DhcpError, Result};
use metalrelay_crd::{IpReservation, LabelSelector, MacAddr, Subnet, LABEL_MAC};
use metalrelay_store::{Preconditions, ResourceStore, StoreError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Passes over the store before a request gives up on a churning name
const MAX_ATTEMPTS: u32 = 3;

/// What to reserve
#[derive(Debug, Clone)]
pub struct ReserveRequest<'a> {
    pub mac: MacAddr,
    pub subnet: &'a Subnet,
    pub candidate: Candidate,

    /// Labels the reservation must carry in addition to the MAC and origin
    pub labels: HashMap<String, String>,
}

impl<'a> ReserveRequest<'a> {
    pub fn new(mac: MacAddr, subnet: &'a Subnet, candidate: Candidate) -> Self {
        Self {
            mac,
            subnet,
            candidate,
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Owns the lifecycle of reservations in one namespace
pub struct ReservationManager {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    wait: WaitConfig,
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        namespace: impl Into<String>,
        wait: WaitConfig,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            wait,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Reserve an address, reusing or replacing existing reservations
    pub async fn reserve(&self, request: ReserveRequest<'_>) -> Result<IpAddr> {
        let mut attempt = 1;
        let name = loop {
            if let Some(name) = self.resolve(&request).await? {
                break name;
            }
            if attempt >= MAX_ATTEMPTS {
                return Err(DhcpError::Store(StoreError::Conflict(IpReservation::name_for(
                    request.subnet.name(),
                    &request.mac,
                ))));
            }
            attempt += 1;
            debug!(mac = %request.mac, attempt, "Reservation replaced concurrently, starting over");
        };

        self.await_finished(&name).await
    }

    /// Name of the live reservation to wait on, creating it if needed
    ///
    /// `None` means the listing was stale: a failed record we meant to
    /// remove has already been replaced.
    async fn resolve(&self, request: &ReserveRequest<'_>) -> Result<Option<String>> {
        let subnet = request.subnet.name();
        let selector = LabelSelector::everything().with(LABEL_MAC, request.mac.sanitized());
        let existing = self
            .store
            .list_reservations(&self.namespace, &selector)
            .await?;

        for reservation in existing.iter().filter(|r| r.spec.subnet == subnet) {
            if reservation.is_failed() {
                info!(
                    mac = %request.mac,
                    subnet = %subnet,
                    reservation = %reservation.name(),
                    "Removing failed reservation"
                );
                if !self.delete_and_wait(reservation).await? {
                    return Ok(None);
                }
                continue;
            }

            debug!(
                mac = %request.mac,
                reservation = %reservation.name(),
                state = ?reservation.state(),
                "Reusing existing reservation"
            );
            self.ensure_labels(reservation, &request.labels).await?;
            return Ok(Some(reservation.name().to_string()));
        }

        self.create(request).await.map(Some)
    }

    async fn create(&self, request: &ReserveRequest<'_>) -> Result<String> {
        let mut reservation =
            IpReservation::new(&self.namespace, request.subnet.name(), &request.mac);
        for (key, value) in &request.labels {
            reservation = reservation.with_label(key, value);
        }
        if let Some(ip) = request.candidate.pinned() {
            reservation = reservation.with_ip(ip);
        }

        match self.store.create_reservation(&reservation).await {
            Ok(created) => {
                info!(
                    mac = %request.mac,
                    subnet = %request.subnet.name(),
                    reservation = %created.name(),
                    requested = ?created.spec.ip,
                    "Created reservation"
                );
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(
                    reservation = %reservation.name(),
                    "Reservation created concurrently, waiting on it"
                );
            }
            Err(e) => return Err(e.into()),
        }

        Ok(reservation.name().to_string())
    }

    /// Merge missing labels into a live reservation
    async fn ensure_labels(
        &self,
        reservation: &IpReservation,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let missing: HashMap<String, String> = labels
            .iter()
            .filter(|(k, v)| reservation.metadata.labels.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        debug!(reservation = %reservation.name(), labels = ?missing, "Patching reservation labels");
        self.store
            .patch_reservation_labels(&self.namespace, reservation.name(), &missing)
            .await?;
        Ok(())
    }

    /// Delete a failed reservation and wait until that record is gone
    ///
    /// The delete is pinned to the record's uid. Returns `false` when the
    /// name already holds a different record, which is left alone.
    async fn delete_and_wait(&self, reservation: &IpReservation) -> Result<bool> {
        let uid = reservation.metadata.uid;
        match self
            .store
            .delete_reservation(&self.namespace, reservation.name(), Preconditions::uid(uid))
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(reservation = %reservation.name(), "Failed reservation already replaced");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        // A record recreated under the same name has a different uid
        self.wait
            .strategy
            .await_reservation(
                self.store.as_ref(),
                &self.namespace,
                reservation.name(),
                self.wait.deletion_timeout,
                |current| current.map_or(true, |r| r.metadata.uid != uid),
            )
            .await?;
        Ok(true)
    }

    /// Wait for a reservation to reach a terminal state
    async fn await_finished(&self, name: &str) -> Result<IpAddr> {
        let seen = self
            .wait
            .strategy
            .await_reservation(
                self.store.as_ref(),
                &self.namespace,
                name,
                self.wait.reservation_timeout,
                |current| current.map_or(false, |r| r.is_terminal()),
            )
            .await
            .map_err(|e| {
                warn!(reservation = %name, error = %e, "Reservation did not converge");
                DhcpError::from(e)
            })?;

        let reservation = seen.ok_or_else(|| DhcpError::MissingAddress(name.to_string()))?;
        if reservation.is_failed() {
            let reason = reservation
                .status
                .as_ref()
                .and_then(|s| s.message.clone())
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(DhcpError::ReservationFailed {
                name: name.to_string(),
                reason,
            });
        }

        reservation
            .reserved_address()
            .ok_or_else(|| DhcpError::MissingAddress(name.to_string()))
    }
}
