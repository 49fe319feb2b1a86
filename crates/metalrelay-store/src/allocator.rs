//! Development address allocator
//!
//! Stands in for the external IPAM controller: it moves `Processing`
//! reservations to `Finished` with a free address from the owning subnet's
//! reserved range, or to `Failed` when that is impossible.

use crate::{EventAction, ResourceKind, ResourceStore, Result, StoreError};
use ipnetwork::IpNetwork;
use metalrelay_crd::{IpReservationStatus, LabelSelector, ReservationState, Subnet};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on addresses scanned per IPv6 allocation
const V6_SCAN_LIMIT: usize = 65_536;

/// Resync interval when the store has no change feed
const RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves pending reservations in one namespace
pub struct PoolAllocator {
    store: Arc<dyn ResourceStore>,
    namespace: String,
}

impl PoolAllocator {
    pub fn new(store: Arc<dyn ResourceStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Resolve every non-terminal reservation once
    ///
    /// Returns how many reservations were moved to a terminal state.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let reservations = self
            .store
            .list_reservations(&self.namespace, &LabelSelector::everything())
            .await?;

        let mut in_use: HashSet<IpAddr> = reservations
            .iter()
            .filter(|r| !r.is_failed())
            .filter_map(|r| r.reserved_address())
            .collect();

        let mut resolved = 0;
        for reservation in reservations.iter().filter(|r| !r.is_terminal()) {
            let subnet = self
                .store
                .get_subnet(&self.namespace, &reservation.spec.subnet)
                .await?;

            let status = match subnet {
                Some(subnet) => allocate(&subnet, reservation.spec.ip, &in_use),
                None => failed(format!("subnet {} not found", reservation.spec.subnet)),
            };
            if let Some(ip) = status.reserved {
                in_use.insert(ip);
            }

            let state = status.state;
            match self
                .store
                .update_reservation_status(&self.namespace, reservation.name(), status)
                .await
            {
                Ok(updated) => {
                    info!(
                        reservation = %reservation.name(),
                        state = ?state,
                        address = ?updated.reserved_address(),
                        "Resolved reservation"
                    );
                    resolved += 1;
                }
                // Deleted while we were deciding
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    /// Run until the shutdown signal flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.watch();
        info!(namespace = %self.namespace, watch = events.is_some(), "Pool allocator started");

        if let Err(e) = self.reconcile_once().await {
            warn!(error = %e, "Initial reservation sweep failed");
        }

        loop {
            let wake = async {
                match events.as_mut() {
                    Some(rx) => match rx.recv().await {
                        Ok(event) => {
                            event.kind == ResourceKind::IpReservation
                                && event.action == EventAction::Added
                                && event.namespace == self.namespace
                        }
                        Err(RecvError::Lagged(_)) => true,
                        Err(RecvError::Closed) => {
                            tokio::time::sleep(RESYNC_INTERVAL).await;
                            true
                        }
                    },
                    None => {
                        tokio::time::sleep(RESYNC_INTERVAL).await;
                        true
                    }
                }
            };

            tokio::select! {
                relevant = wake => {
                    if relevant {
                        if let Err(e) = self.reconcile_once().await {
                            warn!(error = %e, "Reservation sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool allocator shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn failed(message: String) -> IpReservationStatus {
    debug!(%message, "Reservation cannot be satisfied");
    IpReservationStatus {
        state: ReservationState::Failed,
        reserved: None,
        message: Some(message),
    }
}

fn finished(ip: IpAddr) -> IpReservationStatus {
    IpReservationStatus {
        state: ReservationState::Finished,
        reserved: Some(ip),
        message: None,
    }
}

/// Pick an address for a reservation in a subnet
fn allocate(
    subnet: &Subnet,
    requested: Option<IpAddr>,
    in_use: &HashSet<IpAddr>,
) -> IpReservationStatus {
    let range = subnet.reserved_range();

    if let Some(ip) = requested {
        if !range.contains(ip) {
            return failed(format!("{} is outside {}", ip, range));
        }
        if in_use.contains(&ip) {
            return failed(format!("{} is already reserved", ip));
        }
        return finished(ip);
    }

    match first_free(range, in_use) {
        Some(ip) => finished(ip),
        None => failed(format!("{} is exhausted", range)),
    }
}

fn first_free(range: IpNetwork, in_use: &HashSet<IpAddr>) -> Option<IpAddr> {
    match range {
        IpNetwork::V4(net) => {
            let network = net.network();
            let broadcast = net.broadcast();
            net.iter()
                .filter(|ip| net.prefix() >= 31 || (*ip != network && *ip != broadcast))
                .map(IpAddr::V4)
                .find(|ip| !in_use.contains(ip))
        }
        IpNetwork::V6(net) => {
            let network = net.network();
            net.iter()
                .take(V6_SCAN_LIMIT)
                .filter(|ip| net.prefix() >= 127 || *ip != network)
                .map(IpAddr::V6)
                .find(|ip| !in_use.contains(ip))
        }
    }
}
