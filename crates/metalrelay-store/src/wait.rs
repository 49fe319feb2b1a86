//! Bounded waits on reservation state
//!
//! Both strategies share one contract: block the caller until the predicate
//! holds for the current record (`None` once it is deleted), and give up with
//! `WaitError::Timeout` after a fixed ceiling. Nothing waits indefinitely.

use crate::{ResourceKind, ResourceStore, StoreError};
use metalrelay_crd::IpReservation;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Default interval between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors from a bounded wait
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {after:?} waiting for reservation {name}")]
    Timeout { name: String, after: Duration },

    #[error("store has no change feed to watch")]
    WatchUnavailable,

    #[error("change feed closed while waiting for reservation {0}")]
    WatchClosed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How to wait for a record to change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Re-read the record at a fixed interval
    Poll { interval: Duration },

    /// Re-read the record whenever the store reports a change to it
    Watch,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Poll {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitStrategy {
    /// Wait until `done` holds for the named reservation
    ///
    /// Returns the record observed when the predicate held (`None` when it
    /// held for a missing record).
    pub async fn await_reservation<F>(
        &self,
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
        timeout: Duration,
        done: F,
    ) -> Result<Option<IpReservation>, WaitError>
    where
        F: Fn(Option<&IpReservation>) -> bool + Send + Sync,
    {
        let wait = async {
            match *self {
                WaitStrategy::Poll { interval } => {
                    poll(store, namespace, name, interval, &done).await
                }
                WaitStrategy::Watch => watch(store, namespace, name, &done).await,
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(WaitError::Timeout {
                name: name.to_string(),
                after: timeout,
            }),
        }
    }
}

async fn poll<F>(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    interval: Duration,
    done: &F,
) -> Result<Option<IpReservation>, WaitError>
where
    F: Fn(Option<&IpReservation>) -> bool + Send + Sync,
{
    loop {
        let current = store.get_reservation(namespace, name).await?;
        if done(current.as_ref()) {
            return Ok(current);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn watch<F>(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    done: &F,
) -> Result<Option<IpReservation>, WaitError>
where
    F: Fn(Option<&IpReservation>) -> bool + Send + Sync,
{
    // Subscribe before the first read so no change slips in between
    let mut events = store.watch().ok_or(WaitError::WatchUnavailable)?;

    let current = store.get_reservation(namespace, name).await?;
    if done(current.as_ref()) {
        return Ok(current);
    }

    loop {
        match events.recv().await {
            Ok(event)
                if event.kind == ResourceKind::IpReservation
                    && event.namespace == namespace
                    && event.name == name => {}
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, reservation = name, "change feed lagged, re-reading");
            }
            Err(RecvError::Closed) => return Err(WaitError::WatchClosed(name.to_string())),
        }

        let current = store.get_reservation(namespace, name).await?;
        if done(current.as_ref()) {
            return Ok(current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, Preconditions};
    use metalrelay_crd::{IpReservationStatus, MacAddr, ReservationState};
    use std::sync::Arc;

    fn reservation() -> IpReservation {
        let mac: MacAddr = "00:11:22:33:44:55".parse().unwrap();
        IpReservation::new("default", "rack-1", &mac)
    }

    fn finished() -> IpReservationStatus {
        IpReservationStatus {
            state: ReservationState::Finished,
            reserved: Some("10.0.0.7".parse().unwrap()),
            message: None,
        }
    }

    async fn finish_later(store: Arc<MemoryStore>, name: String) {
        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .update_reservation_status("default", &name, finished())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_sees_terminal_state() {
        let store = Arc::new(MemoryStore::new());
        let created = store.create_reservation(&reservation()).await.unwrap();
        tokio::spawn(finish_later(store.clone(), created.name().to_string()));

        let strategy = WaitStrategy::Poll {
            interval: Duration::from_millis(5),
        };
        let seen = strategy
            .await_reservation(
                store.as_ref(),
                "default",
                created.name(),
                Duration::from_secs(2),
                |r| r.map(|r| r.is_terminal()).unwrap_or(false),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.state(), ReservationState::Finished);
    }

    #[tokio::test]
    async fn test_watch_sees_terminal_state() {
        let store = Arc::new(MemoryStore::new());
        let created = store.create_reservation(&reservation()).await.unwrap();
        tokio::spawn(finish_later(store.clone(), created.name().to_string()));

        let seen = WaitStrategy::Watch
            .await_reservation(
                store.as_ref(),
                "default",
                created.name(),
                Duration::from_secs(2),
                |r| r.map(|r| r.is_terminal()).unwrap_or(false),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.reserved_address(), Some("10.0.0.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_watch_sees_deletion() {
        let store = Arc::new(MemoryStore::new());
        let created = store.create_reservation(&reservation()).await.unwrap();
        let name = created.name().to_string();
        let deleter = store.clone();
        let target = name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            deleter
                .delete_reservation("default", &target, Preconditions::none())
                .await
                .unwrap();
        });

        let seen = WaitStrategy::Watch
            .await_reservation(
                store.as_ref(),
                "default",
                &name,
                Duration::from_secs(2),
                |r| r.is_none(),
            )
            .await
            .unwrap();
        assert!(seen.is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let store = MemoryStore::new();
        let created = store.create_reservation(&reservation()).await.unwrap();

        for strategy in [WaitStrategy::default(), WaitStrategy::Watch] {
            let err = strategy
                .await_reservation(
                    &store,
                    "default",
                    created.name(),
                    Duration::from_millis(50),
                    |r| r.map(|r| r.is_terminal()).unwrap_or(false),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, WaitError::Timeout { .. }));
        }
    }
}
