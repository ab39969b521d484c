//! Lease watching and expiry notification.
//!
//! The coordinator periodically sweeps registered leases and notifies a
//! listener when one stops being valid. Each registration fires at most
//! once: a fired watch is deregistered before its callback runs, so a
//! slow listener cannot be notified twice for the same lease.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::warn;

use dray_core::ProcessorId;

use crate::error::{Error, Result};
use crate::lease::{LeaseTerm, SharedLease};
use crate::metrics::EngineMetrics;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lease watch table lock poisoned")
}

/// Callbacks fired when a watched lease stops being valid.
pub trait LeaseListener: Send + Sync {
    /// The lease's validity window elapsed without renewal.
    fn on_lease_expiry(&self, processor: &ProcessorId);

    /// The lease was explicitly canceled by its owner.
    fn on_lease_canceled(&self, processor: &ProcessorId) {
        let _ = processor;
    }

    /// The lease was suspended by its owner.
    fn on_lease_suspended(&self, processor: &ProcessorId) {
        let _ = processor;
    }
}

enum FiredKind {
    Expired,
    Canceled,
    Suspended,
}

struct Watch {
    lease: SharedLease,
    listener: Arc<dyn LeaseListener>,
}

/// Sweeps registered leases and fires listener callbacks on invalidity.
///
/// Sweeping takes an explicit `now` so expiry behavior is deterministic in
/// tests; the spawned loop feeds it the wall clock.
pub struct LeaseExpiryCoordinator {
    watches: Mutex<HashMap<ProcessorId, Watch>>,
    metrics: EngineMetrics,
}

impl Default for LeaseExpiryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseExpiryCoordinator {
    /// Creates a coordinator with no watches.
    #[must_use]
    pub fn new() -> Self {
        Self {
            watches: Mutex::new(HashMap::new()),
            metrics: EngineMetrics::new(),
        }
    }

    /// Registers a lease to watch.
    ///
    /// Returns false without replacing if the processor is already watched.
    pub fn register(
        &self,
        processor: ProcessorId,
        lease: SharedLease,
        listener: Arc<dyn LeaseListener>,
    ) -> Result<bool> {
        let mut watches = self.watches.lock().map_err(poison_err)?;
        if watches.contains_key(&processor) {
            return Ok(false);
        }
        watches.insert(processor, Watch { lease, listener });
        Ok(true)
    }

    /// Stops watching a processor's lease.
    ///
    /// Returns true if a watch was removed; deregistering an unknown
    /// processor is a no-op returning false.
    pub fn deregister(&self, processor: &ProcessorId) -> Result<bool> {
        Ok(self
            .watches
            .lock()
            .map_err(poison_err)?
            .remove(processor)
            .is_some())
    }

    /// Returns true if the processor's lease is currently watched.
    pub fn is_watching(&self, processor: &ProcessorId) -> Result<bool> {
        Ok(self.watches.lock().map_err(poison_err)?.contains_key(processor))
    }

    /// Sweeps all watches once, firing and removing invalid ones.
    ///
    /// Callbacks run after the watch table lock is released, so a listener
    /// may re-register from within its callback. Returns the number of
    /// watches fired.
    pub fn poll_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired: Vec<(ProcessorId, FiredKind, Arc<dyn LeaseListener>)> = Vec::new();
        {
            let mut watches = self.watches.lock().map_err(poison_err)?;
            let invalid: Vec<ProcessorId> = watches
                .iter()
                .filter_map(|(id, watch)| match watch.lease.is_valid_at(now) {
                    Ok(true) => None,
                    Ok(false) => Some(*id),
                    Err(error) => {
                        warn!(processor_id = %id, %error, "skipping unreadable lease");
                        None
                    }
                })
                .collect();

            for id in invalid {
                let Some(watch) = watches.remove(&id) else {
                    continue;
                };
                let kind = match watch.lease.snapshot() {
                    Ok(lease) => match lease.term {
                        LeaseTerm::Canceled => FiredKind::Canceled,
                        LeaseTerm::Suspended => FiredKind::Suspended,
                        LeaseTerm::Active { .. } | LeaseTerm::Indefinite => FiredKind::Expired,
                    },
                    Err(_) => FiredKind::Expired,
                };
                fired.push((id, kind, watch.listener));
            }
        }

        self.metrics.record_lease_sweep(!fired.is_empty());
        let count = fired.len();
        for (id, kind, listener) in fired {
            match kind {
                FiredKind::Expired => {
                    warn!(processor_id = %id, "lease expired");
                    listener.on_lease_expiry(&id);
                }
                FiredKind::Canceled => listener.on_lease_canceled(&id),
                FiredKind::Suspended => listener.on_lease_suspended(&id),
            }
        }
        Ok(count)
    }

    /// Spawns the periodic sweep loop.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(error) = self.poll_once(Utc::now()) {
                    warn!(%error, "lease sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::Lease;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        expired: AtomicUsize,
        canceled: AtomicUsize,
        suspended: AtomicUsize,
    }

    impl LeaseListener for CountingListener {
        fn on_lease_expiry(&self, _: &ProcessorId) {
            self.expired.fetch_add(1, Ordering::SeqCst);
        }
        fn on_lease_canceled(&self, _: &ProcessorId) {
            self.canceled.fetch_add(1, Ordering::SeqCst);
        }
        fn on_lease_suspended(&self, _: &ProcessorId) {
            self.suspended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        chrono::DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn active_lease(duration_secs: u64, acquired: DateTime<Utc>) -> SharedLease {
        SharedLease::new(Lease::acquired(
            Duration::from_secs(duration_secs),
            acquired,
        ))
    }

    #[test]
    fn valid_lease_does_not_fire() {
        let coordinator = LeaseExpiryCoordinator::new();
        let listener = Arc::new(CountingListener::default());
        let id = ProcessorId::generate();
        coordinator
            .register(id, active_lease(60, at(0)), listener.clone())
            .unwrap();

        assert_eq!(coordinator.poll_once(at(30)).unwrap(), 0);
        assert!(coordinator.is_watching(&id).unwrap());
        assert_eq!(listener.expired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expired_lease_fires_exactly_once() {
        let coordinator = LeaseExpiryCoordinator::new();
        let listener = Arc::new(CountingListener::default());
        let id = ProcessorId::generate();
        coordinator
            .register(id, active_lease(10, at(0)), listener.clone())
            .unwrap();

        assert_eq!(coordinator.poll_once(at(11)).unwrap(), 1);
        assert!(!coordinator.is_watching(&id).unwrap());
        // Second sweep observes nothing; the watch is gone.
        assert_eq!(coordinator.poll_once(at(12)).unwrap(), 0);
        assert_eq!(listener.expired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn canceled_lease_routes_to_canceled_callback() {
        let coordinator = LeaseExpiryCoordinator::new();
        let listener = Arc::new(CountingListener::default());
        let id = ProcessorId::generate();
        let lease = active_lease(60, at(0));
        coordinator.register(id, lease.clone(), listener.clone()).unwrap();

        lease.cancel().unwrap();
        assert_eq!(coordinator.poll_once(at(1)).unwrap(), 1);
        assert_eq!(listener.canceled.load(Ordering::SeqCst), 1);
        assert_eq!(listener.expired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn suspended_lease_routes_to_suspended_callback() {
        let coordinator = LeaseExpiryCoordinator::new();
        let listener = Arc::new(CountingListener::default());
        let id = ProcessorId::generate();
        let lease = active_lease(60, at(0));
        coordinator.register(id, lease.clone(), listener.clone()).unwrap();

        lease.suspend().unwrap();
        assert_eq!(coordinator.poll_once(at(1)).unwrap(), 1);
        assert_eq!(listener.suspended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn renewed_lease_survives_sweeps() {
        let coordinator = LeaseExpiryCoordinator::new();
        let listener = Arc::new(CountingListener::default());
        let id = ProcessorId::generate();
        let lease = active_lease(10, at(0));
        coordinator.register(id, lease.clone(), listener.clone()).unwrap();

        lease.extend(Duration::from_secs(10), at(8)).unwrap();
        assert_eq!(coordinator.poll_once(at(12)).unwrap(), 0);
        assert!(coordinator.is_watching(&id).unwrap());
    }

    #[test]
    fn register_is_first_writer_wins() {
        let coordinator = LeaseExpiryCoordinator::new();
        let listener = Arc::new(CountingListener::default());
        let id = ProcessorId::generate();

        assert!(coordinator
            .register(id, active_lease(10, at(0)), listener.clone())
            .unwrap());
        assert!(!coordinator
            .register(id, active_lease(10, at(0)), listener.clone())
            .unwrap());
        assert!(coordinator.deregister(&id).unwrap());
        assert!(!coordinator.deregister(&id).unwrap());
    }
}
