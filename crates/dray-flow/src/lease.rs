//! Time-bounded ownership leases.
//!
//! A [`Lease`] grants a processor ownership of a resource (its assignment
//! queue, and transitively the submissions assigned to it) for a bounded
//! window. The lease term is an explicit tagged union rather than sentinel
//! durations, so illegal states are unrepresentable:
//!
//! - [`LeaseTerm::Active`]: valid for `[last_updated_at, last_updated_at + duration]`
//! - [`LeaseTerm::Canceled`]: terminal, no mutation revives it
//! - [`LeaseTerm::Suspended`]: dormant, revived only by [`Lease::extend`]
//! - [`LeaseTerm::Indefinite`]: never expires
//!
//! ## Ownership Discipline
//!
//! A lease is mutated only by its owner, through [`SharedLease`] which holds
//! a single lock per lease instance. The expiry coordinator only reads.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The term of a lease: how long, if at all, the grant remains valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum LeaseTerm {
    /// Time-bounded grant, valid for `duration` past the last update.
    Active {
        /// Validity window length from the last update.
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Terminal: the lease was canceled by its owner and cannot be revived.
    Canceled,
    /// Dormant: not valid, but revivable by an explicit extension.
    Suspended,
    /// Never expires.
    Indefinite,
}

/// A time-bounded grant of ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// When the lease was first acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease was last extended.
    pub last_updated_at: DateTime<Utc>,
    /// The current term.
    pub term: LeaseTerm,
}

impl Lease {
    /// Creates a time-bounded lease acquired at `now`.
    #[must_use]
    pub const fn acquired(duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            acquired_at: now,
            last_updated_at: now,
            term: LeaseTerm::Active { duration },
        }
    }

    /// Creates a lease that never expires.
    #[must_use]
    pub const fn indefinite(now: DateTime<Utc>) -> Self {
        Self {
            acquired_at: now,
            last_updated_at: now,
            term: LeaseTerm::Indefinite,
        }
    }

    /// Returns true if the lease has been canceled.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self.term, LeaseTerm::Canceled)
    }

    /// Returns true if the lease is suspended.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self.term, LeaseTerm::Suspended)
    }

    /// Returns true if the lease never expires.
    #[must_use]
    pub const fn is_indefinite(&self) -> bool {
        matches!(self.term, LeaseTerm::Indefinite)
    }

    /// Returns true if the lease is valid at time `t`.
    ///
    /// Holds iff the lease is indefinite, or active with
    /// `last_updated_at + duration >= t`.
    #[must_use]
    pub fn is_valid_at(&self, t: DateTime<Utc>) -> bool {
        match self.term {
            LeaseTerm::Indefinite => true,
            LeaseTerm::Canceled | LeaseTerm::Suspended => false,
            LeaseTerm::Active { duration } => {
                let window =
                    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
                self.last_updated_at + window >= t
            }
        }
    }

    /// Extends the lease, resetting its validity window to `[now, now + duration]`.
    ///
    /// Extension is also the only way to revive a [`LeaseTerm::Suspended`] lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLeaseMutation`] if the lease has been canceled;
    /// cancellation is terminal.
    pub fn extend(&mut self, duration: Duration, now: DateTime<Utc>) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::InvalidLeaseMutation {
                message: "cannot extend a canceled lease".to_string(),
            });
        }
        self.term = LeaseTerm::Active { duration };
        self.last_updated_at = now;
        Ok(())
    }

    /// Cancels the lease. Terminal; no further mutation revives it.
    pub fn cancel(&mut self) {
        self.term = LeaseTerm::Canceled;
    }

    /// Suspends the lease. Revivable only by [`Lease::extend`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLeaseMutation`] if the lease has been canceled.
    pub fn suspend(&mut self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::InvalidLeaseMutation {
                message: "cannot suspend a canceled lease".to_string(),
            });
        }
        self.term = LeaseTerm::Suspended;
        Ok(())
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lease lock poisoned")
}

/// A shareable handle to a lease, locked per instance.
///
/// The owner mutates through this handle; the expiry coordinator holds a
/// clone and only reads.
#[derive(Debug, Clone)]
pub struct SharedLease {
    inner: Arc<Mutex<Lease>>,
}

impl SharedLease {
    /// Wraps a lease in a shareable handle.
    #[must_use]
    pub fn new(lease: Lease) -> Self {
        Self {
            inner: Arc::new(Mutex::new(lease)),
        }
    }

    /// Returns a copy of the current lease state.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Lease> {
        let lease = self.inner.lock().map_err(poison_err)?;
        Ok(lease.clone())
    }

    /// Returns true if the lease is valid at time `t`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn is_valid_at(&self, t: DateTime<Utc>) -> Result<bool> {
        let lease = self.inner.lock().map_err(poison_err)?;
        Ok(lease.is_valid_at(t))
    }

    /// Extends the lease window to `[now, now + duration]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is canceled or the lock is poisoned.
    pub fn extend(&self, duration: Duration, now: DateTime<Utc>) -> Result<()> {
        let mut lease = self.inner.lock().map_err(poison_err)?;
        lease.extend(duration, now)
    }

    /// Cancels the lease.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn cancel(&self) -> Result<()> {
        let mut lease = self.inner.lock().map_err(poison_err)?;
        lease.cancel();
        Ok(())
    }

    /// Suspends the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease is canceled or the lock is poisoned.
    pub fn suspend(&self) -> Result<()> {
        let mut lease = self.inner.lock().map_err(poison_err)?;
        lease.suspend()
    }
}
