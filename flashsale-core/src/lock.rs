//! Lease lock typestate.
//!
//! A lease lock can only be released while it is in the `Acquired` state, and
//! releasing consumes it, so a handle can never be released twice.
//!
//! # State Transition Diagram
//!
//! ```text
//! (unlocked) ─── try_acquire() ──→ Acquired ─── release() ──→ (unlocked)
//!                                     │
//!                               lease expires ──→ (unlocked, holder unaware)
//! ```
//!
//! The last edge is the known gap of lease-based locking: a holder whose work
//! outlives the lease keeps its `Lock<Acquired>` while another requester may
//! acquire the same resource. Releasing a stale handle is a no-op at the
//! store because release compares the holder id.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

// ============================================================================
// LOCK DATA (state-independent)
// ============================================================================

/// What the lock store knows about a held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockData {
    /// Fully qualified store key, e.g. `lock:order:42`.
    pub resource_key: String,
    /// Unique per acquisition; stored as the lock value.
    pub holder_id: String,
    pub acquired_at: Timestamp,
    pub lease_expire_at: Timestamp,
}

impl LockData {
    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.lease_expire_at
    }

    /// Calculate remaining lease until expiry.
    pub fn remaining_lease(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.lease_expire_at {
            None
        } else {
            (self.lease_expire_at - now).to_std().ok()
        }
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lock states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Lock is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LockState for Acquired {}

/// Lock has been released (for documentation; locks in this state don't exist at runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LockState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Acquired {}
    impl Sealed for super::Released {}
}

// ============================================================================
// LOCK TYPESTATE WRAPPER
// ============================================================================

/// A lease lock with compile-time state tracking.
///
/// Not `Clone`: exactly one owner holds the handle until it is released.
#[derive(Debug)]
pub struct Lock<S: LockState> {
    data: LockData,
    _state: PhantomData<S>,
}

impl<S: LockState> Lock<S> {
    /// Access the underlying lock data (read-only).
    pub fn data(&self) -> &LockData {
        &self.data
    }

    pub fn resource_key(&self) -> &str {
        &self.data.resource_key
    }

    pub fn holder_id(&self) -> &str {
        &self.data.holder_id
    }

    pub fn lease_expire_at(&self) -> Timestamp {
        self.data.lease_expire_at
    }
}

impl Lock<Acquired> {
    /// Create a new acquired lock from data.
    ///
    /// This should only be called when the set-if-absent write succeeded.
    pub fn new(data: LockData) -> Self {
        Lock {
            data,
            _state: PhantomData,
        }
    }

    /// Release the lock and return the underlying data.
    ///
    /// Consumes the lock, preventing further operations. The caller deletes
    /// the store key only if it still holds `holder_id`.
    pub fn release(self) -> LockData {
        self.data
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }

    pub fn remaining_lease(&self, now: Timestamp) -> Option<Duration> {
        self.data.remaining_lease(now)
    }
}

impl fmt::Display for Lock<Acquired> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} held by {} until {}",
            self.data.resource_key, self.data.holder_id, self.data.lease_expire_at
        )
    }
}
