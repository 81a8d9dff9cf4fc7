//! Update throttle.
//!
//! A fixed pool of leases bounding how many weight-update broadcasts are
//! in flight. The pool is handed to the control plane explicitly, so tests
//! can build one with a capacity of 1.

use crate::core::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of broadcast leases. Waiters are served in FIFO order.
#[derive(Clone, Debug)]
pub struct UpdateThrottle {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    peak: Arc<AtomicUsize>,
}

/// A held lease; released when dropped, including on failure paths.
#[derive(Debug)]
pub struct ThrottleToken {
    _permit: OwnedSemaphorePermit,
}

impl UpdateThrottle {
    /// Create a throttle with `capacity` leases.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a lease.
    pub async fn acquire(&self) -> Result<ThrottleToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)?;
        self.peak.fetch_max(self.in_flight(), Ordering::SeqCst);
        Ok(ThrottleToken { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Leases currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Highest number of leases ever held at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Fail every pending and future `acquire`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
