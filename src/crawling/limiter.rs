//! Counting admission gate.
//!
//! Wraps a [`tokio::sync::Semaphore`] so a slot is held as an RAII guard:
//! release happens on drop, which covers early returns, `?`, cancellation of
//! the holding future and panics unwinding through the holder.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use super::scope::{Interrupted, RunScope};

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("limiter '{0}' is closed")]
    Closed(String),
    #[error("admission to '{name}' interrupted: {reason}")]
    Interrupted { name: String, reason: Interrupted },
}

#[derive(Debug, Default)]
struct Gauge {
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounds simultaneous units of work for one stage.
///
/// Cloning shares the underlying semaphore.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    gauge: Arc<Gauge>,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<Gauge>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.gauge.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Capacity is clamped to at least one slot.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            gauge: Arc::new(Gauge::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units currently holding a slot.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.gauge.in_use.load(Ordering::SeqCst)
    }

    /// Highest simultaneous occupancy observed since creation.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    /// Wait until a slot is free.
    pub async fn acquire(&self) -> Result<Slot, LimiterError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed(self.name.clone()))?;
        Ok(self.admit(permit))
    }

    /// Wait for a slot, giving up if `scope` is cancelled or expires first.
    pub async fn acquire_within(&self, scope: &RunScope) -> Result<Slot, LimiterError> {
        let permit = scope
            .run(Arc::clone(&self.semaphore).acquire_owned())
            .await
            .map_err(|reason| LimiterError::Interrupted {
                name: self.name.clone(),
                reason,
            })?
            .map_err(|_| LimiterError::Closed(self.name.clone()))?;
        Ok(self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> Slot {
        let now = self.gauge.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        trace!(limiter = %self.name, in_use = now, capacity = self.capacity, "slot acquired");
        Slot {
            _permit: permit,
            gauge: Arc::clone(&self.gauge),
        }
    }
}
