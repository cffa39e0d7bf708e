//! Bounded worker pool shared by every batch run.
//!
//! The pool is a semaphore: a task may render or deliver only while it holds
//! a [`SlotToken`]. Tasks waiting on a retry backoff release their slot and
//! reclaim it before the next attempt, so a backoff window never starves other
//! employees. `active`/`peak` count held slots and are what tests use to check
//! the concurrency cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Default)]
struct PoolStats {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at once since the pool was created.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<SlotToken, AcquireError> {
        let slot = self.acquire_slot().await?;
        Ok(SlotToken {
            slot: Some(slot),
            pool: self.clone(),
        })
    }

    async fn acquire_slot(&self) -> Result<HeldSlot, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(active, Ordering::SeqCst);
        Ok(HeldSlot {
            _permit: permit,
            stats: self.stats.clone(),
        })
    }
}

struct HeldSlot {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
}

impl Drop for HeldSlot {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A task's claim on one pool slot.
///
/// Dropping the token returns the slot. `release` gives it back early and
/// `reclaim` waits for a slot again.
pub struct SlotToken {
    slot: Option<HeldSlot>,
    pool: WorkerPool,
}

impl SlotToken {
    /// Returns `true` if a slot was released, `false` if already released.
    pub fn release(&mut self) -> bool {
        self.slot.take().is_some()
    }

    pub async fn reclaim(&mut self) -> Result<(), AcquireError> {
        if self.slot.is_none() {
            self.slot = Some(self.pool.acquire_slot().await?);
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.slot.is_some()
    }
}
