/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The checkpoint exclusion barrier.
//!
//! An [`ExclusionBarrier`] is a counting semaphore of `N` permits. Each data-path worker holds one permit
//! while it processes a tuple; a checkpoint (or a state installation) holds all `N`. Holding every
//! permit therefore guarantees that no worker is in the middle of mutating the state.
//!
//! Taking all permits is atomic with respect to workers taking one: a pending [`acquire_all`](ExclusionBarrier::acquire_all)
//! registers itself before waiting, and from then on no new single permit is handed out. Permits are
//! only ever handed back, never partially collected, so neither side can starve the other.
//!
//! With `N = 1` the barrier degenerates into the binary mutex of single-worker mode.

use std::sync::{Condvar, Mutex, MutexGuard};

pub struct ExclusionBarrier {
    permits: usize,
    inner: Mutex<Permits>,
    released: Condvar,
}

struct Permits {
    available: usize,
    exclusive_waiters: usize,
}

impl ExclusionBarrier {
    pub fn new(permits: usize) -> ExclusionBarrier {
        let permits = permits.max(1);
        ExclusionBarrier {
            permits,
            inner: Mutex::new(Permits {
                available: permits,
                exclusive_waiters: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Total number of permits.
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Number of permits not currently held.
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Take one permit, blocking while none is available or while someone is waiting to take them all.
    pub fn acquire(&self) -> SharedPermit<'_> {
        let mut inner = self.lock();
        while inner.exclusive_waiters > 0 || inner.available == 0 {
            inner = self.wait(inner);
        }
        inner.available -= 1;
        SharedPermit { barrier: self }
    }

    /// Take every permit, blocking until all of them have been handed back.
    pub fn acquire_all(&self) -> ExclusivePermit<'_> {
        let mut inner = self.lock();
        inner.exclusive_waiters += 1;
        while inner.available < self.permits {
            inner = self.wait(inner);
        }
        inner.available = 0;
        inner.exclusive_waiters -= 1;
        ExclusivePermit { barrier: self }
    }

    fn lock(&self) -> MutexGuard<'_, Permits> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::warn!("Exclusion barrier lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // An interrupted wait is resumed on the recovered guard. Returning without the permit would break
    // exclusion.
    fn wait<'a>(&self, inner: MutexGuard<'a, Permits>) -> MutexGuard<'a, Permits> {
        self.released.wait(inner).unwrap_or_else(|poisoned| {
            log::warn!("Interrupted while waiting on the exclusion barrier, resuming the wait");
            poisoned.into_inner()
        })
    }

    fn release(&self, count: usize) {
        let mut inner = self.lock();
        inner.available = (inner.available + count).min(self.permits);
        drop(inner);
        self.released.notify_all();
    }
}

/// One permit of an [`ExclusionBarrier`], handed back on drop.
pub struct SharedPermit<'a> {
    barrier: &'a ExclusionBarrier,
}

impl Drop for SharedPermit<'_> {
    fn drop(&mut self) {
        self.barrier.release(1);
    }
}

/// Every permit of an [`ExclusionBarrier`], handed back on drop.
pub struct ExclusivePermit<'a> {
    barrier: &'a ExclusionBarrier,
}

impl Drop for ExclusivePermit<'_> {
    fn drop(&mut self) {
        self.barrier.release(self.barrier.permits);
    }
}
