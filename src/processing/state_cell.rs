/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Holds the operator's state behind an [`ExclusionBarrier`].
//!
//! A `StateCell` is a lock whose read and write sides are the two sides of the barrier:
//! 1. [`read`](StateCell::read) takes one permit and grants shared access. When the barrier has a single
//!    permit (single-worker mode), holding it is exclusive, and the guard also grants mutable access.
//! 2. [`write`](StateCell::write) takes every permit and grants mutable access.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use crate::state::State;

use super::barrier::{ExclusionBarrier, ExclusivePermit, SharedPermit};

pub type StateSlot = Option<Box<dyn State>>;

pub struct StateCell {
    barrier: ExclusionBarrier,
    state: SyncUnsafeCell<StateSlot>,
}

impl StateCell {
    pub fn new(permits: usize, state: StateSlot) -> StateCell {
        StateCell {
            barrier: ExclusionBarrier::new(permits),
            state: SyncUnsafeCell::new(state),
        }
    }

    pub fn barrier(&self) -> &ExclusionBarrier {
        &self.barrier
    }

    pub fn read(&self) -> StateReadGuard<'_> {
        let permit = self.barrier.acquire();
        StateReadGuard {
            cell: self,
            _permit: permit,
        }
    }

    pub fn write(&self) -> StateWriteGuard<'_> {
        let permit = self.barrier.acquire_all();
        // Safety: every permit is held, so no other guard of this cell exists.
        let state = unsafe { &mut *self.state.get() };
        StateWriteGuard {
            state,
            _permit: permit,
        }
    }
}

pub struct StateReadGuard<'a> {
    cell: &'a StateCell,
    _permit: SharedPermit<'a>,
}

impl StateReadGuard<'_> {
    /// Mutable access to the state. `None` when the barrier has more than one permit, since other read
    /// guards may exist at the same time.
    pub fn get_mut(&mut self) -> Option<&mut StateSlot> {
        if self.cell.barrier.permits() == 1 {
            // Safety: the only permit is held by this guard, and the returned borrow is tied to it.
            Some(unsafe { &mut *self.cell.state.get() })
        } else {
            None
        }
    }
}

impl Deref for StateReadGuard<'_> {
    type Target = StateSlot;

    fn deref(&self) -> &Self::Target {
        // Safety: a write guard cannot exist while this guard holds a permit.
        unsafe { &*self.cell.state.get() }
    }
}

pub struct StateWriteGuard<'a> {
    state: &'a mut StateSlot,
    _permit: ExclusivePermit<'a>,
}

impl Deref for StateWriteGuard<'_> {
    type Target = StateSlot;

    fn deref(&self) -> &Self::Target {
        self.state
    }
}

impl DerefMut for StateWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state
    }
}

struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send + Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    fn new(t: T) -> SyncUnsafeCell<T> {
        SyncUnsafeCell(UnsafeCell::new(t))
    }
}

impl<T> Deref for SyncUnsafeCell<T> {
    type Target = UnsafeCell<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
