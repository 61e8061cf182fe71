/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The interface between operator code and the processing unit hosting it.
//!
//! Operator business logic implements [`Operator`]. For every tuple, the processing unit calls
//! [`process_data`](Operator::process_data) with a [`ProcessingApi`] through which the operator reads and
//! mutates its state and emits tuples downstream.
//!
//! ## Concurrency
//!
//! The `ProcessingApi` holds one permit of the unit's [exclusion barrier](super::barrier) for as long as it
//! lives:
//! - In single-worker mode that permit is the only one, so [`state_mut`](ProcessingApi::state_mut) is
//!   available.
//! - In multi-worker mode other workers hold the other permits, so the state is only reachable through a
//!   shared reference and must be [partitionable](crate::state::Partitionable).
//!
//! [`send`](ProcessingApi::send) hands the permit back for the duration of the downstream I/O, so a
//! checkpoint waiting for every permit is never blocked behind a slow channel. References obtained from
//! the API before calling `send` cannot be used after it.

use crate::state::State;
use crate::types::{DataTuple, OperatorId};

use super::context::TopologyContext;
use super::state_cell::StateReadGuard;
use super::unit::{ProcessingUnit, RoutingError};

pub trait Operator: Send + Sync + 'static {
    /// Called once by [`ProcessingUnit::init_operator`], before any tuple is processed.
    fn set_up(&self, _topology: &TopologyContext) {}

    /// Process one tuple.
    fn process_data(&self, tuple: DataTuple, api: &mut ProcessingApi);

    /// Process the tuples of one batch, in order. Processes them one by one by default.
    fn process_batch(&self, tuples: Vec<DataTuple>, api: &mut ProcessingApi) {
        for tuple in tuples {
            self.process_data(tuple, api);
        }
    }

    /// Names of the attributes of the tuples this operator consumes, in wire order.
    fn declared_working_attributes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called after a state received from a backup has been installed.
    fn state_installed(&self, _state: &dyn State) {}
}

pub struct ProcessingApi<'a> {
    unit: &'a ProcessingUnit,
    guard: Option<StateReadGuard<'a>>,
}

impl<'a> ProcessingApi<'a> {
    pub(crate) fn new(unit: &'a ProcessingUnit) -> ProcessingApi<'a> {
        ProcessingApi {
            unit,
            guard: Some(unit.state_cell().read()),
        }
    }

    pub fn op_id(&self) -> OperatorId {
        self.unit.op_id()
    }

    /// Shared access to the operator's state.
    pub fn state(&self) -> Option<&dyn State> {
        self.guard.as_ref().and_then(|guard| guard.as_deref())
    }

    /// Exclusive access to the operator's state. `None` in multi-worker mode.
    pub fn state_mut(&mut self) -> Option<&mut (dyn State + 'static)> {
        self.guard
            .as_mut()
            .and_then(|guard| guard.get_mut())
            .and_then(|state| state.as_deref_mut())
    }

    /// Shared access to the operator's state as its concrete type.
    pub fn state_as<T: State>(&self) -> Option<&T> {
        self.state()?.as_any().downcast_ref()
    }

    /// Exclusive access to the operator's state as its concrete type. `None` in multi-worker mode.
    pub fn state_as_mut<T: State>(&mut self) -> Option<&mut T> {
        self.state_mut()?.as_any_mut().downcast_mut()
    }

    /// Emit `tuple` to the downstreams at `targets`, indices into the unit's downstream list. Every target
    /// is attempted; the first failure is returned.
    pub fn send(&mut self, tuple: DataTuple, targets: &[usize]) -> Result<(), RoutingError> {
        self.guard.take();
        let result = self.unit.send_data(tuple, targets);
        self.guard = Some(self.unit.state_cell().read());
        result
    }

    /// Emit `tuple` to every downstream.
    pub fn send_all(&mut self, tuple: DataTuple) -> Result<(), RoutingError> {
        let targets: Vec<usize> = (0..self.unit.downstream_count()).collect();
        self.send(tuple, &targets)
    }
}
