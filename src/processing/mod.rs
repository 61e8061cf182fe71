/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Running operators: the processing unit, its concurrency discipline, and its periodic workers.
//!
//! A node hosts one [`ProcessingUnit`] per operator. The unit is built from a [`ProcessingUnitSpec`] and
//! then driven by:
//! 1. Its [`Workers`], which pull tuples from the node's intake and run the operator.
//! 2. A [`StateBackupWorker`], which checkpoints the operator's state.
//! 3. An [`AckWorker`], which acknowledges the incoming watermark to the node.
//!
//! Each of these is a handle: dropping it stops the corresponding threads.

use std::fmt::Debug;
use std::process;

pub mod backup_store;

pub mod backup_worker;

pub mod barrier;

pub mod context;

pub mod operator;

pub mod owner;

pub mod state_cell;

pub mod unit;

pub mod workers;

pub use backup_store::BackupStore;
pub use backup_worker::{AckWorker, StateBackupWorker};
pub use barrier::ExclusionBarrier;
pub use context::{OperatorStaticInformation, TopologyContext};
pub use operator::{Operator, ProcessingApi};
pub use owner::Owner;
pub use unit::{CheckpointError, InstallError, ProcessingUnit, ProcessingUnitSpec, RoutingError, WorkerMode};
pub use workers::Workers;

/// Exit code of a node terminated by [`fatal`].
pub const FATAL_EXIT_CODE: i32 = 70;

/// Log `error` and terminate the process with [`FATAL_EXIT_CODE`].
pub fn fatal(error: impl Debug) -> ! {
    log::error!("Unrecoverable error, terminating: {:?}", error);
    log::logger().flush();
    process::exit(FATAL_EXIT_CODE)
}
