/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The two periodic threads of a processing unit: the state-backup worker and the ACK worker.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::fatal;
use super::unit::{CheckpointError, ProcessingUnit};

/// Checkpoints the unit's state every checkpoint interval, for as long as checkpointing is enabled.
///
/// The interval is the one carried by the state, falling back to the configured one. Each tick runs a
/// large-state checkpoint if the state [is large](crate::state::State::is_large), and a small-state
/// checkpoint otherwise.
pub struct StateBackupWorker {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl StateBackupWorker {
    /// Start the worker. Terminates the process if the unit has no state to back up.
    pub fn start(unit: Arc<ProcessingUnit>) -> StateBackupWorker {
        match Self::try_start(unit) {
            Ok(worker) => worker,
            Err(err) => fatal(err),
        }
    }

    pub fn try_start(unit: Arc<ProcessingUnit>) -> Result<StateBackupWorker, CheckpointError> {
        if !unit.has_state() {
            return Err(CheckpointError::NoState);
        }
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let thread = backup_periodically(unit, shutdown_receiver);
        Ok(StateBackupWorker {
            thread: Some(thread),
            shutdown,
        })
    }
}

fn backup_periodically(unit: Arc<ProcessingUnit>, shutdown_signal: Receiver<()>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        let interval = checkpoint_interval(&unit);
        match shutdown_signal.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => (),
        }
        if !unit.is_checkpoint_enabled() {
            log::info!("Checkpointing of {:?} disabled, backup worker exiting", unit.op_id());
            return;
        }

        let watermark = match unit.uses_large_state_checkpoint() {
            Some(true) => unit.lock_free_parallel_checkpoint_and_backup_state(),
            _ => unit.checkpoint_and_backup_state(),
        };
        log::debug!("Checkpointed {:?} up to {:?}", unit.op_id(), watermark);
    })
}

fn checkpoint_interval(unit: &ProcessingUnit) -> Duration {
    unit.with_state(|state| state.map(|state| state.meta().checkpoint_interval()))
        .filter(|interval| !interval.is_zero())
        .unwrap_or(unit.processing_config().checkpoint_interval)
}

impl Drop for StateBackupWorker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Acknowledges the unit's incoming watermark to its owner every ACK interval, whenever it advanced.
pub struct AckWorker {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl AckWorker {
    pub fn start(unit: Arc<ProcessingUnit>) -> AckWorker {
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let thread = ack_periodically(unit, shutdown_receiver);
        AckWorker {
            thread: Some(thread),
            shutdown,
        }
    }
}

fn ack_periodically(unit: Arc<ProcessingUnit>, shutdown_signal: Receiver<()>) -> JoinHandle<()> {
    let interval = unit.processing_config().ack_interval;
    thread::spawn(move || loop {
        match shutdown_signal.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                unit.emit_ack();
            }
        }
    })
}

impl Drop for AckWorker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
