/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Data-path worker threads of a processing unit.
//!
//! A single-worker unit runs one thread; a multi-worker unit runs one thread per permit of its exclusion
//! barrier. Each thread pops tuples from the node's intake and runs the operator on them, until the
//! [`Workers`] handle is dropped. Nothing is popped before the operator is
//! [ready](super::ProcessingUnit::set_op_ready).

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::comm::DataStructureAdapter;

use super::unit::ProcessingUnit;

/// How long a worker waits for a tuple before checking for shutdown again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A handle to the worker threads of a processing unit. When this value is dropped, the threads are shut
/// down. Tuples still queued stay in the intake.
pub struct Workers {
    threads: Vec<JoinHandle<()>>,
    shutdowns: Vec<Sender<()>>,
}

impl Workers {
    pub(crate) fn start(unit: Arc<ProcessingUnit>, intake: Arc<DataStructureAdapter>) -> Workers {
        let count = unit.mode().permits();
        let (threads, shutdowns) = (0..count)
            .map(|_| {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let thread = process_data(Arc::clone(&unit), Arc::clone(&intake), shutdown_receiver);
                (thread, shutdown)
            })
            .unzip();
        log::debug!("Started {} workers for {:?}", count, unit.op_id());
        Workers { threads, shutdowns }
    }

    pub fn count(&self) -> usize {
        self.threads.len()
    }
}

fn process_data(
    unit: Arc<ProcessingUnit>,
    intake: Arc<DataStructureAdapter>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        if !unit.is_operator_ready() {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        if let Some(tuple) = intake.pop_timeout(POLL_INTERVAL) {
            unit.process_data(tuple);
        }
    })
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.shutdowns.iter().for_each(|shutdown| {
            let _ = shutdown.send(());
        });
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("A data-path worker panicked");
            }
        }
    }
}
