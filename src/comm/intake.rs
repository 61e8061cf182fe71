/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The node's local intake: bounded input queues between incoming readers and worker threads.
//!
//! A node hosting an operator with a single logical input has one shared [`InputQueue`]. A node
//! multiplexing several inputs (e.g., a join) has one queue per originating operator. The
//! [`DataStructureAdapter`] hides the difference from readers and workers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::types::{DataTuple, OperatorId};

use super::{lock, read, write};

/// Bounded FIFO of tuples. Pushing blocks while the queue is full.
pub struct InputQueue {
    tuples: Mutex<VecDeque<DataTuple>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    arrivals: Option<Arc<Arrivals>>,
}

impl InputQueue {
    pub fn new(capacity: usize) -> InputQueue {
        Self::with_arrivals(capacity, None)
    }

    fn with_arrivals(capacity: usize, arrivals: Option<Arc<Arrivals>>) -> InputQueue {
        InputQueue {
            tuples: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            arrivals,
        }
    }

    pub fn push(&self, tuple: DataTuple) {
        let mut tuples = lock(&self.tuples);
        while tuples.len() >= self.capacity {
            tuples = self
                .not_full
                .wait(tuples)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        tuples.push_back(tuple);
        drop(tuples);

        self.not_empty.notify_one();
        if let Some(arrivals) = &self.arrivals {
            arrivals.signal();
        }
    }

    pub fn try_pop(&self) -> Option<DataTuple> {
        let tuple = lock(&self.tuples).pop_front();
        if tuple.is_some() {
            self.not_full.notify_one();
        }
        tuple
    }

    /// Pop the oldest tuple, waiting at most `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<DataTuple> {
        let deadline = Instant::now() + timeout;
        let mut tuples = lock(&self.tuples);
        loop {
            if let Some(tuple) = tuples.pop_front() {
                drop(tuples);
                self.not_full.notify_one();
                return Some(tuple);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tuples = match self.not_empty.wait_timeout(tuples, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.tuples).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tuples).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove and return every queued tuple, oldest first.
    pub fn drain(&self) -> Vec<DataTuple> {
        let drained: Vec<DataTuple> = lock(&self.tuples).drain(..).collect();
        self.not_full.notify_all();
        drained
    }
}

/// Arrival counter shared by the queues of a multiplexing adapter, so that a worker can wait on all of
/// them at once.
pub struct Arrivals {
    count: Mutex<u64>,
    changed: Condvar,
}

impl Arrivals {
    fn signal(&self) {
        *lock(&self.count) += 1;
        self.changed.notify_all();
    }

    fn current(&self) -> u64 {
        *lock(&self.count)
    }

    // Wait until the count differs from `seen`, or `deadline` passes.
    fn wait_past(&self, seen: u64, deadline: Instant) {
        let mut count = lock(&self.count);
        while *count == seen {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            count = match self.changed.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

pub enum DataStructureAdapter {
    /// Every upstream feeds the same queue.
    Unique(Arc<InputQueue>),

    /// Each originating operator feeds its own queue.
    PerOperator {
        queues: RwLock<BTreeMap<OperatorId, Arc<InputQueue>>>,
        capacity: usize,
        arrivals: Arc<Arrivals>,
        next: AtomicUsize,
    },
}

impl DataStructureAdapter {
    pub fn unique(capacity: usize) -> DataStructureAdapter {
        DataStructureAdapter::Unique(Arc::new(InputQueue::new(capacity)))
    }

    pub fn per_operator(origins: &[OperatorId], capacity: usize) -> DataStructureAdapter {
        let arrivals = Arc::new(Arrivals {
            count: Mutex::new(0),
            changed: Condvar::new(),
        });
        let queues = origins
            .iter()
            .map(|op_id| {
                let queue = InputQueue::with_arrivals(capacity, Some(Arc::clone(&arrivals)));
                (*op_id, Arc::new(queue))
            })
            .collect();
        DataStructureAdapter::PerOperator {
            queues: RwLock::new(queues),
            capacity,
            arrivals,
            next: AtomicUsize::new(0),
        }
    }

    /// Get the queue that tuples originating from `origin` go to.
    pub fn queue_for(&self, origin: OperatorId) -> Option<Arc<InputQueue>> {
        match self {
            DataStructureAdapter::Unique(queue) => Some(Arc::clone(queue)),
            DataStructureAdapter::PerOperator { queues, .. } => read(queues).get(&origin).cloned(),
        }
    }

    /// Add a queue for `origin`. Does nothing on a unique adapter, or if `origin` already has one.
    pub fn add_origin(&self, origin: OperatorId) {
        if let DataStructureAdapter::PerOperator {
            queues,
            capacity,
            arrivals,
            ..
        } = self
        {
            write(queues).entry(origin).or_insert_with(|| {
                Arc::new(InputQueue::with_arrivals(*capacity, Some(Arc::clone(arrivals))))
            });
        }
    }

    /// Pop the next tuple, waiting at most `timeout`. Per-operator queues are visited round-robin.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<DataTuple> {
        match self {
            DataStructureAdapter::Unique(queue) => queue.pop_timeout(timeout),
            DataStructureAdapter::PerOperator {
                queues,
                arrivals,
                next,
                ..
            } => {
                let deadline = Instant::now() + timeout;
                loop {
                    let seen = arrivals.current();
                    let queues: Vec<Arc<InputQueue>> = read(queues).values().cloned().collect();
                    if !queues.is_empty() {
                        let start = next.fetch_add(1, Ordering::Relaxed);
                        for offset in 0..queues.len() {
                            if let Some(tuple) = queues[(start + offset) % queues.len()].try_pop() {
                                return Some(tuple);
                            }
                        }
                    }
                    if Instant::now() >= deadline {
                        return None;
                    }
                    arrivals.wait_past(seen, deadline);
                }
            }
        }
    }

    /// Total number of queued tuples.
    pub fn len(&self) -> usize {
        match self {
            DataStructureAdapter::Unique(queue) => queue.len(),
            DataStructureAdapter::PerOperator { queues, .. } => {
                read(queues).values().map(|queue| queue.len()).sum()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
