/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Upstream backup of the tuples sent to one downstream operator.
//!
//! A tuple stays in the buffer until the downstream acknowledges a timestamp at least as high as the
//! tuple's. If the downstream fails, its replacement is replayed every tuple still buffered.

use std::collections::VecDeque;

use crate::messages::OutputBufferSnapshot;
use crate::types::{OperatorId, TuplePayload};

#[derive(Debug)]
pub struct OutputBuffer {
    downstream: OperatorId,
    capacity: usize,
    tuples: VecDeque<TuplePayload>,
}

impl OutputBuffer {
    pub fn new(downstream: OperatorId, capacity: usize) -> Self {
        Self {
            downstream,
            capacity: capacity.max(1),
            tuples: VecDeque::new(),
        }
    }

    pub fn downstream(&self) -> OperatorId {
        self.downstream
    }

    /// Buffer a tuple that was just sent. When full, the oldest tuple is evicted.
    pub fn record(&mut self, tuple: TuplePayload) {
        if self.tuples.len() == self.capacity {
            if let Some(evicted) = self.tuples.pop_front() {
                log::warn!(
                    "Output buffer to {:?} is full, evicting unacknowledged tuple with timestamp {}",
                    self.downstream,
                    evicted.timestamp
                );
            }
        }
        self.tuples.push_back(tuple);
    }

    /// Discard every tuple with a timestamp at most `acked_ts`. Returns how many were discarded.
    pub fn trim(&mut self, acked_ts: u64) -> usize {
        let before = self.tuples.len();
        self.tuples.retain(|tuple| tuple.timestamp > acked_ts);
        before - self.tuples.len()
    }

    /// Buffered tuples with a timestamp strictly greater than `ts`, in send order.
    pub fn tuples_after(&self, ts: u64) -> Vec<TuplePayload> {
        self.tuples
            .iter()
            .filter(|tuple| tuple.timestamp > ts)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> OutputBufferSnapshot {
        OutputBufferSnapshot {
            downstream: self.downstream,
            tuples: self.tuples.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn clear(&mut self) {
        self.tuples.clear()
    }
}
