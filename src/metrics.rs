/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Counters exposed by processing units and incoming readers.
//!
//! A [`MetricsSink`] is injected at construction. Exporting the counters to a monitoring system is the
//! concern of whoever implements the trait.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub trait MetricsSink: Send + Sync {
    /// `count` tuples were handed to the operator.
    fn events_processed(&self, count: u64);

    /// `count` tuples were read off an incoming data connection.
    fn tuples_received(&self, count: u64);

    /// `count` tuples were discarded because the node was not accepting input.
    fn tuples_dropped(&self, count: u64);

    /// A checkpoint completed.
    fn checkpoints(&self, count: u64);

    /// `count` state chunks were handed to the owner for sending.
    fn chunks_sent(&self, count: u64);

    /// Current length of an input queue.
    fn input_queue_len(&self, len: usize);
}

/// Discards every measurement.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn events_processed(&self, _: u64) {}

    fn tuples_received(&self, _: u64) {}

    fn tuples_dropped(&self, _: u64) {}

    fn checkpoints(&self, _: u64) {}

    fn chunks_sent(&self, _: u64) {}

    fn input_queue_len(&self, _: usize) {}
}

/// Accumulates every measurement in atomic counters.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    events_processed: AtomicU64,
    tuples_received: AtomicU64,
    tuples_dropped: AtomicU64,
    checkpoints: AtomicU64,
    chunks_sent: AtomicU64,
    input_queue_len: AtomicUsize,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_processed_count(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn tuples_received_count(&self) -> u64 {
        self.tuples_received.load(Ordering::Relaxed)
    }

    pub fn tuples_dropped_count(&self) -> u64 {
        self.tuples_dropped.load(Ordering::Relaxed)
    }

    pub fn checkpoints_count(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    pub fn chunks_sent_count(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    /// Last reported input queue length.
    pub fn last_input_queue_len(&self) -> usize {
        self.input_queue_len.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CounterMetrics {
    fn events_processed(&self, count: u64) {
        self.events_processed.fetch_add(count, Ordering::Relaxed);
    }

    fn tuples_received(&self, count: u64) {
        self.tuples_received.fetch_add(count, Ordering::Relaxed);
    }

    fn tuples_dropped(&self, count: u64) {
        self.tuples_dropped.fetch_add(count, Ordering::Relaxed);
    }

    fn checkpoints(&self, count: u64) {
        self.checkpoints.fetch_add(count, Ordering::Relaxed);
    }

    fn chunks_sent(&self, count: u64) {
        self.chunks_sent.fetch_add(count, Ordering::Relaxed);
    }

    fn input_queue_len(&self, len: usize) {
        self.input_queue_len.store(len, Ordering::Relaxed);
    }
}
