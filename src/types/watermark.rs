/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consistency watermark propagated with every batch and echoed back as an acknowledgment.
//!
//! A [`TimestampTracker`] records, per source operator, the highest tuple timestamp that has been
//! durably reflected in state. It is a per-source marker and therefore only partially ordered: two
//! trackers that advanced different sources are incomparable.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::OperatorId;

#[derive(Clone, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct TimestampTracker {
    timestamps: BTreeMap<OperatorId, u64>,
}

impl TimestampTracker {
    /// Create an empty tracker, i.e., one that has seen nothing yet.
    pub fn new() -> Self {
        Self {
            timestamps: BTreeMap::new(),
        }
    }

    /// Create a tracker that has seen `timestamp` from `source` only.
    pub fn single(source: OperatorId, timestamp: u64) -> Self {
        let mut tracker = Self::new();
        tracker.advance(source, timestamp);
        tracker
    }

    /// Record that input from `source` has been seen up to `timestamp`. Never moves the watermark of
    /// `source` backwards. Returns whether the watermark advanced.
    pub fn advance(&mut self, source: OperatorId, timestamp: u64) -> bool {
        match self.timestamps.get_mut(&source) {
            Some(current) if *current >= timestamp => false,
            Some(current) => {
                *current = timestamp;
                true
            }
            None => {
                self.timestamps.insert(source, timestamp);
                true
            }
        }
    }

    /// Advance every source of `self` to at least its value in `other`.
    pub fn merge(&mut self, other: &TimestampTracker) {
        for (source, timestamp) in &other.timestamps {
            self.advance(*source, *timestamp);
        }
    }

    /// Get the watermark recorded for `source`, if any.
    pub fn get(&self, source: &OperatorId) -> Option<u64> {
        self.timestamps.get(source).copied()
    }

    /// Get the highest timestamp seen from any source.
    pub fn max_timestamp(&self) -> Option<u64> {
        self.timestamps.values().max().copied()
    }

    pub fn sources(&self) -> impl Iterator<Item = &OperatorId> {
        self.timestamps.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OperatorId, &u64)> {
        self.timestamps.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Returns whether `self` has seen at least everything `other` has seen.
    pub fn dominates(&self, other: &TimestampTracker) -> bool {
        other
            .timestamps
            .iter()
            .all(|(source, ts)| self.get(source).is_some_and(|mine| mine >= *ts))
    }
}

impl PartialOrd for TimestampTracker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}
