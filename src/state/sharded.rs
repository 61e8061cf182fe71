/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [`Partitionable`] counter state that several workers can update at once.
//!
//! Keys are assigned to shards by hash, and each shard has its own lock, so workers touching different
//! keys rarely contend. Checkpoints still copy the state only while holding every worker permit, so a
//! deep copy never observes a shard mid-update.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{Partitionable, State, StateError, StateMeta};

pub struct ShardedCounters {
    meta: StateMeta,
    shards: Vec<Mutex<BTreeMap<String, i64>>>,
}

impl ShardedCounters {
    pub fn new(meta: StateMeta, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            meta,
            shards: (0..partitions).map(|_| Mutex::new(BTreeMap::new())).collect(),
        }
    }

    fn shard_of(&self, key: &str) -> &Mutex<BTreeMap<String, i64>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Add `delta` to the counter of `key`, returning its new value.
    pub fn add(&self, key: &str, delta: i64) -> i64 {
        let mut shard = self
            .shard_of(key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let counter = shard.entry(key.to_string()).or_insert(0);
        *counter += delta;
        *counter
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.shard_of(key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Every counter across every shard, in key order.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut all = BTreeMap::new();
        for shard in &self.shards {
            all.extend(
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(k, v)| (k.clone(), *v)),
            );
        }
        all
    }

    pub fn decode(blob: &[u8]) -> Result<Box<dyn State>, StateError> {
        let (meta, partitions, entries) =
            <(StateMeta, u32, Vec<(String, i64)>)>::try_from_slice(blob)?;
        let counters = Self::new(meta, partitions as usize);
        for (key, value) in entries {
            counters.add(&key, value);
        }
        Ok(Box::new(counters))
    }
}

impl State for ShardedCounters {
    fn meta(&self) -> &StateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StateMeta {
        &mut self.meta
    }

    fn deep_copy(&self) -> Box<dyn State> {
        let copy = Self::new(self.meta.clone(), self.shards.len());
        for (key, value) in self.snapshot() {
            copy.add(&key, value);
        }
        Box::new(copy)
    }

    fn serialize_state(&self) -> Result<Vec<u8>, StateError> {
        let entries: Vec<(String, i64)> = self.snapshot().into_iter().collect();
        Ok((self.meta.clone(), self.shards.len() as u32, entries).try_to_vec()?)
    }

    fn as_partitionable(&self) -> Option<&dyn Partitionable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Partitionable for ShardedCounters {
    fn reset_state(&self) {
        for shard in &self.shards {
            shard.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    fn partitions(&self) -> usize {
        self.shards.len()
    }
}
