use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use dataflow_rs::comm::LocalDownstream;
use dataflow_rs::processing::{Operator, ProcessingApi};
use dataflow_rs::state::{
    Partitionable, ShardedCounters, State, StateError, StateMeta, VersionedMap,
};
use dataflow_rs::types::{DataTuple, OperatorId, StateTag};

pub(crate) const PAIR_TAG: &str = "pair";
pub(crate) const MAP_TAG: &str = "versioned-map";

pub(crate) fn meta(owner: OperatorId, tag: &str) -> StateMeta {
    StateMeta::new(owner, Duration::from_millis(50), StateTag::new(tag))
}

/* ↓↓↓ Pair state: two fields that must always be equal between tuples ↓↓↓ */

#[derive(BorshSerialize, BorshDeserialize)]
pub(crate) struct PairState {
    meta: StateMeta,
    pub(crate) left: i64,
    pub(crate) right: i64,
}

impl PairState {
    pub(crate) fn new(owner: OperatorId) -> PairState {
        PairState {
            meta: meta(owner, PAIR_TAG),
            left: 0,
            right: 0,
        }
    }

    pub(crate) fn decode(blob: &[u8]) -> Result<Box<dyn State>, StateError> {
        Ok(Box::new(PairState::try_from_slice(blob)?))
    }
}

impl State for PairState {
    fn meta(&self) -> &StateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StateMeta {
        &mut self.meta
    }

    fn deep_copy(&self) -> Box<dyn State> {
        Box::new(PairState {
            meta: self.meta.clone(),
            left: self.left,
            right: self.right,
        })
    }

    fn serialize_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(self.try_to_vec()?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Increments both fields of a [`PairState`], one after the other.
pub(crate) struct PairOperator;

impl Operator for PairOperator {
    fn process_data(&self, _tuple: DataTuple, api: &mut ProcessingApi) {
        let state = api.state_as_mut::<PairState>().unwrap();
        state.left += 1;
        thread::yield_now();
        state.right += 1;
    }
}

/* ↓↓↓ Probed counters: detect a copy taken while a worker is mid-mutation ↓↓↓ */

pub(crate) struct ProbedCounters {
    counters: ShardedCounters,
    active: Arc<AtomicUsize>,
    overlapping_copies: Arc<AtomicUsize>,
}

impl ProbedCounters {
    pub(crate) fn new(owner: OperatorId, active: Arc<AtomicUsize>, overlapping_copies: Arc<AtomicUsize>) -> Self {
        ProbedCounters {
            counters: ShardedCounters::new(meta(owner, "counters"), 8),
            active,
            overlapping_copies,
        }
    }

    pub(crate) fn counters(&self) -> &ShardedCounters {
        &self.counters
    }
}

impl State for ProbedCounters {
    fn meta(&self) -> &StateMeta {
        self.counters.meta()
    }

    fn meta_mut(&mut self) -> &mut StateMeta {
        self.counters.meta_mut()
    }

    fn deep_copy(&self) -> Box<dyn State> {
        if self.active.load(Ordering::SeqCst) > 0 {
            self.overlapping_copies.fetch_add(1, Ordering::SeqCst);
        }
        self.counters.deep_copy()
    }

    fn serialize_state(&self) -> Result<Vec<u8>, StateError> {
        self.counters.serialize_state()
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

impl Partitionable for ProbedCounters {
    fn reset_state(&self) {
        self.counters.reset_state()
    }

    fn partitions(&self) -> usize {
        self.counters.partitions()
    }
}

/// Counts tuples per `key` in a [`ProbedCounters`], marking itself active while mutating.
pub(crate) struct CountingOperator {
    pub(crate) active: Arc<AtomicUsize>,
}

impl Operator for CountingOperator {
    fn process_data(&self, tuple: DataTuple, api: &mut ProcessingApi) {
        let key = tuple.get_str("key").unwrap_or("none").to_string();
        let state = api.state_as::<ProbedCounters>().unwrap();
        self.active.fetch_add(1, Ordering::SeqCst);
        state.counters().add(&key, 1);
        thread::sleep(Duration::from_micros(50));
        state.counters().add("total", 1);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn declared_working_attributes(&self) -> Vec<String> {
        vec!["key".to_string()]
    }
}

/* ↓↓↓ Versioned map ↓↓↓ */

pub(crate) fn versioned_map(owner: OperatorId, entries: usize) -> VersionedMap<i64> {
    let mut map = VersionedMap::new(meta(owner, MAP_TAG));
    for i in 0..entries {
        map.insert(format!("key-{:04}", i), i as i64);
    }
    map
}

/// Writes `key` -> `value` into a `VersionedMap<i64>`, and counts installed states.
#[derive(Default)]
pub(crate) struct MapOperator {
    pub(crate) installs: Arc<AtomicUsize>,
}

impl Operator for MapOperator {
    fn process_data(&self, tuple: DataTuple, api: &mut ProcessingApi) {
        let key = tuple.get_str("key").unwrap().to_string();
        let value = tuple.get_int("value").unwrap();
        api.state_as_mut::<VersionedMap<i64>>().unwrap().insert(key, value);
    }

    fn declared_working_attributes(&self) -> Vec<String> {
        vec!["key".to_string(), "value".to_string()]
    }

    fn state_installed(&self, _state: &dyn State) {
        self.installs.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stateless operator that does nothing.
pub(crate) struct Sink;

impl Operator for Sink {
    fn process_data(&self, _tuple: DataTuple, _api: &mut ProcessingApi) {}
}

/// A downstream on the same node that keeps everything it is given.
#[derive(Default)]
pub(crate) struct CollectingDownstream {
    tuples: Mutex<Vec<DataTuple>>,
}

impl CollectingDownstream {
    pub(crate) fn timestamps(&self) -> Vec<u64> {
        self.tuples.lock().unwrap().iter().map(|tuple| tuple.timestamp()).collect()
    }
}

impl LocalDownstream for CollectingDownstream {
    fn process_local(&self, tuple: DataTuple) {
        self.tuples.lock().unwrap().push(tuple);
    }
}
