use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use borsh::BorshDeserialize;
use log::LevelFilter;

use dataflow_rs::comm::reader::ControlHandler;
use dataflow_rs::comm::DataStructureAdapter;
use dataflow_rs::messages::{BackupOperatorState, ControlTuple, InitOperatorState};
use dataflow_rs::metrics::CounterMetrics;
use dataflow_rs::processing::{
    AckWorker, CheckpointError, InstallError, RoutingError, StateBackupWorker, TopologyContext, WorkerMode,
};
use dataflow_rs::state::{ShardedCounters, State, StateError, Versionable, VersionedMap};
use dataflow_rs::types::{DataTuple, OperatorId, StateTag, TimestampTracker, TuplePayload, Value};

mod common;

use common::{
    logging::setup_logger,
    net::{operator_at, wait_until},
    operators::*,
    owner::RecordingOwner,
    unit::{build_unit, simple_unit},
};

fn op(id: u32) -> OperatorId {
    OperatorId::new(id)
}

fn decode_pair(backup: &BackupOperatorState) -> (i64, i64) {
    let state = PairState::decode(&backup.state).unwrap();
    let pair = state.as_any().downcast_ref::<PairState>().unwrap();
    (pair.left, pair.right)
}

fn map_entries(state: Option<&dyn State>) -> BTreeMap<String, i64> {
    state
        .unwrap()
        .as_any()
        .downcast_ref::<VersionedMap<i64>>()
        .unwrap()
        .entries()
}

/// Checkpoints a single-worker unit over and over while its worker processes tuples. The operator updates
/// the two fields of its state in two steps, so a copy taken mid-tuple would hold different values.
#[test]
fn single_worker_checkpoint_atomicity_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components.
    let owner = Arc::new(RecordingOwner::new());
    let metrics = Arc::new(CounterMetrics::new());
    let unit = build_unit(PairOperator, TopologyContext::new(op(1)), &owner, &metrics, false);
    unit.new_operator_instantiation(Some(Box::new(PairState::new(op(1))))).unwrap();
    unit.init_operator();
    unit.set_op_ready(true);
    assert_eq!(unit.mode(), WorkerMode::Single);

    let intake = Arc::new(DataStructureAdapter::unique(10_000));
    let workers = unit.start_data_processing(Arc::clone(&intake));
    assert_eq!(workers.count(), 1);

    // 2. Feed 2000 tuples while checkpointing.
    let queue = intake.queue_for(op(0)).unwrap();
    let mapper = unit.attribute_mapper();
    let feeder = thread::spawn(move || {
        for ts in 1..=2_000 {
            queue.push(DataTuple::new(Arc::clone(&mapper), TuplePayload::new(vec![], ts)));
        }
    });
    for _ in 0..20 {
        unit.try_checkpoint_and_backup_state().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    feeder.join().unwrap();
    assert!(wait_until(Duration::from_secs(10), || metrics.events_processed_count() == 2_000));
    drop(workers);

    // 3. Every backup holds both fields equal, and the last one saw every tuple.
    unit.try_checkpoint_and_backup_state().unwrap();
    let backups = owner.backups();
    assert_eq!(backups.len(), 21);
    for backup in &backups {
        let (left, right) = decode_pair(backup);
        assert_eq!(left, right);
        assert_eq!(backup.op_id, op(1));
        assert_eq!(backup.state_tag, StateTag::new(PAIR_TAG));
    }
    assert_eq!(decode_pair(backups.last().unwrap()), (2_000, 2_000));
    assert_eq!(metrics.checkpoints_count(), 21);
}

/// Checkpoints a multi-worker unit while its workers mutate a partitionable state. No copy may be taken
/// while a worker is inside the operator.
#[test]
fn multi_worker_checkpoint_exclusion_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components.
    let owner = Arc::new(RecordingOwner::new());
    let metrics = Arc::new(CounterMetrics::new());
    let active = Arc::new(AtomicUsize::new(0));
    let overlapping_copies = Arc::new(AtomicUsize::new(0));
    let operator = CountingOperator {
        active: Arc::clone(&active),
    };
    let unit = build_unit(operator, TopologyContext::new(op(2)), &owner, &metrics, true);
    let state = ProbedCounters::new(op(2), Arc::clone(&active), Arc::clone(&overlapping_copies));
    unit.new_operator_instantiation(Some(Box::new(state))).unwrap();
    unit.set_op_ready(true);
    assert!(matches!(unit.mode(), WorkerMode::Multi(_)));

    let intake = Arc::new(DataStructureAdapter::unique(10_000));
    let workers = unit.start_data_processing(Arc::clone(&intake));
    assert_eq!(workers.count(), unit.mode().permits());

    // 2. Feed 2000 tuples while checkpointing.
    let queue = intake.queue_for(op(0)).unwrap();
    let mapper = unit.attribute_mapper();
    for ts in 1..=2_000u64 {
        let key = Value::Str(format!("k{}", ts % 7));
        queue.push(DataTuple::new(Arc::clone(&mapper), TuplePayload::new(vec![key], ts)));
    }
    for _ in 0..30 {
        unit.try_checkpoint_and_backup_state().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    assert!(wait_until(Duration::from_secs(20), || metrics.events_processed_count() == 2_000));
    drop(workers);

    // 3. No copy overlapped a mutation, and the last copy saw every tuple.
    assert_eq!(overlapping_copies.load(Ordering::SeqCst), 0);
    unit.try_checkpoint_and_backup_state().unwrap();
    let last = owner.backups().pop().unwrap();
    let copy = ShardedCounters::decode(&last.state).unwrap();
    let counters = copy.as_any().downcast_ref::<ShardedCounters>().unwrap();
    assert_eq!(counters.get("total"), Some(2_000));
    let per_key: i64 = (0..7).map(|k| counters.get(&format!("k{}", k)).unwrap()).sum();
    assert_eq!(per_key, 2_000);
}

/// Successive checkpoint watermarks never decrease, even when the incoming watermark reported by the owner
/// goes back.
#[test]
fn checkpoint_watermark_never_decreases_test() {
    setup_logger(LevelFilter::Info);
    let owner = Arc::new(RecordingOwner::new());
    let unit = simple_unit(PairOperator, 1, &owner);
    unit.new_operator_instantiation(Some(Box::new(PairState::new(op(1))))).unwrap();

    owner.set_incoming_tt(TimestampTracker::single(op(10), 100));
    let first = unit.try_checkpoint_and_backup_state().unwrap();
    assert_eq!(first.get(&op(10)), Some(100));

    owner.set_incoming_tt(TimestampTracker::single(op(10), 40));
    let second = unit.try_checkpoint_and_backup_state().unwrap();
    assert!(second.dominates(&first));
    assert_eq!(second.get(&op(10)), Some(100));

    let mut advanced = TimestampTracker::single(op(10), 120);
    advanced.advance(op(11), 5);
    owner.set_incoming_tt(advanced);
    let third = unit.try_checkpoint_and_backup_state().unwrap();
    assert!(third >= second);
    assert_eq!(third.get(&op(10)), Some(120));
    assert_eq!(third.get(&op(11)), Some(5));

    // The copy sent with a checkpoint is stamped with the watermark read before copying.
    let backups = owner.backups();
    let state = PairState::decode(&backups[0].state).unwrap();
    assert_eq!(state.meta().data_ts(), &TimestampTracker::single(op(10), 100));
    assert_eq!(state.meta().owner_id(), op(1));
}

/// Streams a large state to two backup replicas while a tuple mutates it mid-stream. The chunks must hold
/// the state as it was when streaming started, and the mutation must be folded back afterwards.
#[test]
fn large_state_checkpoint_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize a unit whose state has 25 entries, streamed 10 entries per chunk to 2 replicas.
    let owner = Arc::new(RecordingOwner::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut topology = TopologyContext::new(op(3));
    topology.set_star_topology(vec![op(20), op(21)]);
    let unit = build_unit(MapOperator::default(), topology, &owner, &metrics, false);
    unit.new_operator_instantiation(Some(Box::new(versioned_map(op(3), 25)))).unwrap();
    assert_eq!(unit.uses_large_state_checkpoint(), Some(true));

    // 2. On the first chunk, process a tuple writing a new entry.
    let weak_unit = Arc::downgrade(&unit);
    let mapper = unit.attribute_mapper();
    owner.on_chunk(move |chunk| {
        if chunk.sequence_number != 0 {
            return;
        }
        if let Some(unit) = weak_unit.upgrade() {
            let values = vec![Value::Str("late".to_string()), Value::Int(99)];
            unit.process_data(DataTuple::new(Arc::clone(&mapper), TuplePayload::new(values, 1)));
        }
    });
    owner.set_incoming_tt(TimestampTracker::single(op(10), 7));
    let watermark = unit.try_lock_free_parallel_checkpoint_and_backup_state().unwrap();
    assert_eq!(watermark.get(&op(10)), Some(7));

    // 3. ceil(25 / 10) chunks, contiguous, with a constant total, sent round-robin.
    let chunks = owner.chunks();
    assert_eq!(chunks.len(), 3);
    for (i, (chunk, target_idx)) in chunks.iter().enumerate() {
        assert_eq!(chunk.op_id, op(3));
        assert_eq!(chunk.sequence_number, i as u32);
        assert_eq!(chunk.total_chunks, 3);
        assert_eq!(chunk.replicas, 2);
        assert_eq!(*target_idx, i % 2);
    }
    assert!(chunks[2].0.is_last());

    // 4. The chunks hold the state as it was before the mutation.
    let streamed: BTreeMap<String, i64> = chunks
        .iter()
        .flat_map(|(chunk, _)| Vec::<(String, i64)>::try_from_slice(&chunk.bytes).unwrap())
        .collect();
    assert_eq!(streamed, versioned_map(op(3), 25).entries());
    assert!(!streamed.contains_key("late"));

    // 5. The mutation was reconciled into the state.
    unit.with_state(|state| {
        let map = state.unwrap().as_any().downcast_ref::<VersionedMap<i64>>().unwrap();
        assert!(!map.is_dirty());
        assert_eq!(map.pending_mutations(), 0);
        assert_eq!(map.get("late"), Some(&99));
        assert_eq!(map.len(), 26);
        assert_eq!(map.meta().data_ts().get(&op(10)), Some(7));
    });
    assert_eq!(metrics.chunks_sent_count(), 3);
    assert_eq!(metrics.checkpoints_count(), 1);
    assert_eq!(metrics.events_processed_count(), 1);
}

/// Checkpoints that cannot run on how the unit is wired fail with the matching error.
#[test]
fn checkpoint_misconfiguration_test() {
    setup_logger(LevelFilter::Info);
    let owner = Arc::new(RecordingOwner::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut replicated = TopologyContext::new(op(4));
    replicated.set_star_topology(vec![op(20)]);

    // No state at all.
    let stateless = build_unit(Sink, replicated.clone(), &owner, &metrics, false);
    stateless.new_operator_instantiation(None).unwrap();
    assert!(matches!(stateless.try_checkpoint_and_backup_state(), Err(CheckpointError::NoState)));
    assert!(matches!(
        stateless.try_lock_free_parallel_checkpoint_and_backup_state(),
        Err(CheckpointError::NoState)
    ));
    assert!(matches!(StateBackupWorker::try_start(Arc::clone(&stateless)), Err(CheckpointError::NoState)));
    assert_eq!(stateless.uses_large_state_checkpoint(), None);

    // A state that cannot be streamed.
    let small = build_unit(PairOperator, replicated, &owner, &metrics, false);
    small.new_operator_instantiation(Some(Box::new(PairState::new(op(4))))).unwrap();
    assert_eq!(small.uses_large_state_checkpoint(), Some(false));
    assert!(matches!(
        small.try_lock_free_parallel_checkpoint_and_backup_state(),
        Err(CheckpointError::MissingCapability("Versionable"))
    ));

    // No replica to stream to.
    let unreplicated = simple_unit(MapOperator::default(), 4, &owner);
    unreplicated.new_operator_instantiation(Some(Box::new(versioned_map(op(4), 5)))).unwrap();
    assert!(matches!(
        unreplicated.try_lock_free_parallel_checkpoint_and_backup_state(),
        Err(CheckpointError::EmptyReplicaSet)
    ));

    assert!(owner.backups().is_empty());
    assert!(owner.chunks().is_empty());
}

/// Streams a state out of one unit and feeds the chunks to a replacement unit for the same operator, and
/// to a backup unit managing that operator.
#[test]
fn streamed_state_recovery_test() {
    setup_logger(LevelFilter::Info);

    // 1. Stream the state of op3.
    let owner = Arc::new(RecordingOwner::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut topology = TopologyContext::new(op(3));
    topology.set_star_topology(vec![op(20)]);
    let original = build_unit(MapOperator::default(), topology, &owner, &metrics, false);
    original.new_operator_instantiation(Some(Box::new(versioned_map(op(3), 25)))).unwrap();
    original.try_lock_free_parallel_checkpoint_and_backup_state().unwrap();
    let chunks: Vec<_> = owner.chunks().into_iter().map(|(chunk, _)| chunk).collect();
    let expected = original.with_state(map_entries);

    // 2. A replacement of op3 rebuilds the state from the chunks, and is notified once.
    let installs = Arc::new(AtomicUsize::new(0));
    let operator = MapOperator {
        installs: Arc::clone(&installs),
    };
    let replacement = simple_unit(operator, 3, &owner);
    replacement.new_operator_instantiation(Some(Box::new(versioned_map(op(3), 0)))).unwrap();
    for chunk in &chunks {
        replacement.handle_control(ControlTuple::StateChunk(chunk.clone()), None);
    }
    assert_eq!(installs.load(Ordering::SeqCst), 1);
    assert_eq!(replacement.with_state(map_entries), expected);

    // 3. Chunks must arrive in order, and every chunk must arrive before finalizing.
    let strict = simple_unit(MapOperator::default(), 3, &owner);
    strict.new_operator_instantiation(Some(Box::new(versioned_map(op(3), 0)))).unwrap();
    assert!(matches!(
        strict.merge_chunk_to_state(Some(chunks[1].clone())),
        Err(InstallError::State(StateError::ChunkOutOfOrder { expected: 0, received: 1 }))
    ));
    strict.merge_chunk_to_state(Some(chunks[0].clone())).unwrap();
    assert!(matches!(
        strict.merge_chunk_to_state(Some(chunks[2].clone())),
        Err(InstallError::State(StateError::ChunkOutOfOrder { expected: 1, received: 2 }))
    ));
    assert!(matches!(
        strict.merge_chunk_to_state(None),
        Err(InstallError::State(StateError::IncompleteTransfer { expected: 3, received: 1 }))
    ));

    // 4. A backup node keeps the chunks of the operators it manages, and only those.
    let backup = simple_unit(Sink, 20, &owner);
    assert!(backup.register_managed_state(op(3)));
    assert!(!backup.register_managed_state(op(3)));
    assert!(backup.is_managing_state_of(op(3)));
    for chunk in &chunks {
        backup.handle_control(ControlTuple::StateChunk(chunk.clone()), None);
    }
    let kept = backup.backup_store().streamed_chunks(op(3)).unwrap();
    let sent: Vec<(u32, Vec<u8>)> = chunks
        .iter()
        .map(|chunk| (chunk.sequence_number, chunk.bytes.clone()))
        .collect();
    assert_eq!(kept, sent);

    assert!(backup.invalidate_state(op(3)));
    assert!(!backup.is_managing_state_of(op(3)));
    assert!(backup.backup_store().streamed_chunks(op(3)).is_none());
}

/// Streams a state to two backup replicas. Each replica receives every other chunk, keeps its share once
/// complete, and the two shares together rebuild the state.
#[test]
fn two_replica_streamed_backup_test() {
    setup_logger(LevelFilter::Info);

    // 1. Stream 25 entries of op3, 10 per chunk, to op20 and op21.
    let owner = Arc::new(RecordingOwner::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut topology = TopologyContext::new(op(3));
    topology.set_star_topology(vec![op(20), op(21)]);
    let original = build_unit(MapOperator::default(), topology, &owner, &metrics, false);
    original.new_operator_instantiation(Some(Box::new(versioned_map(op(3), 25)))).unwrap();
    original.try_lock_free_parallel_checkpoint_and_backup_state().unwrap();
    let sent = owner.chunks();
    assert_eq!(sent.len(), 3);

    // 2. Each replica is handed the chunks sent to it.
    let replicas = [simple_unit(Sink, 20, &owner), simple_unit(Sink, 21, &owner)];
    for replica in &replicas {
        assert!(replica.register_managed_state(op(3)));
    }
    for (chunk, target_idx) in &sent {
        replicas[*target_idx].handle_control(ControlTuple::StateChunk(chunk.clone()), None);
    }

    // 3. Replica 0 holds chunks 0 and 2, replica 1 holds chunk 1.
    let share_0 = replicas[0].backup_store().streamed_chunks(op(3)).unwrap();
    let share_1 = replicas[1].backup_store().streamed_chunks(op(3)).unwrap();
    let sequence_numbers = |share: &[(u32, Vec<u8>)]| share.iter().map(|(seq, _)| *seq).collect::<Vec<_>>();
    assert_eq!(sequence_numbers(&share_0), vec![0, 2]);
    assert_eq!(sequence_numbers(&share_1), vec![1]);
    assert_eq!(share_0[1].1, sent[2].0.bytes);
    assert_eq!(share_1[0].1, sent[1].0.bytes);

    // 4. A chunk outside the share of a replica is rejected.
    let stray = replicas[1].backup_store().append_chunk(&sent[2].0);
    assert!(matches!(stray, Err(StateError::ChunkOutOfOrder { received: 2, .. })));

    // 5. Merging both shares in sequence order rebuilds the state.
    let mut merged: Vec<(u32, Vec<u8>)> = share_0.into_iter().chain(share_1).collect();
    merged.sort_by_key(|(seq, _)| *seq);
    let replacement = simple_unit(MapOperator::default(), 3, &owner);
    replacement.new_operator_instantiation(Some(Box::new(versioned_map(op(3), 0)))).unwrap();
    for (seq, bytes) in merged {
        let mut chunk = sent[seq as usize].0.clone();
        chunk.bytes = bytes;
        replacement.handle_control(ControlTuple::StateChunk(chunk), None);
    }
    assert_eq!(replacement.with_state(map_entries), original.with_state(map_entries));
}

/// A streamed state replaces whatever the recovering operator held before the transfer started.
#[test]
fn streamed_recovery_replaces_existing_entries_test() {
    setup_logger(LevelFilter::Info);

    // 1. Stream 5 entries of op3 to a single replica.
    let owner = Arc::new(RecordingOwner::new());
    let metrics = Arc::new(CounterMetrics::new());
    let mut topology = TopologyContext::new(op(3));
    topology.set_star_topology(vec![op(20)]);
    let original = build_unit(MapOperator::default(), topology, &owner, &metrics, false);
    original.new_operator_instantiation(Some(Box::new(versioned_map(op(3), 5)))).unwrap();
    original.try_lock_free_parallel_checkpoint_and_backup_state().unwrap();
    let chunks: Vec<_> = owner.chunks().into_iter().map(|(chunk, _)| chunk).collect();
    assert_eq!(chunks.len(), 1);

    // 2. The replacement already holds 40 entries, one of them stale.
    let mut existing = versioned_map(op(3), 40);
    existing.insert("stale", -1);
    let replacement = simple_unit(MapOperator::default(), 3, &owner);
    replacement.new_operator_instantiation(Some(Box::new(existing))).unwrap();

    // 3. After the transfer it holds exactly the streamed entries, even when the transfer is repeated.
    for _ in 0..2 {
        replacement.handle_control(ControlTuple::StateChunk(chunks[0].clone()), None);
        let entries = replacement.with_state(map_entries);
        assert_eq!(entries.len(), 5);
        assert!(!entries.contains_key("stale"));
        assert_eq!(entries, versioned_map(op(3), 5).entries());
    }
}

/// Installs states received as blobs, and keeps whole-state backups of managed operators.
#[test]
fn install_state_test() {
    setup_logger(LevelFilter::Info);
    let owner = Arc::new(RecordingOwner::new());

    // 1. Checkpoint a pair state that has seen 3 tuples.
    let source = simple_unit(PairOperator, 5, &owner);
    source.new_operator_instantiation(Some(Box::new(PairState::new(op(5))))).unwrap();
    for ts in 1..=3 {
        source.process_data(DataTuple::new(source.attribute_mapper(), TuplePayload::new(vec![], ts)));
    }
    source.try_checkpoint_and_backup_state().unwrap();
    let backup = owner.backups().pop().unwrap();

    // 2. A backup node stores it, since it manages op5.
    let backup_node = simple_unit(Sink, 21, &owner);
    backup_node.handle_control(ControlTuple::BackupOperatorState(backup.clone()), None);
    assert!(backup_node.backup_store().latest_backup(op(5)).is_none());
    backup_node.register_managed_state(op(5));
    backup_node.handle_control(ControlTuple::BackupOperatorState(backup.clone()), None);
    assert_eq!(backup_node.backup_store().latest_backup(op(5)), Some(backup.clone()));
    assert_eq!(backup_node.backup_store().managed_operators(), vec![op(5)]);

    // 3. A restarted op5 installs it.
    let restarted = simple_unit(PairOperator, 5, &owner);
    restarted.handle_control(
        ControlTuple::InitOperatorState(InitOperatorState {
            op_id: op(5),
            state: backup.state.clone(),
            state_tag: backup.state_tag.clone(),
        }),
        None,
    );
    restarted.with_state(|state| {
        let pair = state.unwrap().as_any().downcast_ref::<PairState>().unwrap();
        assert_eq!((pair.left, pair.right), (3, 3));
    });

    // 4. Unknown tags and multi-worker units reject states they cannot host.
    assert!(matches!(
        restarted.install_state_blob(&StateTag::new("unknown"), &backup.state),
        Err(InstallError::State(StateError::UnknownStateTag(_)))
    ));
    let metrics = Arc::new(CounterMetrics::new());
    let multi = build_unit(Sink, TopologyContext::new(op(6)), &owner, &metrics, true);
    assert!(matches!(
        multi.new_operator_instantiation(Some(Box::new(PairState::new(op(6))))),
        Err(InstallError::NotPartitionable)
    ));
    assert!(!multi.has_state());
}

/// Routes tuples to a local downstream, skipping and reporting out-of-range targets.
#[test]
fn routing_test() {
    setup_logger(LevelFilter::Info);
    let owner = Arc::new(RecordingOwner::new());
    let unit = simple_unit(Sink, 7, &owner);
    let downstream = Arc::new(CollectingDownstream::default());
    let idx = unit.add_local_downstream(operator_at(8, 0, 0), Arc::clone(&downstream) as _);
    assert_eq!(idx, 0);
    assert_eq!(unit.downstream_count(), 1);
    assert_eq!(unit.topology().downstream_index_of(op(8)), Some(0));

    let tuple = |ts| DataTuple::new(unit.attribute_mapper(), TuplePayload::new(vec![Value::Int(1)], ts));
    unit.send_data(tuple(1), &[0]).unwrap();
    let err = unit.send_data(tuple(2), &[5, 0]).unwrap_err();
    assert!(matches!(
        err,
        RoutingError::IndexOutOfRange {
            target_idx: 5,
            downstream_count: 1
        }
    ));
    assert_eq!(downstream.timestamps(), vec![1, 2]);

    // Re-adding a downstream replaces it in place.
    let replacement = Arc::new(CollectingDownstream::default());
    assert_eq!(unit.add_local_downstream(operator_at(8, 0, 0), Arc::clone(&replacement) as _), 0);
    unit.send_data(tuple(3), &[0]).unwrap();
    assert_eq!(replacement.timestamps(), vec![3]);
    assert_eq!(downstream.timestamps(), vec![1, 2]);
}

/// Acknowledges the incoming watermark only when it advanced, both on demand and from the ACK worker.
#[test]
fn ack_test() {
    setup_logger(LevelFilter::Info);
    let owner = Arc::new(RecordingOwner::new());
    let unit = simple_unit(Sink, 9, &owner);

    assert!(!unit.emit_ack());
    owner.watermark.advance(op(1), 10);
    assert!(unit.emit_ack());
    assert!(!unit.emit_ack());
    assert_eq!(unit.get_last_ack(), TimestampTracker::single(op(1), 10));

    // A watermark that does not dominate the last acknowledged one is not acknowledged.
    owner.set_incoming_tt(TimestampTracker::single(op(1), 5));
    assert!(!unit.emit_ack());
    assert_eq!(owner.acks().len(), 1);

    owner.set_incoming_tt(TimestampTracker::single(op(1), 20));
    let ack_worker = AckWorker::start(Arc::clone(&unit));
    assert!(wait_until(Duration::from_secs(5), || owner.acks().len() == 2));
    drop(ack_worker);
    assert_eq!(owner.acks()[1], TimestampTracker::single(op(1), 20));
}

/// The backup worker checkpoints periodically until checkpointing is disabled.
#[test]
fn backup_worker_test() {
    setup_logger(LevelFilter::Info);
    let owner = Arc::new(RecordingOwner::new());
    let unit = simple_unit(PairOperator, 11, &owner);
    unit.new_operator_instantiation(Some(Box::new(PairState::new(op(11))))).unwrap();

    let worker = StateBackupWorker::start(Arc::clone(&unit));
    assert!(wait_until(Duration::from_secs(5), || owner.backups().len() >= 2));

    unit.disable_checkpoint_for_operator();
    assert!(!unit.is_checkpoint_enabled());
    thread::sleep(Duration::from_millis(200));
    let after_disable = owner.backups().len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(owner.backups().len(), after_disable);
    drop(worker);
}
