/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The processing unit: hosts one operator and everything needed to run it fault-tolerantly.
//!
//! ## Access to the state
//!
//! The operator's state lives in a [`StateCell`] guarded by an [exclusion barrier](super::barrier) with
//! one permit per worker thread:
//! - **Single-worker mode**: the barrier has one permit and acts as a mutex. It is held around each call
//!   to [`Operator::process_data`], and by the checkpoint thread only while it copies the state.
//! - **Multi-worker mode**: the barrier has `N` permits, one per worker. A checkpoint takes all `N`, so no
//!   worker is mid-mutation while the state is copied. The state must be
//!   [partitionable](crate::state::Partitionable).
//!
//! ## Checkpoints
//!
//! A small state is checkpointed by [`checkpoint_and_backup_state`](ProcessingUnit::checkpoint_and_backup_state):
//! 1. Read the incoming watermark.
//! 2. Take every permit, deep-copy the state, release the permits.
//! 3. Stamp the copy with the watermark, serialize it, and send it to the backup node as a
//!    [`BackupOperatorState`], along with the output buffers of every downstream channel.
//!
//! A large state is checkpointed by [`lock_free_parallel_checkpoint_and_backup_state`](ProcessingUnit::lock_free_parallel_checkpoint_and_backup_state):
//! 1. Read the incoming watermark.
//! 2. Take every permit just long enough to freeze a [streaming view](crate::state::Streamable::streaming_view)
//!    of the state and switch it to dirty mode.
//! 3. With no permit held, cut the view into chunks and send chunk `i` to backup replica
//!    `i mod replicas`.
//! 4. Take every permit again to [reconcile](crate::state::Versionable::reconcile) the mutations made
//!    while streaming.
//!
//! Both return the watermark to acknowledge. Successive returned watermarks never decrease.
//!
//! Checkpoints on a misconfigured operator (no state, a large state lacking a capability, no backup
//! replica) are fatal: the public entry points terminate the process through [`fatal`](super::fatal).
//! The `try_` variants return the error instead.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use typed_builder::TypedBuilder;

use crate::comm::endpoint::LocalDownstream;
use crate::comm::reader::ControlHandler;
use crate::comm::{lock, read, write, AsyncChannel, ChannelError, DataStructureAdapter, EndPoint, OutputQueue, SyncChannel};
use crate::config::{ChannelConfiguration, Configuration, ProcessingConfiguration};
use crate::events::*;
use crate::messages::{BackupOperatorState, ControlTuple, OutputBufferSnapshot, StateChunk};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::state::{State, StateDecoders, StateError, StreamStateManager};
use crate::types::{AttributeMapper, CryptoHash, DataTuple, OperatorId, StateTag, TimestampTracker};

use super::backup_store::BackupStore;
use super::context::{OperatorStaticInformation, TopologyContext};
use super::fatal;
use super::operator::{Operator, ProcessingApi};
use super::owner::Owner;
use super::state_cell::StateCell;
use super::workers::Workers;

#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ProcessingUnitSpec]. On the builder call the following methods to construct a valid [ProcessingUnitSpec].

    Required:
    - `.operator(...)`
    - `.topology(...)`
    - `.owner(...)`
    - `.configuration(...)`

    Optional:
    - `.multi_core(...)`
    - `.metrics(...)`
    - `.output_queue(...)`
    - `.decoders(...)`
    - `.event_publisher(...)`
    "
))]
pub struct ProcessingUnitSpec {
    #[builder(setter(
        transform = |operator: impl Operator| Box::new(operator) as Box<dyn Operator>,
        doc = "Set the operator to host. Required."
    ))]
    operator: Box<dyn Operator>,
    #[builder(setter(doc = "Set the topology context of the hosted operator. Required."))]
    topology: TopologyContext,
    #[builder(setter(doc = "Set the node-hosting runtime the unit calls back into. Required."))]
    owner: Arc<dyn Owner>,
    #[builder(setter(doc = "Set the [configuration](Configuration) of the node. Required."))]
    configuration: Configuration,
    #[builder(default = false, setter(doc = "Run the operator on a pool of workers sharing a partitionable state? Optional."))]
    multi_core: bool,
    #[builder(default = Arc::new(NoopMetrics) as Arc<dyn MetricsSink>, setter(doc = "Set the sink of the unit's metrics. Optional."))]
    metrics: Arc<dyn MetricsSink>,
    #[builder(default = Arc::new(OutputQueue::new()), setter(doc = "Set the output queue shared by the units of the node. Optional."))]
    output_queue: Arc<OutputQueue>,
    #[builder(default, setter(doc = "Set the decoders of the states this unit may receive as blobs. Optional."))]
    decoders: StateDecoders,
    #[builder(default, setter(doc = "Set the sender on which events are published. Optional."))]
    event_publisher: Option<Sender<Event>>,
}

impl ProcessingUnitSpec {
    pub fn into_unit(self) -> Arc<ProcessingUnit> {
        let (channel_config, processing_config): (ChannelConfiguration, ProcessingConfiguration) =
            self.configuration.into();
        let mode = if self.multi_core {
            WorkerMode::Multi(processing_config.worker_threads.max(1))
        } else {
            WorkerMode::Single
        };
        let op_id = self.topology.op_id();
        let mapper = Arc::new(create_tuple_attribute_mapper(op_id, self.operator.as_ref()));

        Arc::new(ProcessingUnit {
            op_id,
            operator: self.operator,
            owner: self.owner,
            topology: Arc::new(RwLock::new(self.topology)),
            endpoints: RwLock::new(Vec::new()),
            upstream_channels: RwLock::new(BTreeMap::new()),
            state: StateCell::new(mode.permits(), None),
            mode,
            backup_store: BackupStore::new(),
            output_queue: self.output_queue,
            metrics: self.metrics,
            event_publisher: self.event_publisher,
            channel_config,
            processing_config,
            decoders: self.decoders,
            mapper,
            op_ready: AtomicBool::new(false),
            checkpoint_enabled: AtomicBool::new(true),
            last_ack: Mutex::new(TimestampTracker::new()),
            last_checkpoint_watermark: Mutex::new(TimestampTracker::new()),
            incoming_transfer: Mutex::new(None),
        })
    }
}

/// How many workers run the operator concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerMode {
    Single,
    Multi(usize),
}

impl WorkerMode {
    pub fn permits(&self) -> usize {
        match self {
            WorkerMode::Single => 1,
            WorkerMode::Multi(workers) => *workers,
        }
    }
}

// Progress of a streamed state being received by this unit.
struct IncomingTransfer {
    next_sequence_number: u32,
    total_chunks: u32,
}

pub struct ProcessingUnit {
    op_id: OperatorId,
    operator: Box<dyn Operator>,
    owner: Arc<dyn Owner>,
    topology: Arc<RwLock<TopologyContext>>,
    // Aligned with the downstreams of `topology`.
    endpoints: RwLock<Vec<EndPoint>>,
    upstream_channels: RwLock<BTreeMap<OperatorId, Arc<SyncChannel>>>,
    state: StateCell,
    mode: WorkerMode,
    backup_store: BackupStore,
    output_queue: Arc<OutputQueue>,
    metrics: Arc<dyn MetricsSink>,
    event_publisher: Option<Sender<Event>>,
    channel_config: ChannelConfiguration,
    processing_config: ProcessingConfiguration,
    decoders: StateDecoders,
    mapper: Arc<AttributeMapper>,
    op_ready: AtomicBool,
    checkpoint_enabled: AtomicBool,
    last_ack: Mutex<TimestampTracker>,
    last_checkpoint_watermark: Mutex<TimestampTracker>,
    incoming_transfer: Mutex<Option<IncomingTransfer>>,
}

impl ProcessingUnit {
    pub fn op_id(&self) -> OperatorId {
        self.op_id
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn topology(&self) -> TopologyContext {
        read(&self.topology).clone()
    }

    /// The topology context itself, shared with the node's readers.
    pub fn shared_topology(&self) -> Arc<RwLock<TopologyContext>> {
        Arc::clone(&self.topology)
    }

    pub fn downstream_count(&self) -> usize {
        read(&self.endpoints).len()
    }

    pub fn processing_config(&self) -> &ProcessingConfiguration {
        &self.processing_config
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn output_queue(&self) -> &Arc<OutputQueue> {
        &self.output_queue
    }

    /// Mapping from the operator's declared working attributes to their positions in incoming tuples.
    pub fn attribute_mapper(&self) -> Arc<AttributeMapper> {
        Arc::clone(&self.mapper)
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// Run `f` on the current state while holding one permit.
    pub fn with_state<R>(&self, f: impl FnOnce(Option<&dyn State>) -> R) -> R {
        let guard = self.state.read();
        f(guard.as_deref())
    }

    pub fn has_state(&self) -> bool {
        self.with_state(|state| state.is_some())
    }

    /* ↓↓↓ Lifecycle ↓↓↓ */

    /// Set the operator's initial state. Replacing an existing state, or instantiating without a state,
    /// is allowed but logged.
    pub fn new_operator_instantiation(&self, initial_state: Option<Box<dyn State>>) -> Result<(), InstallError> {
        if let Some(state) = &initial_state {
            self.check_mode_supports(state.as_ref())?;
        }
        let mut guard = self.state.write();
        match (&*guard, &initial_state) {
            (Some(_), Some(_)) => log::warn!("Overwriting the state of {:?} with a new instance", self.op_id),
            (_, None) => log::warn!("Operator {:?} instantiated without a state, it will not be checkpointed", self.op_id),
            (None, Some(_)) => (),
        }
        *guard = initial_state;
        Ok(())
    }

    /// Let the operator set itself up. Must be called before data processing starts.
    pub fn init_operator(&self) {
        let topology = read(&self.topology).clone();
        self.operator.set_up(&topology);
    }

    /// Start the worker threads of this unit, pulling tuples from `intake`.
    pub fn start_data_processing(self: &Arc<Self>, intake: Arc<DataStructureAdapter>) -> Workers {
        Workers::start(Arc::clone(self), intake)
    }

    pub fn set_op_ready(&self, ready: bool) {
        self.op_ready.store(ready, Ordering::SeqCst)
    }

    pub fn is_operator_ready(&self) -> bool {
        self.op_ready.load(Ordering::SeqCst)
    }

    /// Stop periodic checkpoints of this operator. The backup worker exits on its next tick.
    pub fn disable_checkpoint_for_operator(&self) {
        self.checkpoint_enabled.store(false, Ordering::SeqCst)
    }

    pub fn is_checkpoint_enabled(&self) -> bool {
        self.checkpoint_enabled.load(Ordering::SeqCst)
    }

    /* ↓↓↓ Data path ↓↓↓ */

    /// Run the operator on `tuple`, holding one permit of the exclusion barrier.
    pub fn process_data(&self, tuple: DataTuple) {
        let mut api = ProcessingApi::new(self);
        self.operator.process_data(tuple, &mut api);
        drop(api);
        self.metrics.events_processed(1);
    }

    /// Run the operator on a batch of tuples, holding one permit of the exclusion barrier.
    pub fn process_batch(&self, tuples: Vec<DataTuple>) {
        let count = tuples.len() as u64;
        let mut api = ProcessingApi::new(self);
        self.operator.process_batch(tuples, &mut api);
        drop(api);
        self.metrics.events_processed(count);
    }

    /// Send `tuple` to every downstream in `targets`.
    ///
    /// Synchronous channels are written through the output queue, asynchronous channels enqueue the tuple
    /// for their writer thread, and local downstreams process it on this thread. An out-of-range target is
    /// logged and skipped. Every target is attempted; the first error is returned.
    pub fn send_data(&self, tuple: DataTuple, targets: &[usize]) -> Result<(), RoutingError> {
        let (routes, downstream_count) = {
            let endpoints = read(&self.endpoints);
            let routes: Vec<(usize, Option<EndPoint>)> = targets
                .iter()
                .map(|&target_idx| (target_idx, endpoints.get(target_idx).cloned()))
                .collect();
            (routes, endpoints.len())
        };

        let mut first_error = None;
        for (target_idx, endpoint) in routes {
            let result = match endpoint {
                None => {
                    log::error!(
                        "{:?} tried to send to downstream index {}, but only {} downstreams are known",
                        self.op_id,
                        target_idx,
                        downstream_count
                    );
                    Event::publish(
                        &self.event_publisher,
                        Event::RoutingError(RoutingErrorEvent {
                            timestamp: SystemTime::now(),
                            op_id: self.op_id,
                            target_idx,
                            downstream_count,
                        }),
                    );
                    Err(RoutingError::IndexOutOfRange {
                        target_idx,
                        downstream_count,
                    })
                }
                Some(EndPoint::Synchronous(channel)) => self
                    .output_queue
                    .send_to_downstream(tuple.payload().clone(), &channel)
                    .map_err(|error| RoutingError::Delivery { target_idx, error }),
                Some(endpoint) => endpoint
                    .deliver(tuple.clone())
                    .map_err(|error| RoutingError::Delivery { target_idx, error }),
            };
            if let Err(err) = result {
                if let RoutingError::Delivery { .. } = err {
                    log::warn!("{:?} failed to deliver a tuple: {:?}", self.op_id, err);
                }
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /* ↓↓↓ Checkpointing ↓↓↓ */

    /// Checkpoint a small state by deep copy and send it to the backup node. Returns the watermark to
    /// acknowledge. Terminates the process if the operator has no state.
    pub fn checkpoint_and_backup_state(&self) -> TimestampTracker {
        match self.try_checkpoint_and_backup_state() {
            Ok(watermark) => watermark,
            Err(err) => fatal(err),
        }
    }

    pub fn try_checkpoint_and_backup_state(&self) -> Result<TimestampTracker, CheckpointError> {
        self.publish_start_checkpoint(CheckpointKind::DeepCopy);
        let watermark = self.owner.incoming_tt();

        let exclusion_start = Instant::now();
        let copy = {
            let guard = self.state.write();
            guard.as_deref().map(|state| state.deep_copy())
        };
        let exclusion_time = exclusion_start.elapsed();
        let mut copy = copy.ok_or(CheckpointError::NoState)?;

        copy.meta_mut().set_owner_id(self.op_id);
        copy.meta_mut().set_data_ts(watermark.clone());
        let blob = copy.serialize_state()?;
        let state_digest = CryptoHash::digest(&blob);
        let size = blob.len();

        let backup = BackupOperatorState {
            op_id: self.op_id,
            state: blob,
            output_buffers: self.output_buffer_snapshots(),
            state_tag: copy.meta().state_tag().clone(),
        };
        self.owner.send_backup_state(ControlTuple::BackupOperatorState(backup));
        Event::publish(
            &self.event_publisher,
            Event::SendBackup(SendBackupEvent {
                timestamp: SystemTime::now(),
                op_id: self.op_id,
                state_digest,
                size,
            }),
        );

        self.metrics.checkpoints(1);
        let watermark = self.record_checkpoint_watermark(&watermark);
        self.publish_end_checkpoint(CheckpointKind::DeepCopy, &watermark, exclusion_time);
        Ok(watermark)
    }

    /// Checkpoint a large state by streaming it in chunks to the backup replicas. Returns the watermark to
    /// acknowledge. Terminates the process if the state is missing or lacks a required capability, or if
    /// there is no backup replica.
    pub fn lock_free_parallel_checkpoint_and_backup_state(&self) -> TimestampTracker {
        match self.try_lock_free_parallel_checkpoint_and_backup_state() {
            Ok(watermark) => watermark,
            Err(err) => fatal(err),
        }
    }

    pub fn try_lock_free_parallel_checkpoint_and_backup_state(&self) -> Result<TimestampTracker, CheckpointError> {
        let replicas = read(&self.topology).star_topology_size();
        if replicas == 0 {
            return Err(CheckpointError::EmptyReplicaSet);
        }

        self.publish_start_checkpoint(CheckpointKind::Streamed);
        let watermark = self.owner.incoming_tt();

        let exclusion_start = Instant::now();
        let manager = {
            let mut guard = self.state.write();
            let state = guard.as_deref_mut().ok_or(CheckpointError::NoState)?;
            if state.as_versionable_mut().is_none() {
                return Err(CheckpointError::MissingCapability("Versionable"));
            }
            let view = state
                .as_streamable()
                .ok_or(CheckpointError::MissingCapability("Streamable"))?
                .streaming_view();
            let manager = StreamStateManager::new(view, self.processing_config.chunk_size)?;
            state.meta_mut().set_data_ts(watermark.clone());
            if let Some(versionable) = state.as_versionable_mut() {
                versionable.set_dirty_mode(true);
            }
            manager
        };
        let mut exclusion_time = exclusion_start.elapsed();

        let total_chunks = manager.total_chunks();
        for chunk in manager {
            let target_idx = chunk.sequence_number as usize % replicas;
            let sequence_number = chunk.sequence_number;
            let msg = ControlTuple::StateChunk(StateChunk {
                op_id: self.op_id,
                sequence_number,
                total_chunks: chunk.total_chunks,
                replicas: replicas as u32,
                bytes: chunk.bytes,
            });
            self.owner.send_blind_data(msg, target_idx);
            self.metrics.chunks_sent(1);
            Event::publish(
                &self.event_publisher,
                Event::StreamChunk(StreamChunkEvent {
                    timestamp: SystemTime::now(),
                    op_id: self.op_id,
                    sequence_number,
                    total_chunks,
                    target_idx,
                }),
            );
        }
        Event::publish(
            &self.event_publisher,
            Event::CompleteStreaming(CompleteStreamingEvent {
                timestamp: SystemTime::now(),
                op_id: self.op_id,
                total_chunks,
            }),
        );

        let reconcile_start = Instant::now();
        {
            let mut guard = self.state.write();
            if let Some(versionable) = guard.as_deref_mut().and_then(|state| state.as_versionable_mut()) {
                versionable.reconcile();
            }
        }
        exclusion_time += reconcile_start.elapsed();
        Event::publish(
            &self.event_publisher,
            Event::ReconcileState(ReconcileStateEvent {
                timestamp: SystemTime::now(),
                op_id: self.op_id,
            }),
        );

        self.metrics.checkpoints(1);
        let watermark = self.record_checkpoint_watermark(&watermark);
        self.publish_end_checkpoint(CheckpointKind::Streamed, &watermark, exclusion_time);
        Ok(watermark)
    }

    /// Whether the current state is checkpointed by streaming rather than by deep copy.
    pub fn uses_large_state_checkpoint(&self) -> Option<bool> {
        self.with_state(|state| state.map(|state| state.is_large()))
    }

    // Successive checkpoint watermarks never decrease, even if the owner's incoming watermark does.
    fn record_checkpoint_watermark(&self, watermark: &TimestampTracker) -> TimestampTracker {
        let mut last = lock(&self.last_checkpoint_watermark);
        last.merge(watermark);
        last.clone()
    }

    fn output_buffer_snapshots(&self) -> Vec<OutputBufferSnapshot> {
        read(&self.endpoints)
            .iter()
            .filter_map(|endpoint| endpoint.sync_channel())
            .map(|channel| channel.output_buffer_snapshot())
            .collect()
    }

    fn publish_start_checkpoint(&self, kind: CheckpointKind) {
        Event::publish(
            &self.event_publisher,
            Event::StartCheckpoint(StartCheckpointEvent {
                timestamp: SystemTime::now(),
                op_id: self.op_id,
                kind,
            }),
        );
    }

    fn publish_end_checkpoint(&self, kind: CheckpointKind, watermark: &TimestampTracker, exclusion_time: Duration) {
        Event::publish(
            &self.event_publisher,
            Event::EndCheckpoint(EndCheckpointEvent {
                timestamp: SystemTime::now(),
                op_id: self.op_id,
                kind,
                watermark: watermark.clone(),
                exclusion_time,
            }),
        );
    }

    /* ↓↓↓ Recovery ↓↓↓ */

    /// Replace the operator's state with `state`, received from a backup, and notify the operator.
    pub fn install_state(&self, state: Box<dyn State>) -> Result<(), InstallError> {
        self.check_mode_supports(state.as_ref())?;
        {
            let mut transfer = lock(&self.incoming_transfer);
            let mut guard = self.state.write();
            *transfer = None;
            *guard = Some(state);
            if let Some(state) = guard.as_deref() {
                self.operator.state_installed(state);
            }
        }
        self.publish_install_state();
        Ok(())
    }

    /// Decode a state blob with the decoder registered for `tag`, and install it.
    pub fn install_state_blob(&self, tag: &StateTag, blob: &[u8]) -> Result<(), InstallError> {
        let state = self.decoders.decode(tag, blob)?;
        self.install_state(state)
    }

    /// Append one chunk of a streamed state to the operator's state. `None` marks the end of the transfer
    /// and finalizes the state.
    ///
    /// Chunks must arrive in order. A chunk with sequence number 0 starts a new transfer and discards the
    /// current contents of the state.
    pub fn merge_chunk_to_state(&self, chunk: Option<StateChunk>) -> Result<(), InstallError> {
        let mut transfer = lock(&self.incoming_transfer);
        let mut guard = self.state.write();
        let state = guard.as_deref_mut().ok_or(InstallError::NoState)?;
        let streamable = state
            .as_streamable_mut()
            .ok_or(InstallError::MissingCapability("Streamable"))?;

        match chunk {
            Some(chunk) => {
                let (expected, total_chunks) = match (chunk.sequence_number, transfer.as_ref()) {
                    (0, _) | (_, None) => (0, chunk.total_chunks),
                    (_, Some(transfer)) => (transfer.next_sequence_number, transfer.total_chunks),
                };
                if chunk.sequence_number != expected {
                    return Err(StateError::ChunkOutOfOrder {
                        expected,
                        received: chunk.sequence_number,
                    }
                    .into());
                }
                if chunk.total_chunks != total_chunks {
                    return Err(StateError::TotalChunksMismatch {
                        expected: total_chunks,
                        received: chunk.total_chunks,
                    }
                    .into());
                }
                if chunk.sequence_number == 0 {
                    streamable.begin_transfer();
                }
                streamable.append_chunk(Some(&chunk.bytes))?;
                *transfer = Some(IncomingTransfer {
                    next_sequence_number: chunk.sequence_number.saturating_add(1),
                    total_chunks,
                });
                Ok(())
            }
            None => {
                if let Some(finished) = transfer.take() {
                    if finished.next_sequence_number != finished.total_chunks {
                        return Err(StateError::IncompleteTransfer {
                            expected: finished.total_chunks,
                            received: finished.next_sequence_number,
                        }
                        .into());
                    }
                }
                streamable.append_chunk(None)?;
                self.operator.state_installed(state);
                drop(guard);
                self.publish_install_state();
                Ok(())
            }
        }
    }

    fn check_mode_supports(&self, state: &dyn State) -> Result<(), InstallError> {
        if matches!(self.mode, WorkerMode::Multi(_)) && state.as_partitionable().is_none() {
            return Err(InstallError::NotPartitionable);
        }
        Ok(())
    }

    fn publish_install_state(&self) {
        Event::publish(
            &self.event_publisher,
            Event::InstallState(InstallStateEvent {
                timestamp: SystemTime::now(),
                op_id: self.op_id,
            }),
        );
    }

    /// Clear every partition of a partitionable state. Returns `false` if the state is missing or not
    /// partitionable.
    pub fn reset_state(&self) -> bool {
        let guard = self.state.write();
        match guard.as_deref().and_then(|state| state.as_partitionable()) {
            Some(partitionable) => {
                partitionable.reset_state();
                true
            }
            None => false,
        }
    }

    /* ↓↓↓ Managed-state registry ↓↓↓ */

    /// Start backing up the state of `op_id` on this node.
    pub fn register_managed_state(&self, op_id: OperatorId) -> bool {
        self.backup_store.register_managed_state(op_id)
    }

    /// Stop backing up the state of `op_id`, discarding what is buffered for it.
    pub fn invalidate_state(&self, op_id: OperatorId) -> bool {
        self.backup_store.invalidate_state(op_id)
    }

    pub fn is_managing_state_of(&self, op_id: OperatorId) -> bool {
        self.backup_store.is_managing_state_of(op_id)
    }

    pub fn backup_store(&self) -> &BackupStore {
        &self.backup_store
    }

    /* ↓↓↓ Topology ↓↓↓ */

    /// Add (or replace) a downstream reached through a synchronous channel, connected on first use.
    /// Returns its index.
    pub fn add_downstream(&self, info: OperatorStaticInformation) -> usize {
        let channel = SyncChannel::deferred(info.clone(), self.channel_config.clone(), self.event_publisher.clone());
        self.add_downstream_endpoint(info, EndPoint::Synchronous(Arc::new(channel)))
    }

    /// Add (or replace) a downstream reached through an asynchronous channel. Returns its index.
    pub fn add_async_downstream(&self, info: OperatorStaticInformation) -> usize {
        let channel = SyncChannel::deferred(info.clone(), self.channel_config.clone(), self.event_publisher.clone());
        let channel = AsyncChannel::new(Arc::new(channel), self.processing_config.input_queue_capacity);
        self.add_downstream_endpoint(info, EndPoint::Asynchronous(Arc::new(channel)))
    }

    /// Add (or replace) a downstream hosted on this node. Returns its index.
    pub fn add_local_downstream(&self, info: OperatorStaticInformation, downstream: Arc<dyn LocalDownstream>) -> usize {
        let op_id = info.op_id;
        self.add_downstream_endpoint(info, EndPoint::Local(op_id, downstream))
    }

    /// Add (or replace) a downstream reached through `endpoint`. Returns its index.
    pub fn add_downstream_endpoint(&self, info: OperatorStaticInformation, endpoint: EndPoint) -> usize {
        if let EndPoint::Synchronous(channel) = &endpoint {
            self.output_queue.register(Arc::clone(channel));
        }
        let mut endpoints = write(&self.endpoints);
        let idx = write(&self.topology).add_downstream(info);
        if idx < endpoints.len() {
            endpoints[idx] = endpoint;
        } else {
            endpoints.push(endpoint);
        }
        idx
    }

    /// Add (or replace) an upstream, and open a channel back to it, connected on first use.
    pub fn add_upstream(&self, info: OperatorStaticInformation) {
        let channel = SyncChannel::deferred(info.clone(), self.channel_config.clone(), self.event_publisher.clone());
        write(&self.upstream_channels).insert(info.op_id, Arc::new(channel));
        write(&self.topology).add_upstream(info);
    }

    pub fn upstream_channel(&self, op_id: OperatorId) -> Option<Arc<SyncChannel>> {
        read(&self.upstream_channels).get(&op_id).cloned()
    }

    /// Channel to the downstream `op_id`, if it is reached through one.
    pub fn downstream_channel(&self, op_id: OperatorId) -> Option<Arc<SyncChannel>> {
        read(&self.endpoints)
            .iter()
            .find(|endpoint| endpoint.op_id() == op_id)
            .and_then(|endpoint| endpoint.sync_channel().cloned())
    }

    /// `op_id` moved to `ip`: update the topology and point the channels to it at the new location.
    /// Returns whether `op_id` is an upstream or a downstream of this operator.
    pub fn reconfigure_operator_connection(&self, op_id: OperatorId, ip: IpAddr) -> bool {
        let (found, upstream, downstream) = {
            let mut topology = write(&self.topology);
            let found = topology.reconfigure_operator_location(op_id, ip);
            let downstream = topology
                .downstream_index_of(op_id)
                .and_then(|idx| topology.downstream(idx).cloned());
            (found, topology.upstream(op_id).cloned(), downstream)
        };
        if !found {
            log::warn!("{:?} cannot reconfigure {:?}: not a neighbour", self.op_id, op_id);
            return false;
        }

        if let (Some(info), Some(channel)) = (upstream, self.upstream_channel(op_id)) {
            channel.reconfigure(info);
        }
        if let (Some(info), Some(channel)) = (downstream, self.downstream_channel(op_id)) {
            channel.reconfigure(info);
        }
        true
    }

    /// Stop sending on the output queue ahead of a reconfiguration of `op_id`. Tuples emitted meanwhile
    /// are buffered and replayed by [`resume_connection`](Self::resume_connection). Returns whether `op_id`
    /// is a downstream reached through a channel.
    pub fn stop_connection(&self, op_id: OperatorId) -> bool {
        self.output_queue.stop();
        match self.downstream_channel(op_id) {
            Some(channel) => {
                if !channel.is_stopped() {
                    channel.set_reconf_ts(channel.last_ts());
                    channel.set_stop(true);
                }
                true
            }
            None => false,
        }
    }

    /// Resume sending, replaying what was buffered since [`stop_connection`](Self::stop_connection). Returns
    /// how many tuples were replayed.
    pub fn resume_connection(&self) -> usize {
        self.output_queue.start()
    }

    /* ↓↓↓ Acknowledgments ↓↓↓ */

    /// Acknowledge the incoming watermark to the owner if it advanced since the last acknowledgment.
    /// Returns whether an acknowledgment was emitted.
    pub fn emit_ack(&self) -> bool {
        let current = self.owner.incoming_tt();
        let mut last_ack = lock(&self.last_ack);
        if current == *last_ack || !current.dominates(&last_ack) {
            return false;
        }
        self.owner.ack(current.clone());
        *last_ack = current.clone();
        drop(last_ack);

        Event::publish(
            &self.event_publisher,
            Event::EmitAck(EmitAckEvent {
                timestamp: SystemTime::now(),
                op_id: self.op_id,
                watermark: current,
            }),
        );
        true
    }

    pub fn get_last_ack(&self) -> TimestampTracker {
        lock(&self.last_ack).clone()
    }

    /// The downstream `from` acknowledged every tuple up to `acked_ts`: discard them from the output
    /// buffer of the channel to it. Returns how many tuples were discarded.
    pub fn receive_ack(&self, from: OperatorId, acked_ts: u64) -> usize {
        match self.downstream_channel(from) {
            Some(channel) => channel.trim_output_buffer(acked_ts),
            None => 0,
        }
    }
}

impl LocalDownstream for ProcessingUnit {
    fn process_local(&self, tuple: DataTuple) {
        self.process_data(tuple);
    }
}

impl ControlHandler for ProcessingUnit {
    fn handle_control(&self, msg: ControlTuple, peer: Option<SocketAddr>) {
        match msg {
            ControlTuple::BackupOperatorState(backup) => {
                self.backup_store.store_backup(backup);
            }
            ControlTuple::StateChunk(chunk) if chunk.op_id == self.op_id => {
                let last = chunk.is_last();
                if let Err(err) = self.merge_chunk_to_state(Some(chunk)) {
                    log::warn!("{:?} rejected a chunk of its own state from {:?}: {:?}", self.op_id, peer, err);
                    return;
                }
                if last {
                    if let Err(err) = self.merge_chunk_to_state(None) {
                        log::warn!("{:?} failed to finalize its streamed state: {:?}", self.op_id, err);
                    }
                }
            }
            ControlTuple::StateChunk(chunk) => {
                if let Err(err) = self.backup_store.append_chunk(&chunk) {
                    log::warn!("Dropping streamed backup of {:?} from {:?}: {:?}", chunk.op_id, peer, err);
                }
            }
            ControlTuple::InitOperatorState(init) => {
                if init.op_id != self.op_id {
                    log::warn!("{:?} received the state of {:?}, ignoring it", self.op_id, init.op_id);
                    return;
                }
                if let Err(err) = self.install_state_blob(&init.state_tag, &init.state) {
                    log::error!("{:?} failed to install the state received from {:?}: {:?}", self.op_id, peer, err);
                }
            }
        }
    }
}

fn create_tuple_attribute_mapper(op_id: OperatorId, operator: &dyn Operator) -> AttributeMapper {
    let attributes = operator.declared_working_attributes();
    if attributes.is_empty() {
        log::warn!("{:?} declares no working attributes, its tuples will only be readable by position", op_id);
    }
    AttributeMapper::from_attributes(&attributes)
}

#[derive(Debug)]
pub enum RoutingError {
    /// The target index is not one of the unit's downstreams.
    IndexOutOfRange { target_idx: usize, downstream_count: usize },

    /// The endpoint at the target index failed to take the tuple.
    Delivery { target_idx: usize, error: ChannelError },
}

/// Enumerates the ways a checkpoint can fail. Each is a wiring error rather than a runtime condition.
#[derive(Debug)]
pub enum CheckpointError {
    NoState,
    MissingCapability(&'static str),
    /// A large-state checkpoint has no backup replica to send chunks to.
    EmptyReplicaSet,
    State(StateError),
}

impl From<StateError> for CheckpointError {
    fn from(value: StateError) -> Self {
        CheckpointError::State(value)
    }
}

/// Enumerates the ways installing a state can fail.
#[derive(Debug)]
pub enum InstallError {
    NoState,
    MissingCapability(&'static str),
    /// A multi-worker unit only hosts partitionable states.
    NotPartitionable,
    State(StateError),
}

impl From<StateError> for InstallError {
    fn from(value: StateError) -> Self {
        InstallError::State(value)
    }
}
