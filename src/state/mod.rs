/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Operator state and the capabilities that decide how it is checkpointed.
//!
//! Every stateful operator owns exactly one [`State`]. The processing unit never inspects the concrete
//! type of a state; instead it asks for capabilities:
//! 1. [`Versionable`]: the state can enter a copy-on-write "dirty" mode in which mutations are tracked
//!    separately from a frozen view, and later [reconciled](Versionable::reconcile).
//! 2. [`Streamable`]: the state can expose a frozen [`StreamSource`] to be cut into chunks, and can be
//!    rebuilt from chunks on the receiving side.
//! 3. [`Partitionable`]: the state is sharded by construction, so that several workers may mutate it
//!    concurrently through shared references.
//!
//! A state that reports itself as [large](State::is_large) is checkpointed by streaming chunks rather than
//! by a whole-object deep copy, and must be both versionable and streamable.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{OperatorId, StateTag, TimestampTracker};

pub mod sharded;

pub mod streaming;

pub mod versioned;

pub use sharded::ShardedCounters;
pub use streaming::{ChunkAssembler, MemoryChunk, StreamStateManager};
pub use versioned::VersionedMap;

/// Attributes every state carries, regardless of its concrete type.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateMeta {
    owner_id: OperatorId,
    checkpoint_interval_ms: u64,
    data_ts: TimestampTracker,
    state_tag: StateTag,
}

impl StateMeta {
    pub fn new(owner_id: OperatorId, checkpoint_interval: Duration, state_tag: StateTag) -> Self {
        Self {
            owner_id,
            checkpoint_interval_ms: checkpoint_interval.as_millis() as u64,
            data_ts: TimestampTracker::new(),
            state_tag,
        }
    }

    pub fn owner_id(&self) -> OperatorId {
        self.owner_id
    }

    pub fn set_owner_id(&mut self, owner_id: OperatorId) {
        self.owner_id = owner_id;
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// Update the checkpoint interval. The interval never decreases: requests to shorten it are
    /// ignored and logged.
    pub fn set_checkpoint_interval(&mut self, interval: Duration) {
        let interval_ms = interval.as_millis() as u64;
        if interval_ms < self.checkpoint_interval_ms {
            log::warn!(
                "Ignoring attempt to shorten the checkpoint interval of {:?} from {}ms to {}ms",
                self.owner_id,
                self.checkpoint_interval_ms,
                interval_ms
            );
            return;
        }
        self.checkpoint_interval_ms = interval_ms;
    }

    pub fn data_ts(&self) -> &TimestampTracker {
        &self.data_ts
    }

    pub fn set_data_ts(&mut self, data_ts: TimestampTracker) {
        self.data_ts = data_ts;
    }

    pub fn state_tag(&self) -> &StateTag {
        &self.state_tag
    }

    pub fn set_state_tag(&mut self, state_tag: StateTag) {
        self.state_tag = state_tag;
    }
}

/// Mutable data owned exclusively by one operator.
///
/// `State` must be `Sync` because in multi-worker mode several workers hold shared references to it at
/// once. States that are mutated in that mode must therefore also be [`Partitionable`] and use interior
/// mutability per partition. In single-worker mode the data path is handed an exclusive reference.
pub trait State: Send + Sync + Any {
    fn meta(&self) -> &StateMeta;

    fn meta_mut(&mut self) -> &mut StateMeta;

    /// Produce an independent copy of this state, metadata included.
    fn deep_copy(&self) -> Box<dyn State>;

    /// Serialize this state (metadata included) into the blob carried by a backup message.
    fn serialize_state(&self) -> Result<Vec<u8>, StateError>;

    /// Whether this state must be checkpointed by streaming chunks instead of a deep copy.
    fn is_large(&self) -> bool {
        false
    }

    fn as_versionable_mut(&mut self) -> Option<&mut dyn Versionable> {
        None
    }

    fn as_streamable(&self) -> Option<&dyn Streamable> {
        None
    }

    fn as_streamable_mut(&mut self) -> Option<&mut dyn Streamable> {
        None
    }

    fn as_partitionable(&self) -> Option<&dyn Partitionable> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Copy-on-write capability.
pub trait Versionable {
    /// Enter (`true`) or leave (`false`) dirty mode. While dirty, mutations must not be visible through
    /// any [`StreamSource`] handed out before entering the mode.
    fn set_dirty_mode(&mut self, dirty: bool);

    fn is_dirty(&self) -> bool;

    /// Fold the mutations tracked while dirty back into the state, and leave dirty mode.
    fn reconcile(&mut self);
}

/// Chunked transfer capability.
pub trait Streamable {
    /// Get a frozen, read-only view of the current contents of this state. Must be cheap: it is called
    /// while the data path is excluded.
    fn streaming_view(&self) -> Arc<dyn StreamSource>;

    /// Discard the current contents before the first chunk of a transfer is appended, so that the
    /// rebuilt state holds exactly what was streamed. Metadata is kept.
    fn begin_transfer(&mut self);

    /// Append one received chunk. `None` marks the end of the transfer and finalizes the state.
    fn append_chunk(&mut self, chunk: Option<&[u8]>) -> Result<(), StateError>;
}

/// Sharding capability.
pub trait Partitionable {
    /// Clear every partition.
    fn reset_state(&self);

    fn partitions(&self) -> usize;
}

/// A frozen sequence of units (bytes, entries...) that can be read in ranges.
pub trait StreamSource: Send + Sync {
    /// Number of units in this source, known up front.
    fn size(&self) -> usize;

    /// Serialize the units `offset..offset + len` (clamped to `size`).
    fn read(&self, offset: usize, len: usize) -> Vec<u8>;
}

impl StreamSource for Vec<u8> {
    fn size(&self) -> usize {
        self.len()
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let start = offset.min(self.len());
        let end = offset.saturating_add(len).min(self.len());
        self[start..end].to_vec()
    }
}

/// Decodes a state blob back into a concrete state.
pub type StateDecoder = fn(&[u8]) -> Result<Box<dyn State>, StateError>;

/// Registry of [`StateDecoder`]s keyed by [`StateTag`], used on the backup side to rebuild states that
/// arrive as blobs.
#[derive(Default, Clone)]
pub struct StateDecoders {
    decoders: HashMap<StateTag, StateDecoder>,
}

impl StateDecoders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: StateTag, decoder: StateDecoder) {
        self.decoders.insert(tag, decoder);
    }

    pub fn decode(&self, tag: &StateTag, blob: &[u8]) -> Result<Box<dyn State>, StateError> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| StateError::UnknownStateTag(tag.clone()))?;
        decoder(blob)
    }
}

/// Enumerates the different ways manipulating a state, or a transfer of one, can fail.
#[derive(Debug)]
pub enum StateError {
    /// The state could not be (de)serialized.
    SerializationError(io::Error),

    /// No decoder is registered for this tag.
    UnknownStateTag(StateTag),

    /// A chunk arrived out of sequence.
    ChunkOutOfOrder { expected: u32, received: u32 },

    /// A chunk disagrees with the total chunk count fixed at the start of the transfer.
    TotalChunksMismatch { expected: u32, received: u32 },

    /// The transfer was finalized before every chunk arrived.
    IncompleteTransfer { expected: u32, received: u32 },

    /// The operation requires a capability the state does not have.
    MissingCapability(&'static str),

    ZeroChunkSize,
}

impl From<io::Error> for StateError {
    fn from(value: io::Error) -> Self {
        StateError::SerializationError(value)
    }
}
