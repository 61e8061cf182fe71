/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Out-of-band messages sent over control channels.
//!
//! The data plane only ever carries [`BatchTuplePayload`](crate::types::BatchTuplePayload)s. Everything
//! that has to do with fault tolerance (whole-state backups, chunks of a streamed state, and state
//! handed back for recovery) travels as a [`ControlTuple`] on the control socket, or on the blind socket
//! for chunks.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{OperatorId, StateTag, TuplePayload};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ControlTuple {
    BackupOperatorState(BackupOperatorState),
    StateChunk(StateChunk),
    InitOperatorState(InitOperatorState),
}

impl ControlTuple {
    /// Get the id of the operator whose state this message carries.
    pub fn op_id(&self) -> OperatorId {
        match self {
            ControlTuple::BackupOperatorState(backup) => backup.op_id,
            ControlTuple::StateChunk(chunk) => chunk.op_id,
            ControlTuple::InitOperatorState(init) => init.op_id,
        }
    }
}

/// Whole-state snapshot of one operator, sent to its backup node after a small-state checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BackupOperatorState {
    pub op_id: OperatorId,
    /// The state as produced by [`State::serialize_state`](crate::state::State::serialize_state).
    pub state: Vec<u8>,
    /// Tuples sent downstream but not yet acknowledged, one snapshot per downstream.
    pub output_buffers: Vec<OutputBufferSnapshot>,
    pub state_tag: StateTag,
}

/// One fragment of a chunked state transfer.
///
/// For one transfer, sequence numbers are contiguous starting at 0, and `total_chunks` and `replicas` are
/// identical in every chunk. Chunk `i` is sent to backup replica `i % replicas`, so each replica receives
/// the share of sequence numbers congruent to its index.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateChunk {
    pub op_id: OperatorId,
    pub sequence_number: u32,
    pub total_chunks: u32,
    pub replicas: u32,
    pub bytes: Vec<u8>,
}

impl StateChunk {
    pub fn is_last(&self) -> bool {
        self.sequence_number.saturating_add(1) >= self.total_chunks
    }

    /// Index of the replica this chunk is sent to.
    pub fn replica_index(&self) -> u32 {
        self.sequence_number % self.replicas.max(1)
    }
}

/// State handed to a recovering operator.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InitOperatorState {
    pub op_id: OperatorId,
    pub state: Vec<u8>,
    pub state_tag: StateTag,
}

/// Unacknowledged tuples sent to one downstream operator.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OutputBufferSnapshot {
    pub downstream: OperatorId,
    pub tuples: Vec<TuplePayload>,
}
