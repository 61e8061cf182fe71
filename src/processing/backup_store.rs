/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Backups of other operators' states held by this node.
//!
//! A node backs up the state of the operators it is registered as managing. For each of them the
//! [`BackupStore`] keeps the latest whole-state backup and, while a streamed transfer is in progress,
//! a [`ChunkAssembler`] for the share of the transfer sent to this node. Backup messages about operators that are not managed here are discarded, and
//! invalidating an operator drops everything buffered for it.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::comm::lock;
use crate::messages::{BackupOperatorState, StateChunk};
use crate::state::{ChunkAssembler, StateError};
use crate::types::OperatorId;

#[derive(Default)]
struct BackupSlot {
    latest: Option<BackupOperatorState>,
    assembler: Option<ChunkAssembler>,
    streamed: Option<Vec<(u32, Vec<u8>)>>,
}

#[derive(Default)]
pub struct BackupStore {
    slots: Mutex<BTreeMap<OperatorId, BackupSlot>>,
}

impl BackupStore {
    pub fn new() -> BackupStore {
        Self::default()
    }

    /// Start managing the state of `op_id`. Returns `false` if it was already managed.
    pub fn register_managed_state(&self, op_id: OperatorId) -> bool {
        let mut slots = lock(&self.slots);
        if slots.contains_key(&op_id) {
            return false;
        }
        slots.insert(op_id, BackupSlot::default());
        true
    }

    /// Stop managing the state of `op_id`, discarding what is buffered for it. Returns whether it was
    /// managed.
    pub fn invalidate_state(&self, op_id: OperatorId) -> bool {
        lock(&self.slots).remove(&op_id).is_some()
    }

    pub fn is_managing_state_of(&self, op_id: OperatorId) -> bool {
        lock(&self.slots).contains_key(&op_id)
    }

    pub fn managed_operators(&self) -> Vec<OperatorId> {
        lock(&self.slots).keys().copied().collect()
    }

    /// Keep `backup` as the latest backup of its operator. Returns `false`, discarding it, if the operator
    /// is not managed here.
    pub fn store_backup(&self, backup: BackupOperatorState) -> bool {
        match lock(&self.slots).get_mut(&backup.op_id) {
            Some(slot) => {
                slot.latest = Some(backup);
                true
            }
            None => {
                log::debug!("Discarding backup of unmanaged operator {:?}", backup.op_id);
                false
            }
        }
    }

    /// Append one chunk of a streamed backup. The first chunk of this node's share (a sequence number
    /// below `replicas`) starts a new transfer. Returns whether this chunk completed the share, in which
    /// case its chunks become the operator's [streamed backup](Self::streamed_chunks).
    pub fn append_chunk(&self, chunk: &StateChunk) -> Result<bool, StateError> {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(&chunk.op_id) else {
            log::debug!("Discarding chunk {} of unmanaged operator {:?}", chunk.sequence_number, chunk.op_id);
            return Ok(false);
        };

        if chunk.sequence_number < chunk.replicas.max(1) {
            slot.assembler = Some(ChunkAssembler::for_share(chunk.op_id, chunk.replicas, chunk.replica_index()));
        }
        let assembler = slot.assembler.as_mut().ok_or(StateError::ChunkOutOfOrder {
            expected: chunk.replica_index(),
            received: chunk.sequence_number,
        })?;
        if let Err(err) = assembler.append(chunk) {
            slot.assembler = None;
            return Err(err);
        }

        if !assembler.is_complete() {
            return Ok(false);
        }
        if let Some(assembler) = slot.assembler.take() {
            slot.streamed = Some(assembler.finish_indexed()?);
        }
        Ok(true)
    }

    pub fn latest_backup(&self, op_id: OperatorId) -> Option<BackupOperatorState> {
        lock(&self.slots).get(&op_id).and_then(|slot| slot.latest.clone())
    }

    /// This node's share of the last completed streamed backup of `op_id`: the chunks with their sequence
    /// numbers, in sequence order.
    pub fn streamed_chunks(&self, op_id: OperatorId) -> Option<Vec<(u32, Vec<u8>)>> {
        lock(&self.slots).get(&op_id).and_then(|slot| slot.streamed.clone())
    }
}
