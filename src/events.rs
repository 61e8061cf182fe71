/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by processing units and channels, for event handling and logging.
//!
//! Note: an event for a given action indicates that the action has been completed.

use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::types::{CryptoHash, OperatorId, TimestampTracker};

pub enum Event {
    // Checkpointing events.
    StartCheckpoint(StartCheckpointEvent),
    EndCheckpoint(EndCheckpointEvent),
    SendBackup(SendBackupEvent),
    StreamChunk(StreamChunkEvent),
    CompleteStreaming(CompleteStreamingEvent),
    ReconcileState(ReconcileStateEvent),
    InstallState(InstallStateEvent),
    // Channel events.
    ReconnectDataLink(ReconnectDataLinkEvent),
    ConnectControlLink(ConnectControlLinkEvent),
    FlushBatch(FlushBatchEvent),
    // Data path events.
    RoutingError(RoutingErrorEvent),
    EmitAck(EmitAckEvent),
    DropTuples(DropTuplesEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus may already have been shut down during teardown.
            let _ = event_publisher.send(event);
        }
    }
}

/// Whether a checkpoint copied the whole state or streamed it in chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointKind {
    DeepCopy,
    Streamed,
}

pub struct StartCheckpointEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
    pub kind: CheckpointKind,
}

pub struct EndCheckpointEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
    pub kind: CheckpointKind,
    /// The watermark returned for acknowledgment.
    pub watermark: TimestampTracker,
    /// Time spent holding the exclusion barrier.
    pub exclusion_time: Duration,
}

pub struct SendBackupEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
    pub state_digest: CryptoHash,
    pub size: usize,
}

pub struct StreamChunkEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
    pub sequence_number: u32,
    pub total_chunks: u32,
    pub target_idx: usize,
}

pub struct CompleteStreamingEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
    pub total_chunks: u32,
}

pub struct ReconcileStateEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
}

pub struct InstallStateEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
}

pub struct ReconnectDataLinkEvent {
    pub timestamp: SystemTime,
    pub target: SocketAddr,
    pub attempts: u64,
}

pub struct ConnectControlLinkEvent {
    pub timestamp: SystemTime,
    pub target: SocketAddr,
}

pub struct FlushBatchEvent {
    pub timestamp: SystemTime,
    pub target: OperatorId,
    pub tuples: usize,
    pub last_timestamp: u64,
}

pub struct RoutingErrorEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
    pub target_idx: usize,
    pub downstream_count: usize,
}

pub struct EmitAckEvent {
    pub timestamp: SystemTime,
    pub op_id: OperatorId,
    pub watermark: TimestampTracker,
}

pub struct DropTuplesEvent {
    pub timestamp: SystemTime,
    pub source: OperatorId,
    pub count: usize,
}
