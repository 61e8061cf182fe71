use std::sync::{Arc, Mutex};

use dataflow_rs::comm::reader::WatermarkCell;
use dataflow_rs::messages::{BackupOperatorState, ControlTuple, StateChunk};
use dataflow_rs::processing::Owner;
use dataflow_rs::types::{SystemStatus, TimestampTracker};

type ChunkHook = Box<dyn Fn(&StateChunk) + Send + Sync>;

/// An [`Owner`] that records everything a processing unit hands to it.
///
/// The incoming watermark is read from a [`WatermarkCell`] (shareable with data readers), unless it was
/// overridden with [`set_incoming_tt`](RecordingOwner::set_incoming_tt).
pub(crate) struct RecordingOwner {
    pub(crate) watermark: Arc<WatermarkCell>,
    incoming_override: Mutex<Option<TimestampTracker>>,
    status: Mutex<SystemStatus>,
    acks: Mutex<Vec<TimestampTracker>>,
    backups: Mutex<Vec<BackupOperatorState>>,
    chunks: Mutex<Vec<(StateChunk, usize)>>,
    chunk_hook: Mutex<Option<ChunkHook>>,
}

impl RecordingOwner {
    pub(crate) fn new() -> RecordingOwner {
        RecordingOwner {
            watermark: Arc::new(WatermarkCell::new()),
            incoming_override: Mutex::new(None),
            status: Mutex::new(SystemStatus::Normal),
            acks: Mutex::new(Vec::new()),
            backups: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            chunk_hook: Mutex::new(None),
        }
    }

    pub(crate) fn set_incoming_tt(&self, watermark: TimestampTracker) {
        *self.incoming_override.lock().unwrap() = Some(watermark);
    }

    pub(crate) fn set_status(&self, status: SystemStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Run `hook` on every chunk sent, after recording it.
    pub(crate) fn on_chunk(&self, hook: impl Fn(&StateChunk) + Send + Sync + 'static) {
        *self.chunk_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn acks(&self) -> Vec<TimestampTracker> {
        self.acks.lock().unwrap().clone()
    }

    pub(crate) fn backups(&self) -> Vec<BackupOperatorState> {
        self.backups.lock().unwrap().clone()
    }

    /// Chunks sent so far, with the index of the replica each was sent to.
    pub(crate) fn chunks(&self) -> Vec<(StateChunk, usize)> {
        self.chunks.lock().unwrap().clone()
    }
}

impl Owner for RecordingOwner {
    fn ack(&self, watermark: TimestampTracker) {
        self.acks.lock().unwrap().push(watermark);
    }

    fn incoming_tt(&self) -> TimestampTracker {
        match &*self.incoming_override.lock().unwrap() {
            Some(watermark) => watermark.clone(),
            None => self.watermark.snapshot(),
        }
    }

    fn send_backup_state(&self, msg: ControlTuple) {
        match msg {
            ControlTuple::BackupOperatorState(backup) => self.backups.lock().unwrap().push(backup),
            other => panic!("unexpected backup message: {:?}", other),
        }
    }

    fn send_blind_data(&self, msg: ControlTuple, target_idx: usize) {
        let chunk = match msg {
            ControlTuple::StateChunk(chunk) => chunk,
            other => panic!("unexpected blind message: {:?}", other),
        };
        self.chunks.lock().unwrap().push((chunk.clone(), target_idx));
        if let Some(hook) = &*self.chunk_hook.lock().unwrap() {
            hook(&chunk);
        }
    }

    fn check_system_status(&self) -> SystemStatus {
        *self.status.lock().unwrap()
    }
}
