/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The node-hosting runtime, as seen by a processing unit.

use crate::messages::ControlTuple;
use crate::types::{SystemStatus, TimestampTracker};

/// Callbacks a processing unit makes into the node that hosts it.
///
/// `send_backup_state` and `send_blind_data` must deliver the message at least once to a live control
/// channel. The other callbacks are notifications or queries and must not block for long.
pub trait Owner: Send + Sync {
    /// Advance the acknowledged watermark and propagate it upstream. Fire-and-forget.
    fn ack(&self, watermark: TimestampTracker);

    /// The watermark of the input received so far.
    fn incoming_tt(&self) -> TimestampTracker;

    /// Send a whole-state backup to the backup node.
    fn send_backup_state(&self, msg: ControlTuple);

    /// Send one chunk of a streamed state to the `target_idx`th node of the backup replica set.
    fn send_blind_data(&self, msg: ControlTuple, target_idx: usize);

    /// Whether the node is still accepting input.
    fn check_system_status(&self) -> SystemStatus;
}
