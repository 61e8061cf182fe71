/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the
//! [configuration](crate::config::Configuration::log_events).
//!
//! dataflow_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [SendBackup](crate::events::SendBackupEvent) is printed:
//!
//! ```text
//! SendBackup, 1701329264, 4, fNGCJyk, 5120
//! ```
//!
//! In the snippet:
//! - The third value is the id of the operator whose state was backed up.
//! - The fourth value is the first seven characters of the Base64 encoding of the SHA-256 digest of the
//!   serialized state.
//! - The fifth value is the size of the serialized state in bytes.
//!
//! Watermarks are printed as `source:timestamp` pairs separated by semicolons, e.g. `1:20;2:35`.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;
use crate::types::TimestampTracker;

// Names of each event in PascalCase for printing:
pub const START_CHECKPOINT: &str = "StartCheckpoint";
pub const END_CHECKPOINT: &str = "EndCheckpoint";
pub const SEND_BACKUP: &str = "SendBackup";
pub const STREAM_CHUNK: &str = "StreamChunk";
pub const COMPLETE_STREAMING: &str = "CompleteStreaming";
pub const RECONCILE_STATE: &str = "ReconcileState";
pub const INSTALL_STATE: &str = "InstallState";

pub const RECONNECT_DATA_LINK: &str = "ReconnectDataLink";
pub const CONNECT_CONTROL_LINK: &str = "ConnectControlLink";
pub const FLUSH_BATCH: &str = "FlushBatch";

pub const ROUTING_ERROR: &str = "RoutingError";
pub const EMIT_ACK: &str = "EmitAck";
pub const DROP_TUPLES: &str = "DropTuples";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for StartCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_checkpoint_event: &StartCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                START_CHECKPOINT,
                secs_since_unix_epoch(start_checkpoint_event.timestamp),
                start_checkpoint_event.op_id,
                start_checkpoint_event.kind
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_checkpoint_event: &EndCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {}, {}",
                END_CHECKPOINT,
                secs_since_unix_epoch(end_checkpoint_event.timestamp),
                end_checkpoint_event.op_id,
                end_checkpoint_event.kind,
                watermark_info(&end_checkpoint_event.watermark),
                end_checkpoint_event.exclusion_time.as_micros()
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendBackupEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_backup_event: &SendBackupEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SEND_BACKUP,
                secs_since_unix_epoch(send_backup_event.timestamp),
                send_backup_event.op_id,
                first_seven_base64_chars(&send_backup_event.state_digest.bytes()),
                send_backup_event.size
            )
        };
        Box::new(logger)
    }
}

impl Logger for StreamChunkEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stream_chunk_event: &StreamChunkEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}, {}",
                STREAM_CHUNK,
                secs_since_unix_epoch(stream_chunk_event.timestamp),
                stream_chunk_event.op_id,
                stream_chunk_event.sequence_number,
                stream_chunk_event.total_chunks,
                stream_chunk_event.target_idx
            )
        };
        Box::new(logger)
    }
}

impl Logger for CompleteStreamingEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |complete_streaming_event: &CompleteStreamingEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMPLETE_STREAMING,
                secs_since_unix_epoch(complete_streaming_event.timestamp),
                complete_streaming_event.op_id,
                complete_streaming_event.total_chunks
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReconcileStateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reconcile_state_event: &ReconcileStateEvent| {
            log::info!(
                "{}, {}, {}",
                RECONCILE_STATE,
                secs_since_unix_epoch(reconcile_state_event.timestamp),
                reconcile_state_event.op_id
            )
        };
        Box::new(logger)
    }
}

impl Logger for InstallStateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |install_state_event: &InstallStateEvent| {
            log::info!(
                "{}, {}, {}",
                INSTALL_STATE,
                secs_since_unix_epoch(install_state_event.timestamp),
                install_state_event.op_id
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReconnectDataLinkEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reconnect_data_link_event: &ReconnectDataLinkEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECONNECT_DATA_LINK,
                secs_since_unix_epoch(reconnect_data_link_event.timestamp),
                reconnect_data_link_event.target,
                reconnect_data_link_event.attempts
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConnectControlLinkEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |connect_control_link_event: &ConnectControlLinkEvent| {
            log::info!(
                "{}, {}, {}",
                CONNECT_CONTROL_LINK,
                secs_since_unix_epoch(connect_control_link_event.timestamp),
                connect_control_link_event.target
            )
        };
        Box::new(logger)
    }
}

impl Logger for FlushBatchEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |flush_batch_event: &FlushBatchEvent| {
            log::debug!(
                "{}, {}, {}, {}, {}",
                FLUSH_BATCH,
                secs_since_unix_epoch(flush_batch_event.timestamp),
                flush_batch_event.target,
                flush_batch_event.tuples,
                flush_batch_event.last_timestamp
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoutingErrorEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |routing_error_event: &RoutingErrorEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                ROUTING_ERROR,
                secs_since_unix_epoch(routing_error_event.timestamp),
                routing_error_event.op_id,
                routing_error_event.target_idx,
                routing_error_event.downstream_count
            )
        };
        Box::new(logger)
    }
}

impl Logger for EmitAckEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |emit_ack_event: &EmitAckEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                EMIT_ACK,
                secs_since_unix_epoch(emit_ack_event.timestamp),
                emit_ack_event.op_id,
                watermark_info(&emit_ack_event.watermark)
            )
        };
        Box::new(logger)
    }
}

impl Logger for DropTuplesEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |drop_tuples_event: &DropTuplesEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                DROP_TUPLES,
                secs_since_unix_epoch(drop_tuples_event.timestamp),
                drop_tuples_event.source,
                drop_tuples_event.count
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

pub(crate) fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn watermark_info(watermark: &TimestampTracker) -> String {
    watermark
        .iter()
        .map(|(source, ts)| format!("{}:{}", source, ts))
        .collect::<Vec<_>>()
        .join(";")
}
