use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{Level, LevelFilter};

use dataflow_rs::comm::{ChannelError, RetryPolicy, SyncChannel};
use dataflow_rs::types::{TuplePayload, Value};

mod common;

use common::net::{channel_config, operator_at, unused_port};

const RETRY_TARGET: &str = "dataflow_rs::comm::retry";

/// Counts the records logged by retry loops, per level.
#[derive(Default)]
struct RetryRecords {
    errors: AtomicUsize,
    debugs: AtomicUsize,
}

fn setup_counting_logger() -> Arc<RetryRecords> {
    let records = Arc::new(RetryRecords::default());
    let counted = Arc::clone(&records);
    fern::Dispatch::new()
        .level(LevelFilter::Debug)
        .chain(fern::Output::call(move |record| {
            if record.target() != RETRY_TARGET {
                return;
            }
            match record.level() {
                Level::Error => counted.errors.fetch_add(1, Ordering::SeqCst),
                Level::Debug => counted.debugs.fetch_add(1, Ordering::SeqCst),
                _ => 0,
            };
        }))
        .apply()
        .unwrap();
    records
}

/// A channel whose target refuses 250 connections in a row logs three failures at error level (attempts
/// 1, 101 and 201) and every other failure at debug level.
#[test]
fn reconnect_log_throttling_test() {
    // 1. Install a logger counting the records of retry loops.
    let records = setup_counting_logger();

    // 2. Send to a port nobody listens on, giving up after 250 attempts.
    let channel = SyncChannel::deferred(operator_at(11, unused_port(), unused_port()), channel_config(1), None)
        .with_retry_policy(RetryPolicy::max_attempts(250, Duration::ZERO));
    let result = channel.send(TuplePayload::new(vec![Value::Int(1)], 1));
    assert!(matches!(result, Err(ChannelError::Unreachable { attempts: 250 })));

    // 3. One error line per 100 consecutive failures.
    assert_eq!(records.errors.load(Ordering::SeqCst), 3);
    assert_eq!(records.debugs.load(Ordering::SeqCst), 247);
}
