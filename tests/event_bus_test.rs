use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::LevelFilter;

use dataflow_rs::event_bus::{EventBus, EventHandlers};
use dataflow_rs::events::{DropTuplesEvent, Event, FlushBatchEvent, RoutingErrorEvent};
use dataflow_rs::types::OperatorId;

mod common;

use common::logging::setup_logger;

/// Handlers registered for the same kind of event fire in registration order, and only for their kind.
/// Events published before the bus is dropped are still handled.
#[test]
fn event_bus_test() {
    setup_logger(LevelFilter::Info);
    let fired = Arc::new(Mutex::new(Vec::new()));

    let handlers = {
        let first = Arc::clone(&fired);
        let second = Arc::clone(&fired);
        let flushes = Arc::clone(&fired);
        EventHandlers::new(true)
            .on_drop_tuples(move |event| first.lock().unwrap().push(format!("first {}", event.count)))
            .on_drop_tuples(move |event| second.lock().unwrap().push(format!("second {}", event.count)))
            .on_flush_batch(move |event| flushes.lock().unwrap().push(format!("flush {}", event.tuples)))
    };
    let (event_bus, event_publisher) = EventBus::start(handlers);

    for count in 1..=3 {
        event_publisher
            .send(Event::DropTuples(DropTuplesEvent {
                timestamp: SystemTime::now(),
                source: OperatorId::new(1),
                count,
            }))
            .unwrap();
    }
    event_publisher
        .send(Event::FlushBatch(FlushBatchEvent {
            timestamp: SystemTime::now(),
            target: OperatorId::new(2),
            tuples: 15,
            last_timestamp: 99,
        }))
        .unwrap();
    // No handler is registered for routing errors beyond the logging one.
    event_publisher
        .send(Event::RoutingError(RoutingErrorEvent {
            timestamp: SystemTime::now(),
            op_id: OperatorId::new(3),
            target_idx: 4,
            downstream_count: 2,
        }))
        .unwrap();

    drop(event_bus);

    assert_eq!(
        *fired.lock().unwrap(),
        vec![
            "first 1", "second 1", "first 2", "second 2", "first 3", "second 3", "flush 15"
        ]
    );
}

/// Handlers without logging report no handlers until one is registered.
#[test]
fn empty_handlers_test() {
    assert!(EventHandlers::new(false).is_empty());
    assert!(!EventHandlers::new(true).is_empty());
    assert!(!EventHandlers::new(false).on_emit_ack(|_| ()).is_empty());
}
