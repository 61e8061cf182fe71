use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::LevelFilter;

use dataflow_rs::comm::reader::{
    Acceptor, ControlHandler, IncomingControlHandler, IncomingDataHandler, ReaderContext,
};
use dataflow_rs::comm::{DataStructureAdapter, SyncChannel};
use dataflow_rs::event_bus::{EventBus, EventHandlers};
use dataflow_rs::messages::{BackupOperatorState, ControlTuple};
use dataflow_rs::metrics::{CounterMetrics, MetricsSink};
use dataflow_rs::processing::{Owner, TopologyContext};
use dataflow_rs::types::{AttributeMapper, DataTuple, OperatorId, StateTag, SystemStatus, TuplePayload, Value};

mod common;

use common::{
    logging::setup_logger,
    net::{channel_config, localhost_listener, operator_at, unused_port, wait_until, LOCALHOST},
    operators::Sink,
    owner::RecordingOwner,
    unit::simple_unit,
};

fn op(id: u32) -> OperatorId {
    OperatorId::new(id)
}

struct Node {
    owner: Arc<RecordingOwner>,
    metrics: Arc<CounterMetrics>,
    intake: Arc<DataStructureAdapter>,
    ctx: Arc<ReaderContext>,
    listener: TcpListener,
}

impl Node {
    fn new(topology: TopologyContext, intake: DataStructureAdapter) -> Node {
        Self::with_events(topology, intake, None)
    }

    fn with_events(
        topology: TopologyContext,
        intake: DataStructureAdapter,
        event_publisher: Option<std::sync::mpsc::Sender<dataflow_rs::events::Event>>,
    ) -> Node {
        let owner = Arc::new(RecordingOwner::new());
        let metrics = Arc::new(CounterMetrics::new());
        let intake = Arc::new(intake);
        let ctx = Arc::new(ReaderContext {
            topology: Arc::new(RwLock::new(topology)),
            intake: Arc::clone(&intake),
            mapper: Arc::new(AttributeMapper::from_attributes(&["source"])),
            owner: Arc::clone(&owner) as Arc<dyn Owner>,
            watermark: Arc::clone(&owner.watermark),
            metrics: Arc::clone(&metrics) as Arc<dyn MetricsSink>,
            event_publisher,
        });
        Node {
            owner,
            metrics,
            intake,
            ctx,
            listener: localhost_listener(),
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Connect an upstream `source` to this node, returning the upstream's channel and the reader of the
    /// connection.
    fn connect(&self, source: u32) -> (SyncChannel, JoinHandle<()>) {
        let client = TcpStream::connect((LOCALHOST, self.port())).unwrap();
        let (server, _) = self.listener.accept().unwrap();
        let reader = IncomingDataHandler::spawn_with_origin(server, op(source), Arc::clone(&self.ctx));
        let target = operator_at(100, self.port(), unused_port());
        let channel = SyncChannel::from_streams(target, client, None, channel_config(15), None);
        (channel, reader)
    }
}

fn send_batch(channel: &SyncChannel, source: u64, count: u64) {
    for k in 1..=count {
        let payload = TuplePayload::new(vec![Value::Int(source as i64)], source * 10 + k);
        channel.send(payload).unwrap();
    }
    assert!(channel.flush().unwrap());
}

fn timestamps_from(tuples: &[DataTuple], source: i64) -> Vec<u64> {
    tuples
        .iter()
        .filter(|tuple| tuple.get_int("source") == Some(source))
        .map(|tuple| tuple.timestamp())
        .collect()
}

/// Three upstreams each send one batch of five tuples to a node with one shared input queue. Every tuple
/// arrives, in order per upstream, and the incoming watermark ends at the highest timestamp seen.
#[test]
fn end_to_end_intake_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components.
    let node = Node::new(TopologyContext::new(op(100)), DataStructureAdapter::unique(100));
    let (channels, readers): (Vec<_>, Vec<_>) = (1..=3).map(|source| node.connect(source)).unzip();

    // 2. Each upstream sends one batch.
    for (source, channel) in (1..=3).zip(&channels) {
        send_batch(channel, source, 5);
    }
    assert!(wait_until(Duration::from_secs(10), || node.intake.len() == 15));

    // 3. Every tuple arrived, in order per upstream.
    let tuples = node.intake.queue_for(op(0)).unwrap().drain();
    assert_eq!(tuples.len(), 15);
    for source in 1..=3 {
        let expected: Vec<u64> = (1..=5).map(|k| source * 10 + k).collect();
        assert_eq!(timestamps_from(&tuples, source as i64), expected);
    }

    // 4. The watermark covers every upstream.
    let watermark = node.owner.watermark.snapshot();
    assert_eq!(watermark.max_timestamp(), Some(35));
    assert_eq!(watermark.get(&op(1)), Some(15));
    assert_eq!(watermark.get(&op(2)), Some(25));
    assert_eq!(watermark.get(&op(3)), Some(35));
    assert_eq!(node.metrics.tuples_received_count(), 15);
    assert_eq!(node.metrics.tuples_dropped_count(), 0);

    // 5. Closing the upstream channels ends the readers.
    drop(channels);
    readers.into_iter().for_each(|reader| reader.join().unwrap());
}

/// A draining node drops incoming batches without touching its queues or its watermark.
#[test]
fn draining_node_drops_tuples_test() {
    setup_logger(LevelFilter::Info);
    let dropped = Arc::new(AtomicUsize::new(0));
    let handlers = {
        let dropped = Arc::clone(&dropped);
        EventHandlers::new(false).on_drop_tuples(move |event| {
            dropped.fetch_add(event.count, Ordering::SeqCst);
        })
    };
    let (event_bus, event_publisher) = EventBus::start(handlers);

    let node = Node::with_events(
        TopologyContext::new(op(100)),
        DataStructureAdapter::unique(100),
        Some(event_publisher),
    );
    node.owner.set_status(SystemStatus::Draining);
    let (channel, _reader) = node.connect(1);
    send_batch(&channel, 1, 5);

    assert!(wait_until(Duration::from_secs(10), || node.metrics.tuples_dropped_count() == 5));
    assert!(wait_until(Duration::from_secs(5), || dropped.load(Ordering::SeqCst) == 5));
    assert!(node.intake.is_empty());
    assert!(node.owner.watermark.snapshot().is_empty());
    assert_eq!(node.metrics.tuples_received_count(), 5);
    drop(event_bus);
}

/// With one queue per upstream, tuples of a scaled-out replica go to the queue of the operator it was
/// split from, and tuples with no queue are dropped until one is added.
#[test]
fn per_operator_intake_test() {
    setup_logger(LevelFilter::Info);
    let mut topology = TopologyContext::new(op(100));
    topology.set_original_upstream(op(4), op(1));
    let node = Node::new(topology, DataStructureAdapter::per_operator(&[op(1)], 100));

    // 1. Replica op4 of op1 feeds op1's queue.
    let (replica, _replica_reader) = node.connect(4);
    send_batch(&replica, 4, 3);
    assert!(wait_until(Duration::from_secs(10), || node.intake.len() == 3));
    let from_op1 = node.intake.queue_for(op(1)).unwrap();
    assert_eq!(from_op1.len(), 3);
    assert_eq!(node.owner.watermark.snapshot().get(&op(1)), Some(43));
    assert_eq!(node.owner.watermark.snapshot().get(&op(4)), None);

    // 2. op2 has no queue: its batch is dropped.
    let (other, _other_reader) = node.connect(2);
    send_batch(&other, 2, 2);
    assert!(wait_until(Duration::from_secs(10), || node.metrics.tuples_dropped_count() == 2));

    // 3. Once op2 has a queue, its tuples are kept.
    node.intake.add_origin(op(2));
    send_batch(&other, 2, 2);
    assert!(wait_until(Duration::from_secs(10), || node.intake.len() == 5));
    assert_eq!(node.intake.queue_for(op(2)).unwrap().len(), 2);

    // 4. Popping visits both queues.
    let popped: Vec<DataTuple> = (0..5)
        .map(|_| node.intake.pop_timeout(Duration::from_millis(100)).unwrap())
        .collect();
    assert_eq!(timestamps_from(&popped, 4), vec![41, 42, 43]);
    assert_eq!(timestamps_from(&popped, 2), vec![21, 22]);
    assert!(node.intake.pop_timeout(Duration::from_millis(10)).is_none());
}

/// Connections accepted by an acceptor are identified by the IP of their upstream.
#[test]
fn acceptor_test() {
    setup_logger(LevelFilter::Info);
    let mut topology = TopologyContext::new(op(100));
    topology.add_upstream(operator_at(1, 0, 0));
    let node = Node::new(topology, DataStructureAdapter::unique(100));
    let listener = localhost_listener();
    let ctx = Arc::clone(&node.ctx);
    let acceptor = Acceptor::start(listener, move |stream| {
        IncomingDataHandler::spawn(stream, Arc::clone(&ctx));
    });
    let port = acceptor.local_addr().unwrap().port();

    let channel = SyncChannel::deferred(operator_at(100, port, unused_port()), channel_config(4), None);
    for ts in 1..=4 {
        channel.send(TuplePayload::new(vec![Value::Int(1)], ts)).unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || node.intake.len() == 4));
    assert_eq!(node.owner.watermark.snapshot().get(&op(1)), Some(4));
    drop(acceptor);
}

/// Control messages read off an accepted connection reach the processing unit they are addressed to.
#[test]
fn control_reader_test() {
    setup_logger(LevelFilter::Info);
    let owner = Arc::new(RecordingOwner::new());
    let backup_node = simple_unit(Sink, 20, &owner);
    backup_node.register_managed_state(op(5));

    let handler = Arc::clone(&backup_node) as Arc<dyn ControlHandler>;
    let acceptor = Acceptor::start(localhost_listener(), move |stream| {
        IncomingControlHandler::spawn(stream, Arc::clone(&handler));
    });
    let control_port = acceptor.local_addr().unwrap().port();

    let channel = SyncChannel::deferred(operator_at(20, unused_port(), control_port), channel_config(1), None);
    let backup = BackupOperatorState {
        op_id: op(5),
        state: vec![7; 16],
        output_buffers: Vec::new(),
        state_tag: StateTag::new("pair"),
    };
    channel
        .send_control(&ControlTuple::BackupOperatorState(backup.clone()))
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        backup_node.backup_store().latest_backup(op(5)).is_some()
    }));
    assert_eq!(backup_node.backup_store().latest_backup(op(5)), Some(backup));
    drop(acceptor);
}
