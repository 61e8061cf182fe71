use std::sync::Arc;
use std::time::Duration;

use dataflow_rs::config::Configuration;
use dataflow_rs::metrics::{CounterMetrics, MetricsSink};
use dataflow_rs::processing::{Operator, Owner, ProcessingUnit, ProcessingUnitSpec, TopologyContext};
use dataflow_rs::state::StateDecoders;
use dataflow_rs::types::{OperatorId, StateTag};

use super::operators::{PairState, MAP_TAG, PAIR_TAG};
use super::owner::RecordingOwner;

pub(crate) fn test_configuration() -> Configuration {
    Configuration::builder()
        .batch_limit(15)
        .socket_send_buffer_size(64 * 1024)
        .checkpoint_interval(Duration::from_millis(50))
        .chunk_size(10)
        .ack_interval(Duration::from_millis(20))
        .build()
}

pub(crate) fn test_decoders() -> StateDecoders {
    let mut decoders = StateDecoders::new();
    decoders.register(StateTag::new(PAIR_TAG), PairState::decode);
    decoders.register(
        StateTag::new(MAP_TAG),
        dataflow_rs::state::VersionedMap::<i64>::decode,
    );
    decoders
}

/// A processing unit hosting `operator`, wired to `owner` and recording its metrics in `metrics`.
pub(crate) fn build_unit(
    operator: impl Operator,
    topology: TopologyContext,
    owner: &Arc<RecordingOwner>,
    metrics: &Arc<CounterMetrics>,
    multi_core: bool,
) -> Arc<ProcessingUnit> {
    ProcessingUnitSpec::builder()
        .operator(operator)
        .topology(topology)
        .owner(Arc::clone(owner) as Arc<dyn Owner>)
        .configuration(test_configuration())
        .multi_core(multi_core)
        .metrics(Arc::clone(metrics) as Arc<dyn MetricsSink>)
        .decoders(test_decoders())
        .build()
        .into_unit()
}

/// A single-worker unit for `op_id`, with no neighbours.
pub(crate) fn simple_unit(
    operator: impl Operator,
    op_id: u32,
    owner: &Arc<RecordingOwner>,
) -> Arc<ProcessingUnit> {
    build_unit(
        operator,
        TopologyContext::new(OperatorId::new(op_id)),
        owner,
        &Arc::new(CounterMetrics::new()),
        false,
    )
}
