/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A node-local execution and fault-tolerance engine for distributed stream processing.
//!
//! Operators deployed on a node are each hosted by a [processing unit](processing::ProcessingUnit),
//! which runs the operator over the tuples arriving from upstream, routes what it emits downstream, and
//! periodically checkpoints its [state](state::State) to a backup node. Tuples and control messages move
//! between nodes over batching, self-reconnecting [channels](comm).
//!
//! ## Wiring a node
//!
//! ```ignore
//! let configuration = Configuration::from_properties(&properties)?;
//! let (event_bus, event_publisher) = EventBus::start(EventHandlers::new(configuration.log_events));
//!
//! let unit = ProcessingUnitSpec::builder()
//!     .operator(my_operator)
//!     .topology(topology)
//!     .owner(node)
//!     .configuration(configuration)
//!     .event_publisher(Some(event_publisher))
//!     .build()
//!     .into_unit();
//!
//! unit.new_operator_instantiation(Some(initial_state))?;
//! unit.init_operator();
//! unit.set_op_ready(true);
//!
//! let workers = unit.start_data_processing(intake);
//! let backup_worker = StateBackupWorker::start(unit.clone());
//! let ack_worker = AckWorker::start(unit.clone());
//! ```
//!
//! Readers feeding `intake` are started per upstream connection, see [`comm::reader`].

pub mod comm;

pub mod config;

pub mod event_bus;

pub mod events;

pub(crate) mod logging;

pub mod messages;

pub mod metrics;

pub mod processing;

pub mod state;

pub mod types;
