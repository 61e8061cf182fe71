/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-defined parameters of a node's processing units and channels.
//!
//! Nodes read their parameters from property files. Loading those files is not the business of this
//! crate: the loader hands the resulting key/value pairs to [`Configuration::from_properties`], or builds a
//! [`Configuration`] directly with [`Configuration::builder`].
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use dataflow_rs::config::Configuration;
//!
//! let config = Configuration::builder()
//!     .batch_limit(100)
//!     .socket_send_buffer_size(64 * 1024)
//!     .checkpoint_interval(Duration::from_secs(5))
//!     .build();
//! assert_eq!(config.control_socket_wait, Duration::from_secs(30));
//! ```

use std::collections::BTreeMap;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use typed_builder::TypedBuilder;

pub const BATCH_LIMIT_KEY: &str = "batchLimit";
pub const SOCKET_BUFFER_SIZE_KEY: &str = "socketBufferSize";
pub const CHECKPOINT_INTERVAL_KEY: &str = "checkpointInterval";
pub const MAX_WORKER_THREADS_KEY: &str = "maxWorkerThreads";
pub const CHUNK_SIZE_KEY: &str = "chunkSize";
pub const CONTROL_SOCKET_WAIT_KEY: &str = "controlSocketWait";
pub const ACK_INTERVAL_KEY: &str = "ackInterval";
pub const IDLE_FLUSH_INTERVAL_KEY: &str = "idleFlushInterval";
pub const INPUT_QUEUE_CAPACITY_KEY: &str = "inputQueueCapacity";
pub const OUTPUT_BUFFER_CAPACITY_KEY: &str = "outputBufferCapacity";
pub const LOG_EVENTS_KEY: &str = "logEvents";

/// Stores the user-defined parameters of a node, that is:
/// 1. The batch limit: the number of tuples accumulated per channel before a batch is written.
/// 2. The send buffer size set on every (re)opened data socket.
/// 3. The checkpoint interval of the hosted operators' states.
/// 4. The cap on the size of the worker pool in multi-worker mode.
/// 5. The number of streaming units per chunk in large-state checkpoints.
/// 6. The bounded wait of callers blocking on a control socket.
/// 7. The interval at which the ACK worker checks the incoming watermark.
/// 8. The interval at which non-empty batches are flushed when no tuple filled them.
/// 9. The capacity of the input queues.
/// 10. The number of tuples kept per downstream for upstream backup.
/// 11. The "Log Events" flag, if set to "true" then events are logged.
///
/// ## Durations
///
/// Durations given as properties are integers in milliseconds.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.batch_limit(...)`
    - `.socket_send_buffer_size(...)`
    - `.checkpoint_interval(...)`

    Optional:
    - `.max_worker_threads(...)`
    - `.chunk_size(...)`
    - `.control_socket_wait(...)`
    - `.ack_interval(...)`
    - `.idle_flush_interval(...)`
    - `.input_queue_capacity(...)`
    - `.output_buffer_capacity(...)`
    - `.log_events(...)`
"
))]
pub struct Configuration {
    #[builder(setter(doc = "Set the number of tuples per batch. Required."))]
    pub batch_limit: usize,
    #[builder(setter(doc = "Set the send buffer size of data sockets, in bytes. Required."))]
    pub socket_send_buffer_size: usize,
    #[builder(setter(doc = "Set the interval between two checkpoints of an operator's state. Required."))]
    pub checkpoint_interval: Duration,
    #[builder(default = DEFAULT_MAX_WORKER_THREADS, setter(doc = "Set the maximum size of the worker pool. Optional."))]
    pub max_worker_threads: usize,
    #[builder(default = DEFAULT_CHUNK_SIZE, setter(doc = "Set the number of streaming units per state chunk. Optional."))]
    pub chunk_size: usize,
    #[builder(default = DEFAULT_CONTROL_SOCKET_WAIT, setter(doc = "Set how long getters wait for a control socket before waiting again. Optional."))]
    pub control_socket_wait: Duration,
    #[builder(default = DEFAULT_ACK_INTERVAL, setter(doc = "Set the interval of the ACK worker. Optional."))]
    pub ack_interval: Duration,
    #[builder(default = Some(DEFAULT_IDLE_FLUSH_INTERVAL), setter(doc = "Set the idle flush interval, or `None` to only flush full batches. Optional."))]
    pub idle_flush_interval: Option<Duration>,
    #[builder(default = DEFAULT_INPUT_QUEUE_CAPACITY, setter(doc = "Set the capacity of input queues, in tuples. Optional."))]
    pub input_queue_capacity: usize,
    #[builder(default = DEFAULT_OUTPUT_BUFFER_CAPACITY, setter(doc = "Set the number of unacknowledged tuples kept per downstream. Optional."))]
    pub output_buffer_capacity: usize,
    #[builder(default = false, setter(doc = "Enable logging of events? Optional."))]
    pub log_events: bool,
}

pub const DEFAULT_MAX_WORKER_THREADS: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CONTROL_SOCKET_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_ACK_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_IDLE_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_INPUT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_OUTPUT_BUFFER_CAPACITY: usize = 100_000;

impl Configuration {
    /// Build a configuration from the key/value pairs of a node's property file.
    ///
    /// Fails if `batchLimit`, `socketBufferSize`, or `checkpointInterval` is missing, or if any known key
    /// has a value that does not parse. Unknown keys are ignored.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Configuration, ConfigError> {
        let idle_flush_ms: u64 = optional(properties, IDLE_FLUSH_INTERVAL_KEY)?
            .unwrap_or(DEFAULT_IDLE_FLUSH_INTERVAL.as_millis() as u64);

        Ok(Configuration {
            batch_limit: required(properties, BATCH_LIMIT_KEY)?,
            socket_send_buffer_size: required(properties, SOCKET_BUFFER_SIZE_KEY)?,
            checkpoint_interval: Duration::from_millis(required(properties, CHECKPOINT_INTERVAL_KEY)?),
            max_worker_threads: optional(properties, MAX_WORKER_THREADS_KEY)?
                .unwrap_or(DEFAULT_MAX_WORKER_THREADS),
            chunk_size: optional(properties, CHUNK_SIZE_KEY)?.unwrap_or(DEFAULT_CHUNK_SIZE),
            control_socket_wait: optional(properties, CONTROL_SOCKET_WAIT_KEY)?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONTROL_SOCKET_WAIT),
            ack_interval: optional(properties, ACK_INTERVAL_KEY)?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_ACK_INTERVAL),
            // 0 disables idle flushing.
            idle_flush_interval: (idle_flush_ms > 0).then(|| Duration::from_millis(idle_flush_ms)),
            input_queue_capacity: optional(properties, INPUT_QUEUE_CAPACITY_KEY)?
                .unwrap_or(DEFAULT_INPUT_QUEUE_CAPACITY),
            output_buffer_capacity: optional(properties, OUTPUT_BUFFER_CAPACITY_KEY)?
                .unwrap_or(DEFAULT_OUTPUT_BUFFER_CAPACITY),
            log_events: optional(properties, LOG_EVENTS_KEY)?.unwrap_or(false),
        })
    }

    /// Number of worker threads used in multi-worker mode on this machine.
    pub fn worker_pool_size(&self) -> usize {
        let parallelism = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        worker_pool_size(parallelism, self.max_worker_threads)
    }
}

/// `max(parallelism - 2, 1)`, capped to `cap`. Two cores are left to the readers and the checkpoint
/// thread.
pub fn worker_pool_size(parallelism: usize, cap: usize) -> usize {
    parallelism.saturating_sub(2).max(1).min(cap.max(1))
}

fn required<T: FromStr>(properties: &BTreeMap<String, String>, key: &'static str) -> Result<T, ConfigError> {
    optional(properties, key)?.ok_or(ConfigError::MissingKey(key))
}

fn optional<T: FromStr>(properties: &BTreeMap<String, String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    match properties.get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key,
                value: value.clone(),
            }),
    }
}

/// Parameters of every channel opened by a node.
#[derive(Clone, Debug)]
pub struct ChannelConfiguration {
    pub batch_limit: usize,
    pub socket_send_buffer_size: usize,
    pub control_socket_wait: Duration,
    pub output_buffer_capacity: usize,
}

/// Parameters of a processing unit and its worker threads.
#[derive(Clone, Debug)]
pub struct ProcessingConfiguration {
    pub checkpoint_interval: Duration,
    pub worker_threads: usize,
    pub chunk_size: usize,
    pub ack_interval: Duration,
    pub idle_flush_interval: Option<Duration>,
    pub input_queue_capacity: usize,
}

impl Into<(ChannelConfiguration, ProcessingConfiguration)> for Configuration {
    fn into(self) -> (ChannelConfiguration, ProcessingConfiguration) {
        let worker_threads = self.worker_pool_size();
        let channel_config = ChannelConfiguration {
            batch_limit: self.batch_limit,
            socket_send_buffer_size: self.socket_send_buffer_size,
            control_socket_wait: self.control_socket_wait,
            output_buffer_capacity: self.output_buffer_capacity,
        };
        let processing_config = ProcessingConfiguration {
            checkpoint_interval: self.checkpoint_interval,
            worker_threads,
            chunk_size: self.chunk_size,
            ack_interval: self.ack_interval,
            idle_flush_interval: self.idle_flush_interval,
            input_queue_capacity: self.input_queue_capacity,
        };
        (channel_config, processing_config)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A required key is absent.
    MissingKey(&'static str),

    /// A key is present but its value does not parse.
    InvalidValue { key: &'static str, value: String },
}
