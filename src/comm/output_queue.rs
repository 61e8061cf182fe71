/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The node-wide output queue, through which processing units send tuples on synchronous channels.
//!
//! The output queue knows every synchronous channel opened by the node, so that it can stop sending
//! during a reconfiguration and flush partially filled batches when the data path goes idle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::types::{OperatorId, TuplePayload};

use super::channel::SyncChannel;
use super::{read, write, ChannelError};

type Channels = Arc<RwLock<BTreeMap<OperatorId, Arc<SyncChannel>>>>;

#[derive(Default)]
pub struct OutputQueue {
    channels: Channels,
    stopped: AtomicBool,
}

impl OutputQueue {
    pub fn new() -> OutputQueue {
        Self::default()
    }

    /// Make `channel` known to the idle flusher.
    pub fn register(&self, channel: Arc<SyncChannel>) {
        write(&self.channels).insert(channel.op_id(), channel);
    }

    pub fn deregister(&self, op_id: OperatorId) -> Option<Arc<SyncChannel>> {
        write(&self.channels).remove(&op_id)
    }

    pub fn channel(&self, op_id: OperatorId) -> Option<Arc<SyncChannel>> {
        read(&self.channels).get(&op_id).cloned()
    }

    /// Send `tuple` on `channel`. While the queue is stopped, tuples are only kept in the channel's
    /// output buffer.
    pub fn send_to_downstream(&self, tuple: TuplePayload, channel: &SyncChannel) -> Result<(), ChannelError> {
        if self.is_stopped() && !channel.is_stopped() {
            stop_channel(channel);
        }
        channel.send(tuple)
    }

    /// Stop writing on every channel. Tuples sent from now on are kept in the channels' output buffers
    /// until [`start`](Self::start).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        read(&self.channels)
            .values()
            .for_each(|channel| stop_channel(channel));
    }

    /// Resume writing on every channel, replaying the tuples buffered while stopped. Returns how many
    /// tuples were replayed.
    pub fn start(&self) -> usize {
        self.stopped.store(false, Ordering::SeqCst);
        let channels: Vec<Arc<SyncChannel>> = read(&self.channels).values().cloned().collect();
        let mut replayed = 0;
        for channel in channels {
            if !channel.is_stopped() {
                continue;
            }
            match channel.resume() {
                Ok(count) => replayed += count,
                Err(err) => log::warn!("Replaying to {:?} failed: {:?}", channel.op_id(), err),
            }
        }
        replayed
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flush every registered channel with a non-empty batch. Returns how many were flushed.
    pub fn flush_all(&self) -> usize {
        flush_channels(&self.channels)
    }

    /// Start a thread flushing non-empty batches every `interval`.
    pub fn start_idle_flusher(&self, interval: Duration) -> IdleFlusher {
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let thread = start_idle_flusher(Arc::clone(&self.channels), interval, shutdown_receiver);
        IdleFlusher {
            thread: Some(thread),
            shutdown,
        }
    }
}

// Tuples newer than the last one batched are the ones to replay.
fn stop_channel(channel: &SyncChannel) {
    channel.set_reconf_ts(channel.last_ts());
    channel.set_stop(true);
}

fn flush_channels(channels: &Channels) -> usize {
    let channels: Vec<Arc<SyncChannel>> = read(channels).values().cloned().collect();
    let mut flushed = 0;
    for channel in channels.iter().filter(|channel| !channel.is_stopped()) {
        match channel.flush() {
            Ok(true) => flushed += 1,
            Ok(false) => (),
            Err(err) => log::debug!("Idle flush to {:?} failed: {:?}", channel.op_id(), err),
        }
    }
    flushed
}

fn start_idle_flusher(channels: Channels, interval: Duration, shutdown_signal: Receiver<()>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                flush_channels(&channels);
            }
        }
    })
}

/// Handle to the idle flusher thread. When this value is dropped, the thread is shut down.
pub struct IdleFlusher {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl Drop for IdleFlusher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
