/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A channel whose writes happen on a dedicated writer thread.
//!
//! [`deliver`](AsyncChannel::deliver) only enqueues the tuple, so the emitting worker never waits on the
//! network. The writer thread drains the queue into an inner [`SyncChannel`], which does the batching and
//! reconnecting.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::types::TuplePayload;

use super::channel::SyncChannel;
use super::{lock, ChannelError};

pub struct AsyncChannel {
    inner: Arc<SyncChannel>,
    to_writer: Mutex<Option<SyncSender<TuplePayload>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncChannel {
    /// Start a writer thread for `inner`, fed by a queue of `queue_capacity` tuples.
    pub fn new(inner: Arc<SyncChannel>, queue_capacity: usize) -> AsyncChannel {
        let (to_writer, from_main) = mpsc::sync_channel(queue_capacity.max(1));
        let writer = Self::writer(Arc::clone(&inner), from_main);
        AsyncChannel {
            inner,
            to_writer: Mutex::new(Some(to_writer)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn inner(&self) -> &Arc<SyncChannel> {
        &self.inner
    }

    /// Enqueue `tuple` for the writer thread. Blocks only while the queue is full.
    pub fn deliver(&self, tuple: TuplePayload) -> Result<(), ChannelError> {
        let to_writer = match lock(&self.to_writer).as_ref() {
            Some(to_writer) => to_writer.clone(),
            None => return Err(ChannelError::Cancelled),
        };
        match to_writer.try_send(tuple) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(tuple)) => to_writer.send(tuple).map_err(|_| ChannelError::Cancelled),
            Err(TrySendError::Disconnected(_)) => Err(ChannelError::Cancelled),
        }
    }

    /// Stop accepting tuples and wait for the writer thread to drain the queue.
    pub fn shutdown(&self) {
        lock(&self.to_writer).take();
        if let Some(writer) = lock(&self.writer).take() {
            let _ = writer.join();
        }
    }

    /// Close the inner channel, interrupting a writer stuck reconnecting, then stop the writer thread.
    /// Tuples still queued are discarded.
    pub fn abort(&self) {
        self.inner.close();
        self.shutdown();
    }

    // Continuously receives tuples from the main threads and sends them on `channel`. Exits once every
    // sender is gone or the channel was cancelled.
    fn writer(channel: Arc<SyncChannel>, from_main: Receiver<TuplePayload>) -> JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(tuple) = from_main.recv() {
                if let Err(err) = channel.send(tuple) {
                    log::warn!("Writer thread of {:?} stopping: {:?}", channel.op_id(), err);
                    return;
                }
            }
            if let Err(err) = channel.flush() {
                log::debug!("Final flush to {:?} failed: {:?}", channel.op_id(), err);
            }
        })
    }
}

impl Drop for AsyncChannel {
    fn drop(&mut self) {
        // Queued tuples are written before the inner channel is closed. Call `abort` first to discard
        // them instead.
        self.shutdown();
        self.inner.close();
    }
}
