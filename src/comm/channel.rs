/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Point-to-point, batching, self-reconnecting channel to one remote operator.
//!
//! ## Sockets
//!
//! A [`SyncChannel`] owns up to three sockets to its target:
//! 1. The **data socket**, carrying [`BatchTuplePayload`] frames.
//! 2. The **control socket**, carrying [`ControlTuple`] frames. It is (re)established asynchronously.
//! 3. The optional **blind socket**, carrying the chunks of streamed states so that large transfers do
//!    not queue behind control messages. Without a blind port, chunks go over the control socket.
//!
//! ## State machine
//!
//! ```text
//! Deferred ──first use──▶ Connected ◀──────────┐
//!                            │                 │
//!                        I/O failure        reconnected
//!                            ▼                 │
//!                       Reconnecting ──────────┘
//!                            │
//!                      cancellation / close
//!                            ▼
//!                          Closed
//! ```
//!
//! A channel created with [`SyncChannel::deferred`] only knows its target's address and connects on first
//! use. A channel created with [`SyncChannel::from_streams`] starts out connected.
//!
//! ## Reconnection
//!
//! Write failures never cross the channel boundary: the data socket is closed and reopened with the
//! channel's [`RetryPolicy`] (retry forever by default) and the frame is written again, so delivery is
//! at-least-once. Reopening the control socket runs on its own thread, and at most one such thread is in
//! flight per channel. Callers needing the control socket wait for it, [`ChannelConfiguration::control_socket_wait`]
//! at a time.
//!
//! ## Batching
//!
//! Tuples are accumulated into a [`BatchAccumulator`] of capacity [`ChannelConfiguration::batch_limit`]. A
//! batch is written as soon as it is full, or when [`flush`](SyncChannel::flush) is called by the
//! [idle flusher](super::output_queue::IdleFlusher).

use std::io::{self, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use socket2::SockRef;

use crate::config::ChannelConfiguration;
use crate::events::*;
use crate::messages::{ControlTuple, OutputBufferSnapshot};
use crate::processing::context::OperatorStaticInformation;
use crate::types::{BatchTuplePayload, OperatorId, TuplePayload};

use super::codec::encode_frame;
use super::output_buffer::OutputBuffer;
use super::retry::{CancellationToken, RetryError, RetryPolicy};
use super::{lock, read, write, ChannelError};

/// Upper bound of a single connect attempt, so that cancellation is noticed even when the peer's host
/// does not answer at all.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed with an address only. Nothing has been connected yet.
    Deferred,
    Connected,
    /// The data socket failed and is being reopened.
    Reconnecting,
    Closed,
}

/// Outgoing batch of one channel, bounded by the batch limit.
#[derive(Debug)]
pub struct BatchAccumulator {
    limit: usize,
    remaining: usize,
    batch: BatchTuplePayload,
}

impl BatchAccumulator {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            remaining: limit,
            batch: BatchTuplePayload::new(),
        }
    }

    /// Append `tuple`. Returns the batch if this filled it, in which case the accumulator is cleared
    /// and its remaining capacity reset to the limit.
    pub fn push(&mut self, tuple: TuplePayload) -> Option<BatchTuplePayload> {
        self.batch.add_tuple(tuple);
        self.remaining -= 1;
        if self.remaining == 0 {
            Some(self.take())
        } else {
            None
        }
    }

    /// Take the current batch, full or not, and reset the accumulator. The next batch starts from this
    /// batch's timestamp, so the timestamps carried by successive batches never decrease.
    pub fn take(&mut self) -> BatchTuplePayload {
        self.remaining = self.limit;
        let next = BatchTuplePayload {
            batch: Vec::new(),
            last_timestamp: self.batch.last_timestamp,
        };
        mem::replace(&mut self.batch, next)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Highest timestamp appended to this accumulator so far.
    pub fn last_timestamp(&self) -> u64 {
        self.batch.last_timestamp
    }
}

struct DataLink {
    stream: Option<TcpStream>,
    batch: BatchAccumulator,
}

pub struct SyncChannel {
    target: Arc<RwLock<OperatorStaticInformation>>,
    config: ChannelConfiguration,
    retry_policy: RetryPolicy,
    cancellation: CancellationToken,
    state: Mutex<ChannelState>,
    data: Mutex<DataLink>,
    control: Arc<ControlLink>,
    // Serializes writers of the control socket, whose handles are clones of each other.
    control_write: Mutex<()>,
    blind: Mutex<Option<TcpStream>>,
    output_buffer: Mutex<OutputBuffer>,
    stopped: AtomicBool,
    replaying: AtomicBool,
    reconf_ts: AtomicU64,
    last_ts: AtomicU64,
    event_publisher: Option<Sender<Event>>,
}

impl SyncChannel {
    /// Create a channel that connects to `target` lazily, on first use.
    pub fn deferred(
        target: OperatorStaticInformation,
        config: ChannelConfiguration,
        event_publisher: Option<Sender<Event>>,
    ) -> SyncChannel {
        Self::with_links(target, config, event_publisher, ChannelState::Deferred, None, None)
    }

    /// Create a channel over already connected sockets.
    pub fn from_streams(
        target: OperatorStaticInformation,
        data_stream: TcpStream,
        control_stream: Option<TcpStream>,
        config: ChannelConfiguration,
        event_publisher: Option<Sender<Event>>,
    ) -> SyncChannel {
        if let Err(err) = configure_data_stream(&data_stream, config.socket_send_buffer_size) {
            log::warn!("Failed to configure data socket to {:?}: {:?}", target.op_id, err);
        }
        Self::with_links(
            target,
            config,
            event_publisher,
            ChannelState::Connected,
            Some(data_stream),
            control_stream,
        )
    }

    fn with_links(
        target: OperatorStaticInformation,
        config: ChannelConfiguration,
        event_publisher: Option<Sender<Event>>,
        state: ChannelState,
        data_stream: Option<TcpStream>,
        control_stream: Option<TcpStream>,
    ) -> SyncChannel {
        let downstream = target.op_id;
        let target = Arc::new(RwLock::new(target));
        let cancellation = CancellationToken::new();
        let retry_policy = RetryPolicy::default();
        SyncChannel {
            control: Arc::new(ControlLink {
                target: Arc::clone(&target),
                socket: Mutex::new(control_stream),
                available: Condvar::new(),
                reconnecting: AtomicBool::new(false),
                retry_policy,
                cancellation: cancellation.clone(),
                event_publisher: event_publisher.clone(),
            }),
            target,
            data: Mutex::new(DataLink {
                stream: data_stream,
                batch: BatchAccumulator::new(config.batch_limit),
            }),
            output_buffer: Mutex::new(OutputBuffer::new(downstream, config.output_buffer_capacity)),
            config,
            retry_policy,
            cancellation,
            state: Mutex::new(state),
            control_write: Mutex::new(()),
            blind: Mutex::new(None),
            stopped: AtomicBool::new(false),
            replaying: AtomicBool::new(false),
            reconf_ts: AtomicU64::new(0),
            last_ts: AtomicU64::new(0),
            event_publisher,
        }
    }

    /// Replace the policy used to reopen this channel's sockets. Must be called before the channel is
    /// shared.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> SyncChannel {
        self.retry_policy = retry_policy;
        if let Some(control) = Arc::get_mut(&mut self.control) {
            control.retry_policy = retry_policy;
        }
        self
    }

    pub fn op_id(&self) -> OperatorId {
        read(&self.target).op_id
    }

    pub fn target(&self) -> OperatorStaticInformation {
        read(&self.target).clone()
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ChannelState) {
        let mut current = lock(&self.state);
        // Closed is final.
        if *current != ChannelState::Closed {
            *current = state;
        }
    }

    /// A token that, once cancelled, interrupts every reconnect loop of this channel.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &ChannelConfiguration {
        &self.config
    }

    /* ↓↓↓ Data plane ↓↓↓ */

    /// Send `tuple` to the target: buffer it for upstream backup, append it to the outgoing batch, and
    /// write the batch if this filled it.
    ///
    /// While the channel is [stopped](Self::set_stop), the tuple is only buffered, to be
    /// [replayed](Self::replay) later.
    pub fn send(&self, tuple: TuplePayload) -> Result<(), ChannelError> {
        // Lock order: output buffer, then data link.
        let mut output_buffer = lock(&self.output_buffer);
        output_buffer.record(tuple.clone());
        if self.is_stopped() {
            return Ok(());
        }
        let mut data = lock(&self.data);
        drop(output_buffer);
        self.batch_and_write(&mut data, tuple)
    }

    fn batch_and_write(&self, data: &mut DataLink, tuple: TuplePayload) -> Result<(), ChannelError> {
        self.last_ts.fetch_max(tuple.timestamp, Ordering::SeqCst);
        match data.batch.push(tuple) {
            Some(batch) => self.write_batch(data, batch),
            None => Ok(()),
        }
    }

    /// Append `tuple` to the outgoing batch without writing anything. Returns the batch if this filled
    /// it; the caller is then responsible for it.
    pub fn add_data_to_batch(&self, tuple: TuplePayload) -> Option<BatchTuplePayload> {
        self.last_ts.fetch_max(tuple.timestamp, Ordering::SeqCst);
        lock(&self.data).batch.push(tuple)
    }

    /// Discard the outgoing batch and reset its capacity.
    pub fn clean_batch(&self) {
        lock(&self.data).batch.take();
    }

    /// Remaining capacity of the outgoing batch.
    pub fn batch_remaining(&self) -> usize {
        lock(&self.data).batch.remaining()
    }

    /// Write the outgoing batch if it is not empty. Returns whether something was written.
    pub fn flush(&self) -> Result<bool, ChannelError> {
        let mut data = lock(&self.data);
        self.flush_link(&mut data)
    }

    fn flush_link(&self, data: &mut DataLink) -> Result<bool, ChannelError> {
        if data.batch.is_empty() {
            return Ok(false);
        }
        let batch = data.batch.take();
        self.write_batch(data, batch)?;
        Ok(true)
    }

    fn write_batch(&self, data: &mut DataLink, batch: BatchTuplePayload) -> Result<(), ChannelError> {
        let frame = match encode_frame(&batch) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("Dropping batch of {} tuples to {:?}, cannot encode it: {:?}", batch.len(), self.op_id(), err);
                return Ok(());
            }
        };

        loop {
            if data.stream.is_none() {
                self.reopen_data_link(data)?;
            }
            let Some(stream) = data.stream.as_mut() else { continue };
            match stream.write_all(&frame).and_then(|()| stream.flush()) {
                Ok(()) => {
                    Event::publish(
                        &self.event_publisher,
                        Event::FlushBatch(FlushBatchEvent {
                            timestamp: SystemTime::now(),
                            target: self.op_id(),
                            tuples: batch.len(),
                            last_timestamp: batch.last_timestamp,
                        }),
                    );
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("Writing a batch to {:?} failed, reopening the data socket: {:?}", self.op_id(), err);
                    if let Some(stale) = data.stream.take() {
                        let _ = stale.shutdown(Shutdown::Both);
                    }
                }
            }
        }
    }

    /// Close the data socket and open a fresh one to the target, retrying according to this channel's
    /// retry policy.
    pub fn reopen_downstream_data_socket(&self) -> Result<(), ChannelError> {
        let mut data = lock(&self.data);
        self.reopen_data_link(&mut data)
    }

    fn reopen_data_link(&self, data: &mut DataLink) -> Result<(), ChannelError> {
        if let Some(stale) = data.stream.take() {
            let _ = stale.shutdown(Shutdown::Both);
        }
        if self.state() != ChannelState::Deferred {
            self.set_state(ChannelState::Reconnecting);
        }

        let send_buffer_size = self.config.socket_send_buffer_size;
        let result = self.retry_policy.run(&self.cancellation, "Opening data socket", || {
            let addr = read(&self.target).data_addr();
            let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
            configure_data_stream(&stream, send_buffer_size)?;
            Ok::<_, io::Error>((stream, addr))
        });

        match result {
            Ok(((stream, addr), attempts)) => {
                data.stream = Some(stream);
                self.set_state(ChannelState::Connected);
                Event::publish(
                    &self.event_publisher,
                    Event::ReconnectDataLink(ReconnectDataLinkEvent {
                        timestamp: SystemTime::now(),
                        target: addr,
                        attempts,
                    }),
                );
                Ok(())
            }
            Err(RetryError::Cancelled { .. }) => {
                self.set_state(ChannelState::Closed);
                Err(ChannelError::Cancelled)
            }
            Err(RetryError::Exhausted { attempts }) => Err(ChannelError::Unreachable { attempts }),
        }
    }

    /* ↓↓↓ Control plane ↓↓↓ */

    /// Get a handle to the control socket, waiting until one is available.
    ///
    /// The wait is bounded by [`ChannelConfiguration::control_socket_wait`]; when it elapses the wait is
    /// logged and resumed. Only cancellation ends it without a socket.
    pub fn control_socket(&self) -> Result<TcpStream, ChannelError> {
        loop {
            if let Some(socket) = self.control_socket_timeout(self.config.control_socket_wait) {
                return Ok(socket);
            }
            if self.cancellation.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            log::warn!(
                "No control socket to {:?} after {:?}, still waiting",
                self.op_id(),
                self.config.control_socket_wait
            );
        }
    }

    /// Get a handle to the control socket, waiting at most `wait`.
    pub fn control_socket_timeout(&self, wait: Duration) -> Option<TcpStream> {
        if !self.control.is_connected() {
            self.control.reconnect_async();
        }
        self.control.wait_for_socket(wait)
    }

    /// Reopen the control socket on a dedicated thread. Returns `false`, doing nothing, if a reopen is
    /// already in flight.
    pub fn reopen_control_socket(&self) -> bool {
        self.control.reconnect_async()
    }

    /// Write `msg` on the control socket, reopening it as many times as needed.
    pub fn send_control(&self, msg: &ControlTuple) -> Result<(), ChannelError> {
        let frame = encode_frame(msg).map_err(ChannelError::Encoding)?;
        let _write_guard = lock(&self.control_write);
        loop {
            let mut socket = self.control_socket()?;
            match socket.write_all(&frame).and_then(|()| socket.flush()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!("Writing to the control socket of {:?} failed: {:?}", self.op_id(), err);
                    self.control.invalidate();
                    self.control.reconnect_async();
                }
            }
        }
    }

    /// Write `msg` on the blind socket, or on the control socket if the target has no blind port.
    pub fn send_blind(&self, msg: &ControlTuple) -> Result<(), ChannelError> {
        if read(&self.target).blind_addr().is_none() {
            return self.send_control(msg);
        }

        let frame = encode_frame(msg).map_err(ChannelError::Encoding)?;
        let mut blind = lock(&self.blind);
        loop {
            if blind.is_none() {
                *blind = Some(self.open_blind_socket()?);
            }
            let Some(socket) = blind.as_mut() else { continue };
            match socket.write_all(&frame).and_then(|()| socket.flush()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!("Writing to the blind socket of {:?} failed: {:?}", self.op_id(), err);
                    if let Some(stale) = blind.take() {
                        let _ = stale.shutdown(Shutdown::Both);
                    }
                }
            }
        }
    }

    /// Close the blind socket and open a fresh one.
    pub fn reopen_blind_socket(&self) -> Result<(), ChannelError> {
        let mut blind = lock(&self.blind);
        if let Some(stale) = blind.take() {
            let _ = stale.shutdown(Shutdown::Both);
        }
        *blind = Some(self.open_blind_socket()?);
        Ok(())
    }

    fn open_blind_socket(&self) -> Result<TcpStream, ChannelError> {
        let result = self.retry_policy.run(&self.cancellation, "Opening blind socket", || {
            match read(&self.target).blind_addr() {
                Some(addr) => TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "target has no blind port")),
            }
        });
        match result {
            Ok((stream, _)) => Ok(stream),
            Err(RetryError::Cancelled { .. }) => Err(ChannelError::Cancelled),
            Err(RetryError::Exhausted { attempts }) => Err(ChannelError::Unreachable { attempts }),
        }
    }

    /* ↓↓↓ Upstream backup and reconfiguration ↓↓↓ */

    /// Stop (`true`) or resume (`false`) writing tuples. Tuples sent while stopped are only buffered.
    pub fn set_stop(&self, stop: bool) {
        self.stopped.store(stop, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    /// Set the timestamp from which tuples are replayed after a reconfiguration.
    pub fn set_reconf_ts(&self, ts: u64) {
        self.reconf_ts.store(ts, Ordering::SeqCst)
    }

    pub fn reconf_ts(&self) -> u64 {
        self.reconf_ts.load(Ordering::SeqCst)
    }

    /// Highest timestamp appended to an outgoing batch so far.
    pub fn last_ts(&self) -> u64 {
        self.last_ts.load(Ordering::SeqCst)
    }

    /// Resend every buffered tuple newer than the reconfiguration timestamp, then flush. Returns how many
    /// tuples were resent.
    pub fn replay(&self) -> Result<usize, ChannelError> {
        let output_buffer = lock(&self.output_buffer);
        let tuples = output_buffer.tuples_after(self.reconf_ts());
        let mut data = lock(&self.data);
        drop(output_buffer);
        self.replay_tuples(&mut data, tuples)
    }

    /// Clear the stop flag and replay the tuples buffered while stopped. Tuples sent concurrently are
    /// batched after the replayed ones. Returns how many tuples were resent.
    pub fn resume(&self) -> Result<usize, ChannelError> {
        let output_buffer = lock(&self.output_buffer);
        let tuples = output_buffer.tuples_after(self.reconf_ts());
        let mut data = lock(&self.data);
        self.set_stop(false);
        drop(output_buffer);
        self.replay_tuples(&mut data, tuples)
    }

    fn replay_tuples(&self, data: &mut DataLink, tuples: Vec<TuplePayload>) -> Result<usize, ChannelError> {
        let count = tuples.len();
        self.replaying.store(true, Ordering::SeqCst);
        let result = tuples
            .into_iter()
            .try_for_each(|tuple| self.batch_and_write(data, tuple))
            .and_then(|()| self.flush_link(data).map(|_| ()));
        self.replaying.store(false, Ordering::SeqCst);
        result.map(|()| count)
    }

    /// Discard buffered tuples acknowledged by the target.
    pub fn trim_output_buffer(&self, acked_ts: u64) -> usize {
        lock(&self.output_buffer).trim(acked_ts)
    }

    pub fn output_buffer_snapshot(&self) -> OutputBufferSnapshot {
        lock(&self.output_buffer).snapshot()
    }

    /// Point this channel at `target`'s new location. Sockets to the old location are closed, and
    /// reopened to the new one on next use.
    pub fn reconfigure(&self, target: OperatorStaticInformation) {
        *write(&self.target) = target;
        {
            let mut data = lock(&self.data);
            if let Some(stale) = data.stream.take() {
                let _ = stale.shutdown(Shutdown::Both);
            }
        }
        if let Some(stale) = lock(&self.blind).take() {
            let _ = stale.shutdown(Shutdown::Both);
        }
        self.control.invalidate();
    }

    /// Cancel every reconnect loop and close every socket. A closed channel stays closed.
    pub fn close(&self) {
        self.cancellation.cancel();
        self.set_state(ChannelState::Closed);
        if let Some(stale) = lock(&self.data).stream.take() {
            let _ = stale.shutdown(Shutdown::Both);
        }
        if let Some(stale) = lock(&self.blind).take() {
            let _ = stale.shutdown(Shutdown::Both);
        }
        self.control.invalidate();
        self.control.available.notify_all();
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn configure_data_stream(stream: &TcpStream, send_buffer_size: usize) -> io::Result<()> {
    SockRef::from(stream).set_send_buffer_size(send_buffer_size)?;
    stream.set_nodelay(true)
}

/// The control socket of a channel, shared with the thread reopening it.
struct ControlLink {
    target: Arc<RwLock<OperatorStaticInformation>>,
    socket: Mutex<Option<TcpStream>>,
    available: Condvar,
    reconnecting: AtomicBool,
    retry_policy: RetryPolicy,
    cancellation: CancellationToken,
    event_publisher: Option<Sender<Event>>,
}

impl ControlLink {
    fn is_connected(&self) -> bool {
        lock(&self.socket).is_some()
    }

    fn invalidate(&self) {
        if let Some(stale) = lock(&self.socket).take() {
            let _ = stale.shutdown(Shutdown::Both);
        }
    }

    fn reconnect_async(self: &Arc<Self>) -> bool {
        if self.cancellation.is_cancelled() {
            return false;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let link = Arc::clone(self);
        thread::spawn(move || {
            link.invalidate();
            let result = link.retry_policy.run(&link.cancellation, "Opening control socket", || {
                let addr: SocketAddr = read(&link.target).control_addr();
                TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map(|stream| (stream, addr))
            });
            match result {
                Ok(((stream, addr), _)) => {
                    *lock(&link.socket) = Some(stream);
                    Event::publish(
                        &link.event_publisher,
                        Event::ConnectControlLink(ConnectControlLinkEvent {
                            timestamp: SystemTime::now(),
                            target: addr,
                        }),
                    );
                }
                Err(err) => log::warn!("Stopped reopening a control socket: {:?}", err),
            }
            link.reconnecting.store(false, Ordering::SeqCst);
            link.available.notify_all();
        });
        true
    }

    fn wait_for_socket(&self, wait: Duration) -> Option<TcpStream> {
        let deadline = Instant::now() + wait;
        let mut socket = lock(&self.socket);
        loop {
            if let Some(stream) = socket.as_ref() {
                match stream.try_clone() {
                    Ok(clone) => return Some(clone),
                    Err(err) => {
                        log::warn!("Failed to clone control socket handle: {:?}", err);
                        return None;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline || self.cancellation.is_cancelled() {
                return None;
            }
            socket = match self.available.wait_timeout(socket, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
