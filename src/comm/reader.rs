/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Incoming connections: one reader thread per upstream connection.
//!
//! ## Data readers
//!
//! An [`IncomingDataHandler`] decodes [`BatchTuplePayload`] frames from one upstream connection. For each
//! batch it:
//! 1. Resolves the logical operator the connection comes from. The operator is identified by the remote
//!    address of the socket, and then mapped to the operator it was split from, if it is a scaled-out
//!    replica.
//! 2. Picks the input queue of that operator in the node's [`DataStructureAdapter`].
//! 3. If the node is accepting input, pushes every tuple of the batch and advances the incoming
//!    watermark. Otherwise the batch is dropped: it is stale data still sitting in network buffers
//!    during a shutdown or a rebalance.
//!
//! On end of stream or I/O error the reader closes its socket and exits. It never reconnects: the
//! writing side does.
//!
//! ## Control readers
//!
//! An [`IncomingControlHandler`] decodes [`ControlTuple`] frames and dispatches them to a
//! [`ControlHandler`].

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::events::*;
use crate::messages::ControlTuple;
use crate::metrics::MetricsSink;
use crate::processing::context::TopologyContext;
use crate::processing::owner::Owner;
use crate::types::{AttributeMapper, BatchTuplePayload, DataTuple, OperatorId, SystemStatus, TimestampTracker};

use super::codec::{read_frame, CodecError};
use super::intake::DataStructureAdapter;
use super::{lock, read};

/// The incoming watermark of a node, advanced by its data readers.
#[derive(Debug, Default)]
pub struct WatermarkCell(Mutex<TimestampTracker>);

impl WatermarkCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that input from `source` was received up to `timestamp`. Never moves backwards.
    pub fn advance(&self, source: OperatorId, timestamp: u64) -> bool {
        lock(&self.0).advance(source, timestamp)
    }

    pub fn snapshot(&self) -> TimestampTracker {
        lock(&self.0).clone()
    }
}

/// What data readers need to turn frames into queued tuples.
pub struct ReaderContext {
    pub topology: Arc<RwLock<TopologyContext>>,
    pub intake: Arc<DataStructureAdapter>,
    pub mapper: Arc<AttributeMapper>,
    pub owner: Arc<dyn Owner>,
    pub watermark: Arc<WatermarkCell>,
    pub metrics: Arc<dyn MetricsSink>,
    pub event_publisher: Option<Sender<Event>>,
}

pub struct IncomingDataHandler;

impl IncomingDataHandler {
    /// Start reading `stream`, identifying its origin by the stream's remote address.
    pub fn spawn(stream: TcpStream, ctx: Arc<ReaderContext>) -> JoinHandle<()> {
        thread::spawn(move || {
            let origin = stream
                .peer_addr()
                .ok()
                .and_then(|peer| read(&ctx.topology).upstream_by_ip(peer.ip()));
            match origin {
                Some(origin) => Self::run(stream, origin, &ctx),
                None => {
                    log::warn!(
                        "Closing data connection from {:?}: no upstream operator is located there",
                        stream.peer_addr()
                    );
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        })
    }

    /// Start reading `stream`, whose origin is already known.
    pub fn spawn_with_origin(stream: TcpStream, origin: OperatorId, ctx: Arc<ReaderContext>) -> JoinHandle<()> {
        thread::spawn(move || Self::run(stream, origin, &ctx))
    }

    fn run(mut stream: TcpStream, origin: OperatorId, ctx: &ReaderContext) {
        loop {
            let batch: BatchTuplePayload = match read_frame(&mut stream) {
                Ok(batch) => batch,
                Err(CodecError::Closed) => {
                    log::debug!("Upstream {:?} closed its data connection", origin);
                    break;
                }
                Err(err) => {
                    log::warn!("Data connection from {:?} failed: {:?}", origin, err);
                    break;
                }
            };
            Self::handle_batch(batch, origin, ctx);
        }
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn handle_batch(batch: BatchTuplePayload, origin: OperatorId, ctx: &ReaderContext) {
        let count = batch.len();
        ctx.metrics.tuples_received(count as u64);

        let original = read(&ctx.topology).original_upstream_of(origin);
        let Some(queue) = ctx.intake.queue_for(original) else {
            log::warn!("Dropping {} tuples from {:?}: no input queue for {:?}", count, origin, original);
            ctx.metrics.tuples_dropped(count as u64);
            return;
        };

        if ctx.owner.check_system_status() != SystemStatus::Normal {
            ctx.metrics.tuples_dropped(count as u64);
            Event::publish(
                &ctx.event_publisher,
                Event::DropTuples(DropTuplesEvent {
                    timestamp: SystemTime::now(),
                    source: original,
                    count,
                }),
            );
            return;
        }

        let last_timestamp = batch.last_timestamp;
        for payload in batch.batch {
            queue.push(DataTuple::new(Arc::clone(&ctx.mapper), payload));
        }
        ctx.watermark.advance(original, last_timestamp);
        ctx.metrics.input_queue_len(queue.len());
    }
}

/// Receives the control messages read by an [`IncomingControlHandler`].
pub trait ControlHandler: Send + Sync {
    fn handle_control(&self, msg: ControlTuple, peer: Option<SocketAddr>);
}

pub struct IncomingControlHandler;

impl IncomingControlHandler {
    pub fn spawn(mut stream: TcpStream, handler: Arc<dyn ControlHandler>) -> JoinHandle<()> {
        thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            loop {
                match read_frame::<_, ControlTuple>(&mut stream) {
                    Ok(msg) => handler.handle_control(msg, peer),
                    Err(CodecError::Closed) => break,
                    Err(err) => {
                        log::warn!("Control connection from {:?} failed: {:?}", peer, err);
                        break;
                    }
                }
            }
            let _ = stream.shutdown(Shutdown::Both);
        })
    }
}

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Accepts connections on a listener and hands each one to a callback, typically spawning a reader.
/// When this value is dropped, the accepting thread is shut down; readers already spawned keep running
/// until their connection ends.
pub struct Acceptor {
    local_addr: Option<SocketAddr>,
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl Acceptor {
    pub fn start(listener: TcpListener, on_connection: impl Fn(TcpStream) + Send + 'static) -> Acceptor {
        let local_addr = listener.local_addr().ok();
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let thread = Self::accepting(listener, on_connection, shutdown_receiver);
        Acceptor {
            local_addr,
            thread: Some(thread),
            shutdown,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn accepting(
        listener: TcpListener,
        on_connection: impl Fn(TcpStream) + Send + 'static,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(err) = listener.set_nonblocking(true) {
                log::error!("Cannot poll listener {:?}: {:?}", listener.local_addr(), err);
                return;
            }
            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => (),
                }

                match listener.accept() {
                    Ok((stream, _)) => match stream.set_nonblocking(false) {
                        Ok(()) => on_connection(stream),
                        Err(err) => log::warn!("Dropping accepted connection: {:?}", err),
                    },
                    Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                    Err(err) => log::warn!("Accepting on {:?} failed: {:?}", listener.local_addr(), err),
                }
            }
        })
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
