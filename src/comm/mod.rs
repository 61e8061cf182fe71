/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Moving tuples and control messages between nodes.
//!
//! Outgoing, a processing unit routes each emitted tuple to an [`EndPoint`]:
//! - a [`SyncChannel`], reached through the shared [`OutputQueue`],
//! - an [`AsyncChannel`], which writes on a dedicated thread, or
//! - a [local](LocalDownstream) operator hosted on the same node.
//!
//! Incoming, one [reader](reader) per upstream connection decodes batches and pushes their tuples into
//! the node's [input queues](intake).

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod async_channel;

pub mod channel;

pub mod codec;

pub mod endpoint;

pub mod intake;

pub mod output_buffer;

pub mod output_queue;

pub mod reader;

pub mod retry;

pub use async_channel::AsyncChannel;
pub use channel::{BatchAccumulator, ChannelState, SyncChannel};
pub use codec::CodecError;
pub use endpoint::{EndPoint, LocalDownstream};
pub use intake::{DataStructureAdapter, InputQueue};
pub use output_buffer::OutputBuffer;
pub use output_queue::OutputQueue;
pub use retry::{CancellationToken, RetryPolicy};

/// The only errors a channel lets through. Transient I/O failures are handled inside the channel.
#[derive(Debug)]
pub enum ChannelError {
    /// The channel was closed, or its cancellation token cancelled, while it was reconnecting.
    Cancelled,

    /// A bounded retry policy gave up reopening a socket.
    Unreachable { attempts: u64 },

    /// A message could not be serialized.
    Encoding(CodecError),
}

// A panicking thread never leaves the data guarded by these locks half-updated, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rw_lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw_lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rw_lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw_lock.write().unwrap_or_else(PoisonError::into_inner)
}
