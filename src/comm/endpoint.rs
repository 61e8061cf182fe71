/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Where an emitted tuple goes.

use std::sync::Arc;

use crate::types::{DataTuple, OperatorId};

use super::async_channel::AsyncChannel;
use super::channel::SyncChannel;
use super::ChannelError;

/// An operator hosted on the same node, reachable without the network.
pub trait LocalDownstream: Send + Sync {
    /// Process `tuple` synchronously, on the caller's thread.
    fn process_local(&self, tuple: DataTuple);
}

/// One downstream route of a processing unit. Every kind honors the same [`deliver`](EndPoint::deliver)
/// contract: the tuple eventually reaches the downstream operator, at least once, in the order it was
/// delivered relative to other tuples on the same endpoint.
#[derive(Clone)]
pub enum EndPoint {
    Synchronous(Arc<SyncChannel>),
    Asynchronous(Arc<AsyncChannel>),
    Local(OperatorId, Arc<dyn LocalDownstream>),
}

impl EndPoint {
    /// Id of the downstream operator this endpoint leads to.
    pub fn op_id(&self) -> OperatorId {
        match self {
            EndPoint::Synchronous(channel) => channel.op_id(),
            EndPoint::Asynchronous(channel) => channel.inner().op_id(),
            EndPoint::Local(op_id, _) => *op_id,
        }
    }

    /// Hand `tuple` over to the downstream operator.
    pub fn deliver(&self, tuple: DataTuple) -> Result<(), ChannelError> {
        match self {
            EndPoint::Synchronous(channel) => channel.send(tuple.into_payload()),
            EndPoint::Asynchronous(channel) => channel.deliver(tuple.into_payload()),
            EndPoint::Local(_, downstream) => {
                downstream.process_local(tuple);
                Ok(())
            }
        }
    }

    /// The synchronous channel behind this endpoint, if there is one.
    pub fn sync_channel(&self) -> Option<&Arc<SyncChannel>> {
        match self {
            EndPoint::Synchronous(channel) => Some(channel),
            EndPoint::Asynchronous(channel) => Some(channel.inner()),
            EndPoint::Local(..) => None,
        }
    }
}
