/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Data types shared by every subsystem of the runtime.

pub mod basic;

pub mod tuple;

pub mod watermark;

pub use basic::{CryptoHash, OperatorId, StateTag, SystemStatus};
pub use tuple::{AttributeMapper, BatchTuplePayload, DataTuple, TuplePayload, Value};
pub use watermark::TimestampTracker;
