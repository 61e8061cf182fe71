/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The data-plane wire unit ([`TuplePayload`], [`BatchTuplePayload`]) and its in-process view
//! ([`DataTuple`]).
//!
//! Tuples travel over the network as positional field values. The mapping from attribute names to
//! positions is agreed out of band when a connection is set up ([`AttributeMapper`]), so the wire
//! format never repeats attribute names.

use std::collections::BTreeMap;
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

/// A single attribute value.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Value {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Field values of one tuple plus the timestamp assigned to it by its source.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TuplePayload {
    pub values: Vec<Value>,
    pub timestamp: u64,
}

impl TuplePayload {
    pub fn new(values: Vec<Value>, timestamp: u64) -> Self {
        Self { values, timestamp }
    }
}

/// An ordered sequence of tuples written as one frame on a data channel, plus the highest timestamp the
/// sender had emitted when the batch was written. Tuples may be emitted out of timestamp order, so this is
/// a high-water mark rather than the timestamp of the last tuple.
#[derive(Clone, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct BatchTuplePayload {
    pub batch: Vec<TuplePayload>,
    pub last_timestamp: u64,
}

impl BatchTuplePayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tuple(&mut self, payload: TuplePayload) {
        self.last_timestamp = self.last_timestamp.max(payload.timestamp);
        self.batch.push(payload);
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn clear(&mut self) {
        self.batch.clear();
    }
}

/// Maps the names of an operator's declared working attributes to their positions in a [`TuplePayload`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeMapper(BTreeMap<String, usize>);

impl AttributeMapper {
    /// Assign positions to `attributes` in declaration order.
    pub fn from_attributes<S: AsRef<str>>(attributes: &[S]) -> Self {
        Self(
            attributes
                .iter()
                .enumerate()
                .map(|(idx, attr)| (attr.as_ref().to_string(), idx))
                .collect(),
        )
    }

    pub fn index_of(&self, attribute: &str) -> Option<usize> {
        self.0.get(attribute).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A tuple as seen by operator code: a payload plus the attribute mapping needed to read it by name.
#[derive(Clone, Debug)]
pub struct DataTuple {
    mapper: Arc<AttributeMapper>,
    payload: TuplePayload,
}

impl DataTuple {
    pub fn new(mapper: Arc<AttributeMapper>, payload: TuplePayload) -> Self {
        Self { mapper, payload }
    }

    /// A tuple with no fields, used to kick off source operators.
    pub fn noop() -> Self {
        Self {
            mapper: Arc::new(AttributeMapper::default()),
            payload: TuplePayload::new(Vec::new(), 0),
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.payload.values.get(self.mapper.index_of(attribute)?)
    }

    pub fn get_int(&self, attribute: &str) -> Option<i64> {
        match self.get(attribute)? {
            Value::Int(int) => Some(*int),
            _ => None,
        }
    }

    pub fn get_str(&self, attribute: &str) -> Option<&str> {
        match self.get(attribute)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.payload.timestamp
    }

    pub fn payload(&self) -> &TuplePayload {
        &self.payload
    }

    pub fn mapper(&self) -> &Arc<AttributeMapper> {
        &self.mapper
    }

    pub fn into_payload(self) -> TuplePayload {
        self.payload
    }
}
