/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deterministic chunking of a streamable state, and reassembly of the chunks on the receiving side.
//!
//! ## Sending side
//!
//! A [`StreamStateManager`] is created over a frozen [`StreamSource`]. It computes the total number of
//! chunks up front as `ceil(size / chunk_size)` and then yields chunks on demand, with sequence numbers
//! `0, 1, ..., total - 1`. Every chunk of one run carries the same total. Once the last chunk has been
//! yielded the manager is exhausted.
//!
//! ## Receiving side
//!
//! A [`ChunkAssembler`] accepts the chunks of one share of a transfer, strictly in order. When a transfer
//! is spread over `replicas` backup nodes, chunk `i` goes to replica `i % replicas`, and the share of a
//! replica is every sequence number congruent to its index. The channel layer delivers the chunks of one
//! share in send order over a single connection, so an out-of-order chunk is a protocol violation rather
//! than something to buffer and reorder. A transfer to a single replica has one share holding every
//! chunk.

use std::sync::Arc;

use crate::messages::StateChunk;
use crate::types::{CryptoHash, OperatorId};

use super::{StateError, StreamSource};

/// One fragment of a chunked state transfer, as produced by a [`StreamStateManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryChunk {
    pub sequence_number: u32,
    pub total_chunks: u32,
    pub bytes: Vec<u8>,
}

pub struct StreamStateManager {
    source: Arc<dyn StreamSource>,
    chunk_size: usize,
    total_chunks: u32,
    next_sequence_number: u32,
}

impl StreamStateManager {
    /// Create a manager that cuts `source` into chunks of `chunk_size` units.
    pub fn new(source: Arc<dyn StreamSource>, chunk_size: usize) -> Result<Self, StateError> {
        if chunk_size == 0 {
            return Err(StateError::ZeroChunkSize);
        }
        let total_chunks = source.size().div_ceil(chunk_size) as u32;
        Ok(Self {
            source,
            chunk_size,
            total_chunks,
            next_sequence_number: 0,
        })
    }

    /// Total number of chunks this run produces. Fixed at construction.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn chunks_remaining(&self) -> u32 {
        self.total_chunks - self.next_sequence_number
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_sequence_number >= self.total_chunks
    }

    /// Get the next chunk, or `None` once every chunk has been produced.
    pub fn next_chunk(&mut self) -> Option<MemoryChunk> {
        if self.is_exhausted() {
            return None;
        }
        let sequence_number = self.next_sequence_number;
        let offset = sequence_number as usize * self.chunk_size;
        let bytes = self.source.read(offset, self.chunk_size);
        self.next_sequence_number += 1;

        Some(MemoryChunk {
            sequence_number,
            total_chunks: self.total_chunks,
            bytes,
        })
    }
}

impl Iterator for StreamStateManager {
    type Item = MemoryChunk;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

/// Collects the chunks of one share of a transfer, in order.
#[derive(Debug)]
pub struct ChunkAssembler {
    owner: OperatorId,
    replicas: u32,
    replica_index: u32,
    total_chunks: Option<u32>,
    chunks: Vec<Vec<u8>>,
}

impl ChunkAssembler {
    /// Create an assembler for a whole transfer, made of every chunk from 0 up.
    pub fn new(owner: OperatorId) -> Self {
        Self::for_share(owner, 1, 0)
    }

    /// Create an assembler for the share of replica `replica_index` out of `replicas`.
    pub fn for_share(owner: OperatorId, replicas: u32, replica_index: u32) -> Self {
        let replicas = replicas.max(1);
        Self {
            owner,
            replicas,
            replica_index: replica_index % replicas,
            total_chunks: None,
            chunks: Vec::new(),
        }
    }

    pub fn owner(&self) -> OperatorId {
        self.owner
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Number of chunks in this share, once the total is known.
    pub fn share_size(&self) -> Option<u32> {
        self.total_chunks.map(|total| {
            if self.replica_index >= total {
                0
            } else {
                (total - 1 - self.replica_index) / self.replicas + 1
            }
        })
    }

    /// Whether every chunk of this share has been received.
    pub fn is_complete(&self) -> bool {
        self.share_size()
            .is_some_and(|size| size == self.chunks.len() as u32)
    }

    fn sequence_number_at(&self, position: u32) -> u32 {
        self.replica_index + position * self.replicas
    }

    /// Append the next chunk of the share.
    pub fn append(&mut self, chunk: &StateChunk) -> Result<(), StateError> {
        let expected_seq = self.sequence_number_at(self.chunks.len() as u32);
        if chunk.sequence_number != expected_seq {
            return Err(StateError::ChunkOutOfOrder {
                expected: expected_seq,
                received: chunk.sequence_number,
            });
        }

        match self.total_chunks {
            Some(total) if total != chunk.total_chunks => {
                return Err(StateError::TotalChunksMismatch {
                    expected: total,
                    received: chunk.total_chunks,
                })
            }
            Some(_) => (),
            None => self.total_chunks = Some(chunk.total_chunks),
        }

        self.chunks.push(chunk.bytes.clone());
        Ok(())
    }

    /// Finish the share, returning its chunks in sequence order.
    pub fn finish(self) -> Result<Vec<Vec<u8>>, StateError> {
        Ok(self.finish_indexed()?.into_iter().map(|(_, bytes)| bytes).collect())
    }

    /// Finish the share, returning its chunks in sequence order along with their sequence numbers.
    pub fn finish_indexed(self) -> Result<Vec<(u32, Vec<u8>)>, StateError> {
        let received = self.chunks.len() as u32;
        if let Some(expected) = self.share_size() {
            if expected != received {
                return Err(StateError::IncompleteTransfer { expected, received });
            }
        }
        let (replicas, replica_index) = (self.replicas, self.replica_index);
        Ok(self
            .chunks
            .into_iter()
            .zip(0..)
            .map(|(bytes, position)| (replica_index + position * replicas, bytes))
            .collect())
    }

    /// Finish the transfer, concatenating every chunk. For a whole transfer of byte-unit sources this
    /// reproduces the source.
    pub fn finish_concatenated(self) -> Result<Vec<u8>, StateError> {
        Ok(self.finish()?.concat())
    }

    /// Digest of the concatenation of the chunks received so far.
    pub fn digest(&self) -> CryptoHash {
        CryptoHash::digest(&self.chunks.concat())
    }
}
