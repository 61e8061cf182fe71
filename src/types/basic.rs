/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store identities and bytes, and do not have any major "active" behavior.

use std::fmt::{self, Debug, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

/// Number that uniquely identifies an operator in the deployed dataflow graph.
///
/// Operator ids are assigned by the placement planner at deployment time and never change for the
/// lifetime of an operator instance. Scaled-out replicas receive fresh ids, and remember the id of the
/// operator they were split from (see
/// [`TopologyContext::original_upstream_of`](crate::processing::context::TopologyContext::original_upstream_of)).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct OperatorId(u32);

impl OperatorId {
    /// Create a new `OperatorId` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `OperatorId`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for OperatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for OperatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Name used on the backup side to reconstruct the concrete type of a serialized [`State`](crate::state::State).
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Default)]
pub struct StateTag(String);

impl StateTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StateTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 digest of a serialized state blob. Only used to identify blobs in logs and to compare
/// a reassembled state with its source.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Hash `bytes` with SHA-256.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::logging::first_seven_base64_chars(&self.0))
    }
}

/// Whether the node hosting a processing unit is currently accepting incoming tuples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemStatus {
    /// Tuples are accepted into the intake queues.
    Normal,

    /// The node is draining (shutdown, rebalance or recovery). Tuples still sitting in network buffers
    /// are discarded by the incoming readers.
    Draining,
}
