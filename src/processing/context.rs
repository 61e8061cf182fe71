/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The topology context of a hosted operator: who sends to it, who it sends to, and where they live.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use crate::types::OperatorId;

/// Static identity and network location of an operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorStaticInformation {
    pub op_id: OperatorId,
    pub ip: IpAddr,
    pub data_port: u16,
    pub control_port: u16,
    /// Port of the optional blind socket, over which chunks of streamed states are sent.
    pub blind_port: Option<u16>,
}

impl OperatorStaticInformation {
    pub fn new(op_id: OperatorId, ip: IpAddr, data_port: u16, control_port: u16) -> Self {
        Self {
            op_id,
            ip,
            data_port,
            control_port,
            blind_port: None,
        }
    }

    pub fn with_blind_port(mut self, blind_port: u16) -> Self {
        self.blind_port = Some(blind_port);
        self
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.data_port)
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.control_port)
    }

    pub fn blind_addr(&self) -> Option<SocketAddr> {
        self.blind_port.map(|port| SocketAddr::new(self.ip, port))
    }
}

/// Upstream and downstream operators of one hosted operator, in routing order.
///
/// Downstream indices are the target indices operators pass to
/// [`ProcessingApi::send`](crate::processing::ProcessingApi::send).
#[derive(Clone, Debug)]
pub struct TopologyContext {
    op_id: OperatorId,
    upstreams: Vec<OperatorStaticInformation>,
    downstreams: Vec<OperatorStaticInformation>,
    // Scaled-out replica -> operator it was split from.
    original_upstreams: BTreeMap<OperatorId, OperatorId>,
    star_topology: Vec<OperatorId>,
}

impl TopologyContext {
    pub fn new(op_id: OperatorId) -> Self {
        Self {
            op_id,
            upstreams: Vec::new(),
            downstreams: Vec::new(),
            original_upstreams: BTreeMap::new(),
            star_topology: Vec::new(),
        }
    }

    pub fn op_id(&self) -> OperatorId {
        self.op_id
    }

    pub fn upstreams(&self) -> &[OperatorStaticInformation] {
        &self.upstreams
    }

    pub fn downstreams(&self) -> &[OperatorStaticInformation] {
        &self.downstreams
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    pub fn downstream_count(&self) -> usize {
        self.downstreams.len()
    }

    pub fn downstream(&self, idx: usize) -> Option<&OperatorStaticInformation> {
        self.downstreams.get(idx)
    }

    pub fn upstream(&self, op_id: OperatorId) -> Option<&OperatorStaticInformation> {
        self.upstreams.iter().find(|info| info.op_id == op_id)
    }

    /// Index of `op_id` among the downstreams, if it is one.
    pub fn downstream_index_of(&self, op_id: OperatorId) -> Option<usize> {
        self.downstreams.iter().position(|info| info.op_id == op_id)
    }

    /// Add an upstream, replacing any previous entry for the same operator.
    pub fn add_upstream(&mut self, info: OperatorStaticInformation) {
        match self.upstreams.iter_mut().find(|existing| existing.op_id == info.op_id) {
            Some(existing) => *existing = info,
            None => self.upstreams.push(info),
        }
    }

    /// Add a downstream and return its index. Re-adding a known downstream updates it in place and
    /// keeps its index.
    pub fn add_downstream(&mut self, info: OperatorStaticInformation) -> usize {
        match self.downstream_index_of(info.op_id) {
            Some(idx) => {
                self.downstreams[idx] = info;
                idx
            }
            None => {
                self.downstreams.push(info);
                self.downstreams.len() - 1
            }
        }
    }

    /// Record that `replica` was split from `original` during a scale-out.
    pub fn set_original_upstream(&mut self, replica: OperatorId, original: OperatorId) {
        self.original_upstreams.insert(replica, original);
    }

    /// Get the operator `op_id` was split from, or `op_id` itself if it was never split.
    pub fn original_upstream_of(&self, op_id: OperatorId) -> OperatorId {
        self.original_upstreams.get(&op_id).copied().unwrap_or(op_id)
    }

    /// Get the upstream operator hosted at `ip`. If several are, the first one added wins.
    pub fn upstream_by_ip(&self, ip: IpAddr) -> Option<OperatorId> {
        self.upstreams
            .iter()
            .find(|info| info.ip == ip)
            .map(|info| info.op_id)
    }

    /// Move `op_id` to `ip`, wherever it appears. Returns whether it appears at all.
    pub fn reconfigure_operator_location(&mut self, op_id: OperatorId, ip: IpAddr) -> bool {
        let mut found = false;
        for info in self.upstreams.iter_mut().chain(self.downstreams.iter_mut()) {
            if info.op_id == op_id {
                info.ip = ip;
                found = true;
            }
        }
        found
    }

    /// Set the operators that receive this operator's state backups, in rotation order.
    pub fn set_star_topology(&mut self, replicas: Vec<OperatorId>) {
        self.star_topology = replicas;
    }

    pub fn star_topology(&self) -> &[OperatorId] {
        &self.star_topology
    }

    pub fn star_topology_size(&self) -> usize {
        self.star_topology.len()
    }
}
