//! Canonical TCP flow identification shared by the analyzer and the rewriter
//!
//! Stream ids must come out identical on both sides of the pipeline: the
//! analyzer reads them from the dissector, the rewriter assigns them itself.
//! Both enumerate TCP conversations in order of their first packet, so the
//! assignment below (canonical endpoint pair, first-sighting counter)
//! reproduces the dissector's numbering.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

/// Numeric identifier of one TCP connection, stable within a single file
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One side of a TCP flow, labelled from the first packet of the flow
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

/// Address/port pair identifying one endpoint of a flow
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn v4(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: IpAddr::V4(ip),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Identifier for a two-way TCP flow
///
/// The endpoint pair is unordered: both directions of a connection map to the
/// same key. Normalization uses the numeric ordering of the endpoints.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct FlowKey(Endpoint, Endpoint);

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }
}

/// First-sighting assignment of stream ids and flow directions
///
/// Owned per file; never reused across files.
#[derive(Debug, Default)]
pub struct FlowTable {
    ids: FnvHashMap<FlowKey, StreamId>,
    forward_source: FnvHashMap<StreamId, Endpoint>,
    next_id: u64,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or assign the stream id for a packet and label its direction.
    ///
    /// The first packet of a flow defines the forward direction.
    pub fn classify(&mut self, source: Endpoint, destination: Endpoint) -> (StreamId, Direction) {
        let key = FlowKey::new(source, destination);
        if let Some(&id) = self.ids.get(&key) {
            let direction = if self.forward_source[&id] == source {
                Direction::Forward
            } else {
                Direction::Reverse
            };
            (id, direction)
        } else {
            let id = StreamId(self.next_id);
            self.next_id += 1;
            self.ids.insert(key, id);
            self.forward_source.insert(id, source);
            log::debug!(
                "assigned stream {} to {} -> {}",
                id,
                source,
                destination
            );
            (id, Direction::Forward)
        }
    }

    pub fn stream_count(&self) -> usize {
        self.ids.len()
    }
}
