use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-flow sequence number. Starts at 0 and never wraps.
pub type SeqNum = u64;

/// Identifies one logical connection (one remote endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

impl From<u64> for FlowId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One data packet handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flow: FlowId,
    pub seq: SeqNum,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(flow: FlowId, seq: SeqNum, payload: Bytes) -> Self {
        Self { flow, seq, payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Cumulative acknowledgement: every packet up to and including
/// `acked_up_to` has been received in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub flow: FlowId,
    pub acked_up_to: SeqNum,
}

impl Ack {
    pub fn new(flow: FlowId, acked_up_to: SeqNum) -> Self {
        Self { flow, acked_up_to }
    }
}
