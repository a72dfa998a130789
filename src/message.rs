//! Wire envelopes exchanged between ordering nodes.

use serde::Deserialize;
use serde::Serialize;

use crate::block::Envelope;

/// A transaction forwarded to the raft leader for ordering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub channel: String,
    /// The config sequence the envelope was validated against. When the
    /// channel config has advanced past it, the leader re-validates before
    /// ordering.
    pub last_validation_seq: u64,
    pub payload: Envelope,
}

/// A raft protocol message in transit between consenters.
///
/// The payload is a protobuf-serialized `eraftpb::Message`; this crate never
/// inspects it beyond handing it to the raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub channel: String,
    pub payload: Vec<u8>,
}
