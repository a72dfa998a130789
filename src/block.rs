//! Block, envelope and consensus-metadata model.
//!
//! Blocks are the unit of ledger append: a header chained by hash, an
//! ordered batch of envelopes, and attachment slots filled in by the ledger
//! (last config index) and by the chain (serialized [`BlockMetadata`]).
//! The codec is bincode; the serialized form is what travels inside raft
//! log entries and snapshots.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// SHA-256 digest of a block header.
pub type BlockHash = [u8; 32];

/// Classification of an envelope, carried in its channel header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderType {
    /// A normal transaction.
    Message,
    /// A channel configuration update.
    Config,
    /// A system-channel transaction that carries a config envelope.
    OrdererTransaction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub header_type: HeaderType,
    pub channel_id: String,
}

/// A client transaction as submitted to the ordering service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel_header: ChannelHeader,
    /// Opaque transaction payload. For config envelopes this decodes to a
    /// [`ConfigUpdate`].
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Whether this envelope produces a config block when ordered.
    pub fn is_config(&self) -> bool {
        matches!(
            self.channel_header.header_type,
            HeaderType::Config | HeaderType::OrdererTransaction
        )
    }

    /// Decode the payload as a configuration update.
    pub fn config_update(&self) -> Result<ConfigUpdate, String> {
        bincode::deserialize(&self.payload).map_err(|e| e.to_string())
    }
}

/// One ordering node, identified by its TLS certificate pair (PEM).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsenterIdentity {
    pub host: String,
    pub port: u16,
    pub server_tls_cert: Vec<u8>,
    pub client_tls_cert: Vec<u8>,
}

/// Consensus bookkeeping persisted inside every committed block and every
/// snapshot.
///
/// `next_consenter_id` is strictly monotonic: an id removed from
/// `consenters` is never handed out again, except that certificate rotation
/// reassigns the rotated node's id to its new identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub consenters: BTreeMap<u64, ConsenterIdentity>,
    pub next_consenter_id: u64,
    pub raft_index: u64,
}

impl BlockMetadata {
    /// Serialize for embedding in a block's attachment slot.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block metadata encoding cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        bincode::deserialize(bytes).map_err(|e| e.to_string())
    }
}

/// Tunables a config block may update at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusOptions {
    pub snapshot_interval_bytes: Option<u32>,
}

/// The consenter set (and options) carried by a configuration update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMetadata {
    pub consenters: Vec<ConsenterIdentity>,
    pub options: Option<ConsensusOptions>,
}

/// Payload of a config envelope.
///
/// `consensus` is present only when the update touches the consensus
/// section; other channel configuration changes leave it `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub channel_id: String,
    pub consensus: Option<ConsensusMetadata>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub previous_hash: BlockHash,
    pub data_hash: BlockHash,
}

impl BlockHeader {
    pub fn hash(&self) -> BlockHash {
        let bytes = bincode::serialize(self).expect("block header encoding cannot fail");
        Sha256::digest(&bytes).into()
    }
}

/// Slots filled in outside block creation: the ledger tracks the number of
/// the latest config block, the chain attaches its serialized
/// [`BlockMetadata`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAttachments {
    pub last_config_index: u64,
    pub consensus_metadata: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub envelopes: Vec<Envelope>,
    pub metadata: BlockAttachments,
}

impl Block {
    /// A config block carries exactly one envelope, of config type.
    pub fn is_config(&self) -> bool {
        self.envelopes.len() == 1 && self.envelopes[0].is_config()
    }

    /// The config envelope wrapped by this block, if it is a config block.
    pub fn config_envelope(&self) -> Option<&Envelope> {
        if self.is_config() {
            self.envelopes.first()
        } else {
            None
        }
    }

    /// Read the consensus metadata update carried by a config block.
    ///
    /// Returns `Ok(None)` when the block's config update does not touch the
    /// consenter set.
    pub fn consensus_metadata(&self) -> Result<Option<ConsensusMetadata>, String> {
        let env = self.config_envelope().ok_or_else(|| "not a config block".to_string())?;
        match env.channel_header.header_type {
            HeaderType::Config | HeaderType::OrdererTransaction => {
                let update = env.config_update()?;
                Ok(update.consensus)
            }
            HeaderType::Message => Err("unexpected header type".to_string()),
        }
    }

    /// Serialized form, as replicated through the raft log.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block encoding cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        bincode::deserialize(bytes).map_err(|e| e.to_string())
    }
}
