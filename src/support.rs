//! Traits for the collaborators a chain is embedded between: the ledger and
//! channel machinery of the orderer, the cluster communication layer, and
//! the batching policy.
//!
//! The chain never reaches past these seams; tests substitute plain mock
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::block::Block;
use crate::block::Envelope;
use crate::error::LedgerError;
use crate::error::TransportError;
use crate::message::ConsensusRequest;
use crate::message::SubmitRequest;

/// A remote consenter as handed to the communication [`Configurator`].
/// Certificates are DER, decoded from the consenter's PEM identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteNode {
    pub id: u64,
    pub endpoint: String,
    pub server_tls_cert: Vec<u8>,
    pub client_tls_cert: Vec<u8>,
}

/// Reconfigures the cluster communication layer whenever the consenter set
/// changes.
pub trait Configurator: Send + Sync + 'static {
    fn configure(&self, channel: &str, new_nodes: Vec<RemoteNode>);
}

/// Transport used to reach other consenters: raft traffic and submit
/// forwarding.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a raft protocol message.
    ///
    /// Called from the raft loop: implementations must enqueue and return,
    /// not wait for the destination to process the message.
    async fn send_consensus(&self, dest: u64, request: ConsensusRequest)
        -> Result<(), TransportError>;

    async fn send_submit(&self, dest: u64, request: SubmitRequest) -> Result<(), TransportError>;
}

/// Decides how normal envelopes are grouped into batches.
pub trait BlockCutter: Send {
    /// Enqueue one envelope. Returns the batches that must be cut now, and
    /// whether an envelope is still pending in the open batch.
    fn ordered(&mut self, envelope: Envelope) -> (Vec<Vec<Envelope>>, bool);

    /// Cut whatever is pending, possibly an empty batch.
    fn cut(&mut self) -> Vec<Envelope>;
}

/// Channel-level configuration the chain consults at runtime.
pub trait SharedConfig: Send + Sync {
    /// How long an open batch may wait before it is cut.
    fn batch_timeout(&self) -> Duration;
}

/// The orderer-side resources backing one chain: ledger access, envelope
/// re-validation and the batching policy.
pub trait ConsenterSupport: Send + Sync + 'static {
    /// Number of blocks in the local ledger.
    fn height(&self) -> u64;

    /// Read a block from the local ledger.
    fn block(&self, number: u64) -> Option<Block>;

    fn chain_id(&self) -> String;

    /// The current config sequence; envelopes validated against an older
    /// sequence must be re-validated.
    fn sequence(&self) -> u64;

    fn shared_config(&self) -> Arc<dyn SharedConfig>;

    fn block_cutter(&self) -> Arc<Mutex<dyn BlockCutter>>;

    /// Re-validate a normal envelope against the current config sequence.
    fn process_normal_msg(&self, envelope: &Envelope) -> Result<u64, String>;

    /// Re-validate a config envelope; returns the (possibly transformed)
    /// envelope and the sequence it was validated against.
    fn process_config_msg(&self, envelope: &Envelope) -> Result<(Envelope, u64), String>;

    /// Commit a normal block, attaching serialized consensus metadata.
    fn write_block(&self, block: Block, consensus_metadata: Option<Vec<u8>>);

    /// Commit a config block, attaching serialized consensus metadata.
    fn write_config_block(&self, block: Block, consensus_metadata: Option<Vec<u8>>);

    /// Raw ledger append, bypassing commit processing. Used when backfilling
    /// blocks this node was not a consenter for.
    fn append(&self, block: Block) -> Result<(), LedgerError>;

    fn is_system_channel(&self) -> bool;
}
