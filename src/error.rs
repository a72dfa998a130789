//! Error types exposed by this crate.
//!
//! Transient errors are returned to callers and are retryable. Violations of
//! ledger ordering invariants are not represented here: they terminate the
//! chain, because continuing past them would corrupt the ledger.

use std::io;

/// Errors returned by the public chain operations (`order`, `configure`,
/// `submit`, `consensus`, ...). All of them are transient from the caller's
/// point of view: the operation may be retried once the cluster state
/// changes.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no Raft leader")]
    NoLeader,

    #[error("chain is not started")]
    NotStarted,

    #[error("chain is stopped")]
    Stopped,

    #[error("bad config message: {0}")]
    BadConfigMessage(String),

    #[error("bad normal message: {0}")]
    BadNormalMessage(String),

    #[error("config transaction has unknown header type")]
    UnknownConfigType,

    #[error(transparent)]
    ConsenterSet(#[from] MembershipChangeError),

    #[error("failed to forward transaction to leader {leader}: {reason}")]
    ForwardFailed { leader: u64, reason: String },

    #[error("failed to unmarshal consensus request payload to Raft message: {0}")]
    BadConsensusPayload(String),

    #[error("failed to process Raft step message: {0}")]
    Step(String),
}

/// Rejected consenter-set updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipChangeError {
    /// The membership-change algorithm only supports one addition or one
    /// removal per configuration block.
    #[error(
        "update of more than one consenter at a time is not supported, \
         requested changes: add {added} node(s), remove {removed} node(s)"
    )]
    TooManyChanges { added: usize, removed: usize },

    /// A TLS certificate appears in more than one consenter slot.
    #[error("duplicate consenter: server cert: {server}, client cert: {client}")]
    DuplicateConsenter { server: String, client: String },
}

/// Outcome of checking whether a certificate belongs to a channel's
/// consenter set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    #[error("certificate is not a consenter of the channel")]
    NotInChannel,

    #[error("access to the channel is forbidden")]
    Forbidden,

    #[error("block is not a config block")]
    NotAConfigBlock,

    #[error("no consensus metadata in config block")]
    NoConsensusMetadata,

    #[error("failed to decode config block: {0}")]
    Codec(String),
}

/// Errors produced while validating [`Options`](crate::config::Options).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("raft id must not be 0")]
    ZeroRaftId,

    #[error("tick interval must be greater than zero")]
    ZeroTickInterval,

    #[error("election tick ({election_tick}) must be greater than heartbeat tick ({heartbeat_tick})")]
    ElectionTick {
        election_tick: usize,
        heartbeat_tick: usize,
    },

    #[error("max inflight blocks must be greater than zero")]
    ZeroMaxInflight,
}

/// Errors while reading blocks from the rest of the cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to create block puller: {0}")]
    PullerCreation(String),

    #[error("failed to fetch block {0} from cluster")]
    MissingBlock(u64),

    #[error("no endpoint reported a height")]
    NoEndpoints,

    #[error("failed to probe cluster heights: {0}")]
    Heights(String),

    #[error("failed to decode pulled block: {0}")]
    Codec(String),
}

/// Errors from the durable raft storage (WAL and snapshot files).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("raft storage io: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Raft(#[from] raft::Error),

    #[error("corrupt WAL record: {0}")]
    CorruptWal(String),

    #[error("corrupt snapshot file {path}: {reason}")]
    CorruptSnapshot { path: String, reason: String },
}

/// Errors surfaced while constructing a [`Chain`](crate::chain::Chain).
#[derive(Debug, thiserror::Error)]
pub enum ChainInitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to restore persisted raft data: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Raft(#[from] raft::Error),

    #[error("failed to read last block from ledger at height {height}")]
    LastBlockMissing { height: u64 },

    #[error("failed to decode block stored in snapshot: {0}")]
    SnapshotBlock(String),
}

/// Errors returned by the raft node actor handle.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The actor task has terminated; the chain is halting.
    #[error("raft node is stopped")]
    Stopped,

    #[error(transparent)]
    Raft(#[from] raft::Error),
}

/// A failed append to the local ledger.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ledger append failed: {0}")]
pub struct LedgerError(pub String);

/// A failed send over the cluster transport.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to send to node {dest}: {reason}")]
pub struct TransportError {
    pub dest: u64,
    pub reason: String,
}
