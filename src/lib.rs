//! Raft-backed ordering chain for a permissioned ledger.
//!
//! A [`Chain`] accepts client transactions (normal or configuration), cuts
//! them into blocks, replicates the blocks through raft across the ordering
//! nodes and commits them in one consistent order. Around that core it
//! manages dynamic membership (adding, removing and rotating consenter
//! certificates), snapshotting for log compaction, catch-up for lagging
//! replicas, and detection of its own eviction from the channel.
//!
//! The crate deliberately stops at well-defined seams: the ledger, the
//! cluster transport, the communication configurator and the batching
//! policy are consumed through the traits in [`support`] and [`puller`];
//! the raft protocol itself comes from the `raft` crate.
//!
//! # Structure
//!
//! - [`chain`]: the state machine, one cooperative loop per chain owning
//!   all mutable state.
//! - [`membership`]: translates consenter-set updates into raft
//!   configuration changes.
//! - [`eviction`]: the periodic leaderless check and the eviction
//!   suspector.
//! - [`storage`]: WAL and snapshot persistence beneath the raft log.
//! - [`block`] / [`message`]: the data model and wire envelopes.

#![deny(unused_qualifications)]

mod creator;
mod node;

pub mod block;
pub mod chain;
pub mod config;
pub mod error;
pub mod eviction;
pub mod membership;
pub mod message;
pub mod puller;
pub mod storage;
pub mod support;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod membership_test;
#[cfg(test)]
mod storage_test;

pub use crate::block::Block;
pub use crate::block::BlockMetadata;
pub use crate::block::ConsenterIdentity;
pub use crate::block::Envelope;
pub use crate::chain::Chain;
pub use crate::chain::Errored;
pub use crate::config::Options;
pub use crate::error::ChainError;
pub use crate::error::ChainInitError;
pub use crate::eviction::EvictionSuspector;
pub use crate::eviction::PeriodicCheck;
pub use crate::membership::compute_membership_changes;
pub use crate::membership::MembershipChanges;
pub use crate::message::ConsensusRequest;
pub use crate::message::SubmitRequest;
pub use crate::node::NodeStatus;
pub use crate::puller::BlockPuller;
pub use crate::puller::LedgerBlockPuller;
pub use crate::support::ConsenterSupport;
