//! Translates consenter-set updates into raft configuration changes.
//!
//! A configuration block may add one consenter, remove one consenter, or
//! rotate the certificates of one consenter. Anything more is rejected:
//! multi-step membership changes are not safe to apply through a single
//! raft `ConfChange`.

use std::collections::HashSet;
use std::fmt;

use raft::eraftpb::ConfChange;
use raft::eraftpb::ConfChangeType;
use raft::eraftpb::ConfState;

use crate::block::Block;
use crate::block::BlockMetadata;
use crate::block::ConsensusMetadata;
use crate::block::ConsenterIdentity;
use crate::error::MembershipChangeError;
use crate::error::MembershipError;

/// The membership delta introduced by a configuration update.
#[derive(Clone, Debug)]
pub struct MembershipChanges {
    /// Block metadata after the change is applied.
    pub new_metadata: BlockMetadata,
    pub added: Vec<ConsenterIdentity>,
    pub removed: Vec<ConsenterIdentity>,
    /// The raft configuration change to propose, if membership changed at
    /// the raft level. Rotations leave this `None`.
    pub conf_change: Option<ConfChange>,
    /// Raft id of the rotated node, 0 when the change is not a rotation.
    pub rotated_node: u64,
}

impl MembershipChanges {
    /// Whether these changes actually do anything.
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Whether the change swaps certificates of an existing node.
    pub fn rotated(&self) -> bool {
        self.added.len() == 1 && self.removed.len() == 1
    }
}

impl fmt::Display for MembershipChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "add {} node(s), remove {} node(s)",
            self.added.len(),
            self.removed.len()
        )
    }
}

/// Compute the membership update that turns the consenter set recorded in
/// `old_metadata` into `new_consenters`.
///
/// Consenters are keyed by client TLS certificate; a consenter whose client
/// certificate is unknown counts as added, a recorded consenter missing
/// from the new set counts as removed. One addition plus one removal is a
/// certificate rotation: the removed node's raft id is reassigned to the
/// added identity and no raft `ConfChange` is emitted.
pub fn compute_membership_changes(
    old_metadata: &BlockMetadata,
    new_consenters: &[ConsenterIdentity],
) -> Result<MembershipChanges, MembershipChangeError> {
    let mut result = MembershipChanges {
        new_metadata: old_metadata.clone(),
        added: Vec::new(),
        removed: Vec::new(),
        conf_change: None,
        rotated_node: 0,
    };

    let current: HashSet<&[u8]> = old_metadata
        .consenters
        .values()
        .map(|c| c.client_tls_cert.as_slice())
        .collect();
    for consenter in new_consenters {
        if !current.contains(consenter.client_tls_cert.as_slice()) {
            result.added.push(consenter.clone());
        }
    }

    let updated: HashSet<&[u8]> =
        new_consenters.iter().map(|c| c.client_tls_cert.as_slice()).collect();
    let mut deleted_node_id = 0;
    for (node_id, consenter) in &old_metadata.consenters {
        if !updated.contains(consenter.client_tls_cert.as_slice()) {
            result.removed.push(consenter.clone());
            deleted_node_id = *node_id;
        }
    }

    match (result.added.len(), result.removed.len()) {
        (1, 1) => {
            // cert rotation: the raft id survives the identity swap
            result.rotated_node = deleted_node_id;
            result
                .new_metadata
                .consenters
                .insert(deleted_node_id, result.added[0].clone());
        }
        (1, 0) => {
            let node_id = result.new_metadata.next_consenter_id;
            result.new_metadata.consenters.insert(node_id, result.added[0].clone());
            result.new_metadata.next_consenter_id += 1;

            let mut cc = ConfChange::default();
            cc.set_change_type(ConfChangeType::AddNode);
            cc.set_node_id(node_id);
            result.conf_change = Some(cc);
        }
        (0, 1) => {
            let mut cc = ConfChange::default();
            cc.set_change_type(ConfChangeType::RemoveNode);
            cc.set_node_id(deleted_node_id);
            result.conf_change = Some(cc);

            result.new_metadata.consenters.remove(&deleted_node_id);
        }
        (0, 0) => {}
        (added, removed) => {
            return Err(MembershipChangeError::TooManyChanges { added, removed });
        }
    }

    Ok(result)
}

/// Reject consensus metadata in which any TLS certificate, client or
/// server, is assigned to more than one consenter.
pub fn metadata_has_duplication(metadata: &ConsensusMetadata) -> Result<(), MembershipChangeError> {
    let mut seen: HashSet<&[u8]> = HashSet::new();
    for consenter in &metadata.consenters {
        let server = consenter.server_tls_cert.as_slice();
        let client = consenter.client_tls_cert.as_slice();
        if seen.contains(server) || seen.contains(client) {
            return Err(MembershipChangeError::DuplicateConsenter {
                server: String::from_utf8_lossy(server).into_owned(),
                client: String::from_utf8_lossy(client).into_owned(),
            });
        }
        seen.insert(server);
        seen.insert(client);
    }
    Ok(())
}

/// Derive the single add or remove needed to reconcile raft's view of the
/// cluster with the consenter set recorded in block metadata.
///
/// A new leader uses this to resume a membership transition abandoned by
/// its predecessor: the config block was committed but the matching
/// `ConfChange` never was.
pub fn conf_change_from_state(metadata: &BlockMetadata, conf_state: &ConfState) -> ConfChange {
    let mut cc = ConfChange::default();
    let voters = conf_state.get_voters();

    if voters.len() < metadata.consenters.len() {
        cc.set_change_type(ConfChangeType::AddNode);
        for node_id in metadata.consenters.keys() {
            if !voters.contains(node_id) {
                cc.set_node_id(*node_id);
            }
        }
    } else {
        cc.set_change_type(ConfChangeType::RemoveNode);
        for node_id in voters {
            if !metadata.consenters.contains_key(node_id) {
                cc.set_node_id(*node_id);
            }
        }
    }

    cc
}

/// The voter ids to bootstrap a fresh raft group with.
pub fn raft_peers(metadata: &BlockMetadata) -> Vec<u64> {
    metadata.consenters.keys().copied().collect()
}

/// A TLS certificate of a consenter, used to evaluate channel membership.
#[derive(Clone, Debug)]
pub struct ConsenterCertificate(pub Vec<u8>);

impl ConsenterCertificate {
    /// Whether the holder of this certificate is a consenter of the channel
    /// described by `config_block`.
    ///
    /// Returns `Ok(())` when the certificate appears (as server or client
    /// cert) in the block's consenter set, and
    /// [`MembershipError::NotInChannel`] when it does not.
    pub fn is_consenter_of_channel(&self, config_block: &Block) -> Result<(), MembershipError> {
        if !config_block.is_config() {
            return Err(MembershipError::NotAConfigBlock);
        }
        let metadata = config_block
            .consensus_metadata()
            .map_err(MembershipError::Codec)?
            .ok_or(MembershipError::NoConsensusMetadata)?;

        for consenter in &metadata.consenters {
            if consenter.server_tls_cert == self.0 || consenter.client_tls_cert == self.0 {
                return Ok(());
            }
        }
        Err(MembershipError::NotInChannel)
    }
}
