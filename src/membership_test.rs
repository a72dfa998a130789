use maplit::btreemap;
use raft::eraftpb::ConfChangeType;
use raft::eraftpb::ConfState;

use crate::block::Block;
use crate::block::BlockAttachments;
use crate::block::BlockHeader;
use crate::block::BlockMetadata;
use crate::block::ChannelHeader;
use crate::block::ConfigUpdate;
use crate::block::ConsensusMetadata;
use crate::block::ConsenterIdentity;
use crate::block::Envelope;
use crate::block::HeaderType;
use crate::error::MembershipChangeError;
use crate::error::MembershipError;
use crate::membership::compute_membership_changes;
use crate::membership::conf_change_from_state;
use crate::membership::metadata_has_duplication;
use crate::membership::raft_peers;
use crate::membership::ConsenterCertificate;

fn consenter(n: u64) -> ConsenterIdentity {
    ConsenterIdentity {
        host: format!("orderer{}", n),
        port: 7050,
        server_tls_cert: format!("server-cert-{}", n).into_bytes(),
        client_tls_cert: format!("client-cert-{}", n).into_bytes(),
    }
}

fn metadata_of(ids: &[u64], next_consenter_id: u64) -> BlockMetadata {
    BlockMetadata {
        consenters: ids.iter().map(|id| (*id, consenter(*id))).collect(),
        next_consenter_id,
        raft_index: 0,
    }
}

#[test]
fn test_no_change() -> anyhow::Result<()> {
    let old = metadata_of(&[1, 2, 3], 4);
    let new: Vec<_> = (1..=3).map(consenter).collect();

    let changes = compute_membership_changes(&old, &new)?;
    assert!(!changes.changed());
    assert!(!changes.rotated());
    assert!(changes.conf_change.is_none());
    assert_eq!(old, changes.new_metadata);
    Ok(())
}

#[test]
fn test_add_node() -> anyhow::Result<()> {
    let old = metadata_of(&[1, 2, 3], 4);
    let new: Vec<_> = (1..=4).map(consenter).collect();

    let changes = compute_membership_changes(&old, &new)?;
    assert!(changes.changed());
    assert_eq!(vec![consenter(4)], changes.added);
    assert!(changes.removed.is_empty());

    let cc = changes.conf_change.expect("add emits a conf change");
    assert_eq!(ConfChangeType::AddNode, cc.get_change_type());
    assert_eq!(4, cc.get_node_id());

    assert_eq!(5, changes.new_metadata.next_consenter_id);
    assert_eq!(
        btreemap! {
            1 => consenter(1),
            2 => consenter(2),
            3 => consenter(3),
            4 => consenter(4),
        },
        changes.new_metadata.consenters,
    );
    Ok(())
}

#[test]
fn test_remove_node() -> anyhow::Result<()> {
    let old = metadata_of(&[1, 2, 3], 4);
    let new: Vec<_> = (1..=2).map(consenter).collect();

    let changes = compute_membership_changes(&old, &new)?;
    assert!(changes.changed());
    assert_eq!(vec![consenter(3)], changes.removed);

    let cc = changes.conf_change.expect("remove emits a conf change");
    assert_eq!(ConfChangeType::RemoveNode, cc.get_change_type());
    assert_eq!(3, cc.get_node_id());

    // removed ids are never reused
    assert_eq!(4, changes.new_metadata.next_consenter_id);
    assert_eq!(vec![1, 2], raft_peers(&changes.new_metadata));
    Ok(())
}

#[test]
fn test_rotation_keeps_raft_id() -> anyhow::Result<()> {
    let old = metadata_of(&[1, 2, 3], 4);
    let mut rotated = consenter(3);
    rotated.client_tls_cert = b"client-cert-3-rotated".to_vec();
    rotated.server_tls_cert = b"server-cert-3-rotated".to_vec();
    let new = vec![consenter(1), consenter(2), rotated.clone()];

    let changes = compute_membership_changes(&old, &new)?;
    assert!(changes.rotated());
    assert_eq!(3, changes.rotated_node);
    // no change at the raft level, only communication needs reconfiguring
    assert!(changes.conf_change.is_none());
    assert_eq!(4, changes.new_metadata.next_consenter_id);
    assert_eq!(
        btreemap! {
            1 => consenter(1),
            2 => consenter(2),
            3 => rotated,
        },
        changes.new_metadata.consenters,
    );
    Ok(())
}

#[test]
fn test_multiple_changes_rejected() {
    let old = metadata_of(&[1, 2], 3);

    // two additions
    let new: Vec<_> = (1..=4).map(consenter).collect();
    let err = compute_membership_changes(&old, &new).unwrap_err();
    assert_eq!(MembershipChangeError::TooManyChanges { added: 2, removed: 0 }, err);
    assert!(err.to_string().contains("update of more than one consenter at a time"));

    // two removals
    let err = compute_membership_changes(&old, &[]).unwrap_err();
    assert_eq!(MembershipChangeError::TooManyChanges { added: 0, removed: 2 }, err);

    // one addition and two removals
    let err = compute_membership_changes(&old, &[consenter(5)]).unwrap_err();
    assert_eq!(MembershipChangeError::TooManyChanges { added: 1, removed: 2 }, err);
}

#[test]
fn test_metadata_duplication() {
    let clean = ConsensusMetadata {
        consenters: vec![consenter(1), consenter(2)],
        options: None,
    };
    assert!(metadata_has_duplication(&clean).is_ok());

    // duplicated client cert across consenters
    let mut dup = consenter(9);
    dup.client_tls_cert = consenter(1).client_tls_cert;
    let meta = ConsensusMetadata {
        consenters: vec![consenter(1), dup],
        options: None,
    };
    assert!(metadata_has_duplication(&meta).is_err());

    // a server cert reused as another consenter's client cert also counts
    let mut cross = consenter(9);
    cross.client_tls_cert = consenter(1).server_tls_cert;
    let meta = ConsensusMetadata {
        consenters: vec![consenter(1), cross],
        options: None,
    };
    assert!(metadata_has_duplication(&meta).is_err());
}

#[test]
fn test_conf_change_from_state() {
    let metadata = metadata_of(&[1, 2, 3], 4);

    // raft lags behind the metadata: node 3 still needs to be added
    let mut conf_state = ConfState::default();
    conf_state.set_voters(vec![1, 2]);
    let cc = conf_change_from_state(&metadata, &conf_state);
    assert_eq!(ConfChangeType::AddNode, cc.get_change_type());
    assert_eq!(3, cc.get_node_id());

    // raft is ahead of the metadata: node 4 needs to be removed
    let mut conf_state = ConfState::default();
    conf_state.set_voters(vec![1, 2, 3, 4]);
    let cc = conf_change_from_state(&metadata, &conf_state);
    assert_eq!(ConfChangeType::RemoveNode, cc.get_change_type());
    assert_eq!(4, cc.get_node_id());
}

fn config_block_with(consenters: Vec<ConsenterIdentity>) -> Block {
    let update = ConfigUpdate {
        channel_id: "test-channel".to_string(),
        consensus: Some(ConsensusMetadata { consenters, options: None }),
    };
    Block {
        header: BlockHeader {
            number: 5,
            previous_hash: [0u8; 32],
            data_hash: [0u8; 32],
        },
        envelopes: vec![Envelope {
            channel_header: ChannelHeader {
                header_type: HeaderType::Config,
                channel_id: "test-channel".to_string(),
            },
            payload: bincode::serialize(&update).unwrap(),
        }],
        metadata: BlockAttachments::default(),
    }
}

#[test]
fn test_consenter_certificate_predicate() {
    let block = config_block_with(vec![consenter(1), consenter(2)]);

    let member = ConsenterCertificate(consenter(2).server_tls_cert);
    assert!(member.is_consenter_of_channel(&block).is_ok());

    let member_by_client = ConsenterCertificate(consenter(1).client_tls_cert);
    assert!(member_by_client.is_consenter_of_channel(&block).is_ok());

    let stranger = ConsenterCertificate(b"unknown-cert".to_vec());
    assert_eq!(
        Err(MembershipError::NotInChannel),
        stranger.is_consenter_of_channel(&block)
    );
}
