//! Hash-chained block construction.

use sha2::Digest;
use sha2::Sha256;

use crate::block::Block;
use crate::block::BlockAttachments;
use crate::block::BlockHash;
use crate::block::BlockHeader;
use crate::block::Envelope;

/// Produces consecutive blocks on top of a known last block.
///
/// Only a leader that has fully caught up with the committed log may hold
/// one; it is re-seeded from the last committed block on every election.
pub(crate) struct BlockCreator {
    hash: BlockHash,
    number: u64,
}

impl BlockCreator {
    pub(crate) fn new(last_block: &Block) -> Self {
        Self {
            hash: last_block.header.hash(),
            number: last_block.header.number,
        }
    }

    pub(crate) fn create_next_block(&mut self, envelopes: Vec<Envelope>) -> Block {
        self.number += 1;

        let data =
            bincode::serialize(&envelopes).expect("envelope batch encoding cannot fail");
        let header = BlockHeader {
            number: self.number,
            previous_hash: self.hash,
            data_hash: Sha256::digest(&data).into(),
        };
        self.hash = header.hash();

        Block {
            header,
            envelopes,
            metadata: BlockAttachments::default(),
        }
    }
}

#[cfg(test)]
mod creator_test {
    use super::*;
    use crate::block::ChannelHeader;
    use crate::block::HeaderType;

    fn envelope(n: u8) -> Envelope {
        Envelope {
            channel_header: ChannelHeader {
                header_type: HeaderType::Message,
                channel_id: "test-channel".to_string(),
            },
            payload: vec![n],
        }
    }

    fn genesis() -> Block {
        Block {
            header: BlockHeader {
                number: 0,
                previous_hash: [0u8; 32],
                data_hash: [0u8; 32],
            },
            envelopes: vec![],
            metadata: BlockAttachments::default(),
        }
    }

    #[test]
    fn test_numbers_are_consecutive() {
        let genesis = genesis();
        let mut bc = BlockCreator::new(&genesis);

        for expected in 1..=5u64 {
            let block = bc.create_next_block(vec![envelope(expected as u8)]);
            assert_eq!(expected, block.header.number);
        }
    }

    #[test]
    fn test_blocks_are_hash_chained() {
        let genesis = genesis();
        let mut bc = BlockCreator::new(&genesis);

        let b1 = bc.create_next_block(vec![envelope(1)]);
        let b2 = bc.create_next_block(vec![envelope(2)]);

        assert_eq!(genesis.header.hash(), b1.header.previous_hash);
        assert_eq!(b1.header.hash(), b2.header.previous_hash);
        assert_ne!(b1.header.data_hash, [0u8; 32]);
    }

    #[test]
    fn test_reseeding_continues_the_chain() {
        let mut bc = BlockCreator::new(&genesis());
        let b1 = bc.create_next_block(vec![envelope(1)]);

        // a new leader starts from the last committed block
        let mut bc2 = BlockCreator::new(&b1);
        let b2 = bc2.create_next_block(vec![envelope(2)]);
        assert_eq!(2, b2.header.number);
        assert_eq!(b1.header.hash(), b2.header.previous_hash);
    }
}
