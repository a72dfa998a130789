//! Pulling blocks from the rest of the cluster.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::block::Block;
use crate::error::ClusterError;
use crate::support::ConsenterSupport;

/// Fetches blocks from other ordering nodes.
#[async_trait]
pub trait BlockPuller: Send {
    /// Pull one block; `None` when no endpoint can serve it.
    async fn pull_block(&mut self, seq: u64) -> Option<Block>;

    /// Ledger height per reachable endpoint.
    async fn heights_by_endpoints(&mut self) -> Result<HashMap<String, u64>, ClusterError>;

    fn close(&mut self);
}

/// Creates a [`BlockPuller`] on demand; pullers are single-use and carry
/// connection state.
pub type CreateBlockPuller =
    Arc<dyn Fn() -> Result<Box<dyn BlockPuller>, ClusterError> + Send + Sync>;

/// A [`BlockPuller`] that serves blocks already present in the local ledger
/// directly and only reaches out to the cluster for blocks it does not
/// hold. Catch-up readers stay oblivious to where a block comes from.
pub struct LedgerBlockPuller {
    pub remote: Box<dyn BlockPuller>,
    pub support: Arc<dyn ConsenterSupport>,
}

#[async_trait]
impl BlockPuller for LedgerBlockPuller {
    async fn pull_block(&mut self, seq: u64) -> Option<Block> {
        let last_seq = self.support.height().saturating_sub(1);
        if last_seq >= seq {
            return self.support.block(seq);
        }
        self.remote.pull_block(seq).await
    }

    async fn heights_by_endpoints(&mut self) -> Result<HashMap<String, u64>, ClusterError> {
        self.remote.heights_by_endpoints().await
    }

    fn close(&mut self) {
        self.remote.close()
    }
}

/// Locate and pull the newest config block the cluster has committed.
///
/// Scans reported heights for the highest tip, pulls the tip block, and
/// follows its `last_config_index` attachment.
pub async fn pull_last_config_block(
    puller: &mut dyn BlockPuller,
) -> Result<Block, ClusterError> {
    let heights = puller.heights_by_endpoints().await?;
    let max_height = heights.values().copied().max().ok_or(ClusterError::NoEndpoints)?;
    if max_height == 0 {
        return Err(ClusterError::NoEndpoints);
    }

    let tip_seq = max_height - 1;
    let tip = puller
        .pull_block(tip_seq)
        .await
        .ok_or(ClusterError::MissingBlock(tip_seq))?;

    let config_seq = tip.metadata.last_config_index;
    if config_seq == tip.header.number {
        return Ok(tip);
    }
    puller
        .pull_block(config_seq)
        .await
        .ok_or(ClusterError::MissingBlock(config_seq))
}
