//! Detecting eviction from the channel.
//!
//! A node that has been removed by a config block it never received sees
//! only one symptom: no leader, for a long time. The [`PeriodicCheck`]
//! measures how long the symptom holds; once it exceeds the suspicion
//! threshold, the [`EvictionSuspector`] pulls the latest config block from
//! the cluster and checks whether this node's certificate is still in the
//! consenter set. An evicted node backfills its ledger up to the eviction
//! block before shutting down, so the ledger records its own removal.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use raft::eraftpb::Snapshot;
use tokio::time::Instant;

use crate::block::Block;
use crate::error::LedgerError;
use crate::error::MembershipError;
use crate::puller::pull_last_config_block;
use crate::puller::CreateBlockPuller;

/// Evaluates a condition at a fixed interval and reports the cumulative
/// consecutive duration it has held.
///
/// The timer is a one-shot sleep re-armed after each check completes, so a
/// slow report callback delays the next check instead of piling up ticks.
pub struct PeriodicCheck {
    pub check_interval: Duration,
    pub condition: Box<dyn Fn() -> bool + Send + Sync>,
    pub report: Box<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>,
    started: AtomicBool,
    stopped: AtomicU32,
}

impl PeriodicCheck {
    pub fn new(
        check_interval: Duration,
        condition: Box<dyn Fn() -> bool + Send + Sync>,
        report: Box<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            check_interval,
            condition,
            report,
            started: AtomicBool::new(false),
            stopped: AtomicU32::new(0),
        })
    }

    /// Start checking. Only the first activation takes effect.
    pub fn run(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut holds_since: Option<Instant> = None;
            loop {
                if (this.condition)() {
                    let since = *holds_since.get_or_insert_with(Instant::now);
                    (this.report)(since.elapsed()).await;
                } else {
                    holds_since = None;
                }

                if !this.should_run() {
                    tracing::info!("periodic check is stopping");
                    return;
                }
                tokio::time::sleep(this.check_interval).await;
            }
        });
    }

    pub fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn should_run(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) == 0
    }
}

/// Confirms or refutes a suspicion of eviction raised by a sustained
/// no-leader signal.
pub struct EvictionSuspector {
    eviction_suspicion_threshold: Duration,
    create_puller: CreateBlockPuller,
    height: Box<dyn Fn() -> u64 + Send + Sync>,
    am_i_in_channel: Box<dyn Fn(&Block) -> Result<(), MembershipError> + Send + Sync>,
    halt: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
    write_block: Box<dyn Fn(Block) -> Result<(), LedgerError> + Send + Sync>,
    trigger_catch_up: Box<dyn Fn(Snapshot) -> BoxFuture<'static, ()> + Send + Sync>,
    halted: AtomicBool,
}

impl EvictionSuspector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        eviction_suspicion_threshold: Duration,
        create_puller: CreateBlockPuller,
        height: Box<dyn Fn() -> u64 + Send + Sync>,
        am_i_in_channel: Box<dyn Fn(&Block) -> Result<(), MembershipError> + Send + Sync>,
        halt: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
        write_block: Box<dyn Fn(Block) -> Result<(), LedgerError> + Send + Sync>,
        trigger_catch_up: Box<dyn Fn(Snapshot) -> BoxFuture<'static, ()> + Send + Sync>,
    ) -> Self {
        Self {
            eviction_suspicion_threshold,
            create_puller,
            height,
            am_i_in_channel,
            halt,
            write_block,
            trigger_catch_up,
            halted: AtomicBool::new(false),
        }
    }

    pub async fn confirm_suspicion(&self, cumulative_suspicion: Duration) {
        if self.eviction_suspicion_threshold > cumulative_suspicion
            || self.halted.load(Ordering::SeqCst)
        {
            return;
        }
        tracing::info!(
            "suspecting our own eviction from the channel for {:?}",
            cumulative_suspicion
        );

        let mut puller = match (self.create_puller)() {
            Ok(puller) => puller,
            Err(e) => panic!("failed creating a block puller: {}", e),
        };

        let last_config_block = match pull_last_config_block(puller.as_mut()).await {
            Ok(block) => block,
            Err(e) => {
                tracing::error!("failed pulling the last config block: {}", e);
                return;
            }
        };
        tracing::info!(
            block = last_config_block.header.number,
            "found the cluster's last config block"
        );

        let height = (self.height)();
        if last_config_block.header.number + 1 <= height {
            tracing::info!(
                height,
                "our height is higher or equal than the height of the orderer we pulled the last block from, aborting"
            );
            return;
        }

        match (self.am_i_in_channel)(&last_config_block) {
            Err(MembershipError::NotInChannel) | Err(MembershipError::Forbidden) => {}
            verdict => {
                match verdict {
                    Ok(()) => tracing::info!(
                        block = last_config_block.header.number,
                        "cannot confirm our own eviction, our certificate was found in the config block"
                    ),
                    Err(e) => tracing::info!(
                        "cannot confirm our own eviction from the channel: {}",
                        e
                    ),
                }
                // we are merely behind: craft an artificial snapshot
                // (index 0) around the pulled config block so the chain
                // catches its ledger up without touching raft state
                let mut snapshot = Snapshot::default();
                snapshot.set_data(last_config_block.encode().into());
                (self.trigger_catch_up)(snapshot).await;
                return;
            }
        }

        tracing::warn!(
            block = last_config_block.header.number,
            "detected our own eviction from the channel"
        );

        tracing::info!("waiting for chain to halt");
        (self.halt)().await;
        self.halted.store(true, Ordering::SeqCst);
        tracing::info!("chain has been halted, pulling remaining blocks up to (and including) the eviction block");

        for seq in height..=last_config_block.header.number {
            tracing::info!(seq, "pulling block");
            let block = match puller.pull_block(seq).await {
                Some(block) => block,
                None => panic!("failed to fetch block {} from cluster", seq),
            };
            if let Err(e) = (self.write_block)(block) {
                panic!("failed writing block {} to the ledger: {}", seq, e);
            }
        }

        tracing::info!("pulled all blocks up to the eviction block");
    }
}
