//! The chain state machine.
//!
//! One cooperative loop per chain owns all mutable chain state and
//! multiplexes its inputs: submissions, raft apply events, the batch timer,
//! snapshots and shutdown. Everything the loop must not block on (raft
//! proposals, snapshot writing) runs on auxiliary tasks fed through
//! bounded channels.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::FutureExt;
use parking_lot::Mutex as PlMutex;
use parking_lot::RwLock;
use protobuf::Message as PbMessage;
use raft::eraftpb::ConfChange;
use raft::eraftpb::ConfChangeType;
use raft::eraftpb::ConfState;
use raft::eraftpb::Entry;
use raft::eraftpb::EntryType;
use raft::eraftpb::Message;
use raft::eraftpb::Snapshot;
use raft::storage::MemStorage;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::block::Block;
use crate::block::BlockMetadata;
use crate::block::Envelope;
use crate::block::HeaderType;
use crate::config::Options;
use crate::creator::BlockCreator;
use crate::error::ChainError;
use crate::error::ChainInitError;
use crate::error::ClusterError;
use crate::error::NodeError;
use crate::eviction::EvictionSuspector;
use crate::eviction::PeriodicCheck;
use crate::membership::compute_membership_changes;
use crate::membership::conf_change_from_state;
use crate::membership::metadata_has_duplication;
use crate::membership::raft_peers;
use crate::membership::ConsenterCertificate;
use crate::membership::MembershipChanges;
use crate::message::ConsensusRequest;
use crate::message::SubmitRequest;
use crate::node::is_empty_snapshot;
use crate::node::ApplyEvent;
use crate::node::NodeHandle;
use crate::node::NodeStatus;
use crate::node::RaftNode;
use crate::puller::CreateBlockPuller;
use crate::storage::wal_exists;
use crate::storage::RaftStorage;
use crate::support::BlockCutter;
use crate::support::Configurator;
use crate::support::ConsenterSupport;
use crate::support::RemoteNode;
use crate::support::Transport;

/// A submission delivered to the chain loop.
enum SubmitMsg {
    /// `wait_ready` probe: answered as soon as the loop can take input.
    Poll(oneshot::Sender<()>),
    Request {
        request: SubmitRequest,
        /// Receives the raft id of the current leader, or
        /// `raft::INVALID_ID` when there is none.
        leader_reply: oneshot::Sender<u64>,
    },
}

/// Snapshot request handed to the snapshotter task.
pub(crate) struct SnapshotRequest {
    index: u64,
    conf_state: ConfState,
    /// Serialized last applied block; becomes the snapshot payload.
    data: Vec<u8>,
}

/// Handle observing loss of leadership, as exposed by [`Chain::errored`].
///
/// It reads `true` whenever the cluster has no leader (only reported for
/// clusters of more than two nodes) or the chain has stopped.
#[derive(Clone)]
pub struct Errored {
    rx: watch::Receiver<bool>,
}

impl Errored {
    pub fn is_errored(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the chain reports an error state.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|errored| *errored).await;
    }
}

struct ChainInner {
    raft_id: u64,
    channel_id: String,

    support: Arc<dyn ConsenterSupport>,
    transport: Arc<dyn Transport>,
    create_puller: CreateBlockPuller,

    submit_tx: mpsc::Sender<SubmitMsg>,
    snap_tx: mpsc::Sender<Snapshot>,
    halt_tx: mpsc::Sender<()>,
    done_rx: watch::Receiver<bool>,
    error_rx: watch::Receiver<bool>,

    node: NodeHandle,
    metadata: Arc<RwLock<BlockMetadata>>,
    last_known_leader: Arc<AtomicU64>,

    started: AtomicBool,
    periodic_check: OnceLock<Arc<PeriodicCheck>>,

    cert: Vec<u8>,
    eviction_suspicion: Duration,
    leader_check_interval: Duration,

    core: PlMutex<Option<ChainCore>>,
}

/// A raft-backed ordering chain.
///
/// Cloning yields another handle to the same chain.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<ChainInner>,
}

impl Chain {
    /// Construct a chain over its collaborators. The chain does nothing
    /// until [`start`](Chain::start) is called.
    pub fn new(
        support: Arc<dyn ConsenterSupport>,
        opts: Options,
        configurator: Arc<dyn Configurator>,
        transport: Arc<dyn Transport>,
        create_puller: CreateBlockPuller,
        observe: Option<watch::Sender<NodeStatus>>,
    ) -> Result<Chain, ChainInitError> {
        opts.validate()?;
        let channel_id = support.chain_id();

        let fresh = !wal_exists(&opts.wal_dir);
        let ram = opts.memory_storage.clone().unwrap_or_else(MemStorage::new);
        let storage =
            RaftStorage::create(&opts.wal_dir, &opts.snap_dir, ram, opts.catch_up_entries())?;

        // block number and conf state recorded in the last local snapshot
        let snapshot = storage.durable_snapshot();
        let (last_snap_block_num, conf_state) = if !is_empty_snapshot(&snapshot) {
            let block =
                Block::decode(snapshot.get_data()).map_err(ChainInitError::SnapshotBlock)?;
            (
                block.header.number,
                snapshot.get_metadata().get_conf_state().clone(),
            )
        } else {
            (0, ConfState::default())
        };

        let height = support.height();
        let last_block = support
            .block(height.saturating_sub(1))
            .ok_or(ChainInitError::LastBlockMissing { height })?;

        // a fresh node that is not joining an existing channel seeds raft
        // with the consenter set from the genesis metadata; a joining node
        // starts empty and is caught up by a snapshot from the leader
        let join = height > 1;
        if fresh {
            if join {
                tracing::info!(
                    channel = %channel_id,
                    "starting raft node to join an existing channel"
                );
            } else {
                tracing::info!(channel = %channel_id, "starting fresh raft node");
                storage.bootstrap(raft_peers(&opts.block_metadata));
            }
        } else {
            tracing::info!(channel = %channel_id, "restarting raft node");
        }

        let (submit_tx, submit_rx) = mpsc::channel(1);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = mpsc::channel(1);
        let (halt_tx, halt_rx) = mpsc::channel(1);
        let (gc_tx, gc_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let (error_tx, error_rx) = watch::channel(false);

        let metadata = Arc::new(RwLock::new(opts.block_metadata.clone()));
        let last_known_leader = Arc::new(AtomicU64::new(raft::INVALID_ID));

        let (node, node_actor) = RaftNode::new(
            channel_id.clone(),
            &opts,
            storage,
            transport.clone(),
            apply_tx,
            done_rx.clone(),
        )?;

        let core = ChainCore {
            raft_id: opts.raft_id,
            channel_id: channel_id.clone(),
            support: support.clone(),
            cutter: support.block_cutter(),
            configurator,
            create_puller: create_puller.clone(),
            node: node.clone(),
            metadata: metadata.clone(),
            last_known_leader: last_known_leader.clone(),
            max_inflight_msgs: opts.max_inflight_msgs,
            applied_index: opts.block_metadata.raft_index,
            last_block,
            size_limit: opts.snapshot_interval(),
            acc_data_size: 0,
            last_snap_block_num,
            conf_state,
            conf_change_in_progress: None,
            just_elected: false,
            config_inflight: false,
            block_inflight: 0,
            submit_rx,
            apply_rx,
            snap_rx,
            halt_rx,
            halt_tx: halt_tx.clone(),
            gc_tx,
            gc_rx: Some(gc_rx),
            done_tx,
            done_rx: done_rx.clone(),
            error_tx,
            observe,
            node_actor: Some(node_actor),
        };

        let inner = Arc::new(ChainInner {
            raft_id: opts.raft_id,
            channel_id,
            support,
            transport,
            create_puller,
            submit_tx,
            snap_tx,
            halt_tx,
            done_rx,
            error_rx,
            node,
            metadata,
            last_known_leader,
            started: AtomicBool::new(false),
            periodic_check: OnceLock::new(),
            cert: opts.cert.clone(),
            eviction_suspicion: opts.eviction_suspicion(),
            leader_check_interval: opts.leader_check_interval(),
            core: PlMutex::new(None),
        });
        *inner.core.lock() = Some(core);

        Ok(Chain { inner })
    }

    /// Begin serving the chain: spawns the raft actor, the main loop, the
    /// snapshotter and the eviction check. Idempotent; must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let mut guard = self.inner.core.lock();
        let Some(mut core) = guard.take() else {
            tracing::warn!("chain is already started");
            return;
        };
        drop(guard);

        tracing::info!(channel = %self.inner.channel_id, "starting raft node");

        if let Err(e) = core.configure_comm() {
            tracing::error!("failed to start chain, aborting: {}", e);
            let _ = core.done_tx.send(true);
            return;
        }

        let node_actor = core.node_actor.take().expect("chain is started once");
        let gc_rx = core.gc_rx.take().expect("chain is started once");

        self.inner.started.store(true, Ordering::SeqCst);
        // errored until the first leader is found
        let _ = core.error_tx.send(true);

        tokio::spawn(node_actor.run());
        tokio::spawn(snapshotter(
            gc_rx,
            self.inner.node.clone(),
            self.inner.done_rx.clone(),
        ));

        let periodic_check = self.periodic_check();
        self.inner
            .periodic_check
            .set(periodic_check.clone())
            .unwrap_or_else(|_| unreachable!("chain is started once"));

        tokio::spawn(core.serve_requests(periodic_check.clone()));
        periodic_check.run();
    }

    /// Submit a normal transaction for ordering.
    pub async fn order(
        &self,
        envelope: Envelope,
        last_validation_seq: u64,
    ) -> Result<(), ChainError> {
        self.submit(
            SubmitRequest {
                channel: self.inner.channel_id.clone(),
                last_validation_seq,
                payload: envelope,
            },
            0,
        )
        .await
    }

    /// Submit a configuration transaction for ordering.
    ///
    /// The update must be an orderer transaction, or a config update whose
    /// consenter-set change (if any) is a legal single-step change.
    pub async fn configure(
        &self,
        envelope: Envelope,
        last_validation_seq: u64,
    ) -> Result<(), ChainError> {
        if let Err(e) = check_config_update_validity(&envelope, &self.inner.metadata) {
            tracing::warn!(channel = %self.inner.channel_id, "rejected config proposal: {}", e);
            return Err(e);
        }
        self.submit(
            SubmitRequest {
                channel: self.inner.channel_id.clone(),
                last_validation_seq,
                payload: envelope,
            },
            0,
        )
        .await
    }

    /// Deliver a request to the chain loop. If this node is not the
    /// leader, the request is forwarded to the leader over the transport.
    /// Fails when the local view has no raft leader.
    pub async fn submit(&self, request: SubmitRequest, _sender: u64) -> Result<(), ChainError> {
        self.inner.is_running()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = SubmitMsg::Request {
            request: request.clone(),
            leader_reply: reply_tx,
        };

        let mut done = self.inner.done_rx.clone();
        tokio::select! {
            sent = self.inner.submit_tx.send(msg) => {
                if sent.is_err() {
                    return Err(ChainError::Stopped);
                }
            }
            _ = wait_done(&mut done) => return Err(ChainError::Stopped),
        }

        let leader = tokio::select! {
            reply = reply_rx => reply.map_err(|_| ChainError::Stopped)?,
            _ = wait_done(&mut done) => return Err(ChainError::Stopped),
        };

        if leader == raft::INVALID_ID {
            return Err(ChainError::NoLeader);
        }
        if leader != self.inner.raft_id {
            self.inner
                .transport
                .send_submit(leader, request)
                .await
                .map_err(|e| ChainError::ForwardFailed {
                    leader,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Block until the chain loop can accept a submission. Serializes the
    /// caller with snapshot catch-up.
    pub async fn wait_ready(&self) -> Result<(), ChainError> {
        self.inner.is_running()?;

        let (tx, rx) = oneshot::channel();
        let mut done = self.inner.done_rx.clone();
        tokio::select! {
            sent = self.inner.submit_tx.send(SubmitMsg::Poll(tx)) => {
                if sent.is_err() {
                    return Err(ChainError::Stopped);
                }
            }
            _ = wait_done(&mut done) => return Err(ChainError::Stopped),
        }
        tokio::select! {
            reply = rx => reply.map_err(|_| ChainError::Stopped),
            _ = wait_done(&mut done) => Err(ChainError::Stopped),
        }
    }

    /// Step a raft protocol message received from another consenter.
    pub async fn consensus(
        &self,
        request: ConsensusRequest,
        _sender: u64,
    ) -> Result<(), ChainError> {
        self.inner.is_running()?;

        let message = Message::parse_from_bytes(&request.payload)
            .map_err(|e| ChainError::BadConsensusPayload(e.to_string()))?;
        match self.inner.node.step(message).await {
            Ok(()) => Ok(()),
            Err(NodeError::Stopped) => Err(ChainError::Stopped),
            Err(NodeError::Raft(e)) => Err(ChainError::Step(e.to_string())),
        }
    }

    /// A handle signaled whenever no leader is present.
    pub fn errored(&self) -> Errored {
        Errored {
            rx: self.inner.error_rx.clone(),
        }
    }

    /// Stop the chain and wait until the loop has exited. Idempotent.
    pub async fn halt(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            tracing::warn!("attempted to halt a chain that has not started");
            return;
        }

        let mut done = self.inner.done_rx.clone();
        tokio::select! {
            sent = self.inner.halt_tx.send(()) => {
                if sent.is_err() {
                    return;
                }
            }
            _ = wait_done(&mut done) => return,
        }
        wait_done(&mut done).await;
    }

    /// Drop a snapshot on the catch-up channel, as the eviction suspector
    /// would.
    #[cfg(test)]
    pub(crate) async fn inject_snapshot(&self, snapshot: Snapshot) {
        self.inner.trigger_catch_up(snapshot).await
    }

    fn periodic_check(&self) -> Arc<PeriodicCheck> {
        let suspector = Arc::new(self.eviction_suspector());
        let inner = self.inner.clone();

        PeriodicCheck::new(
            self.inner.leader_check_interval,
            Box::new(move || inner.suspect_eviction()),
            Box::new(move |cumulative| {
                let suspector = suspector.clone();
                async move { suspector.confirm_suspicion(cumulative).await }.boxed()
            }),
        )
    }

    fn eviction_suspector(&self) -> EvictionSuspector {
        let cert = ConsenterCertificate(self.inner.cert.clone());
        let height_support = self.inner.support.clone();
        let append_support = self.inner.support.clone();
        let halt_chain = self.clone();
        let catch_up_inner = self.inner.clone();

        EvictionSuspector::new(
            self.inner.eviction_suspicion,
            self.inner.create_puller.clone(),
            Box::new(move || height_support.height()),
            Box::new(move |block| cert.is_consenter_of_channel(block)),
            Box::new(move || {
                let chain = halt_chain.clone();
                async move { chain.halt().await }.boxed()
            }),
            Box::new(move |block| append_support.append(block)),
            Box::new(move |snapshot| {
                let inner = catch_up_inner.clone();
                async move { inner.trigger_catch_up(snapshot).await }.boxed()
            }),
        )
    }
}

impl ChainInner {
    fn is_running(&self) -> Result<(), ChainError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ChainError::NotStarted);
        }
        if *self.done_rx.borrow() {
            return Err(ChainError::Stopped);
        }
        Ok(())
    }

    fn suspect_eviction(&self) -> bool {
        if self.is_running().is_err() {
            return false;
        }
        self.last_known_leader.load(Ordering::SeqCst) == raft::INVALID_ID
    }

    async fn trigger_catch_up(&self, snapshot: Snapshot) {
        let mut done = self.done_rx.clone();
        tokio::select! {
            _ = self.snap_tx.send(snapshot) => {}
            _ = wait_done(&mut done) => {}
        }
    }
}

struct ChainCore {
    raft_id: u64,
    channel_id: String,

    support: Arc<dyn ConsenterSupport>,
    cutter: Arc<PlMutex<dyn BlockCutter>>,
    configurator: Arc<dyn Configurator>,
    create_puller: CreateBlockPuller,
    node: NodeHandle,

    metadata: Arc<RwLock<BlockMetadata>>,
    last_known_leader: Arc<AtomicU64>,

    max_inflight_msgs: usize,
    applied_index: u64,
    last_block: Block,

    size_limit: u32,
    acc_data_size: u32,
    last_snap_block_num: u64,
    conf_state: ConfState,

    conf_change_in_progress: Option<ConfChange>,
    just_elected: bool,
    config_inflight: bool,
    block_inflight: usize,

    submit_rx: mpsc::Receiver<SubmitMsg>,
    apply_rx: mpsc::UnboundedReceiver<ApplyEvent>,
    snap_rx: mpsc::Receiver<Snapshot>,
    halt_rx: mpsc::Receiver<()>,
    halt_tx: mpsc::Sender<()>,
    gc_tx: mpsc::Sender<SnapshotRequest>,
    gc_rx: Option<mpsc::Receiver<SnapshotRequest>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    error_tx: watch::Sender<bool>,
    observe: Option<watch::Sender<NodeStatus>>,

    node_actor: Option<RaftNode>,
}

impl ChainCore {
    #[tracing::instrument(level = "debug", skip_all, fields(channel = %self.channel_id, node = self.raft_id))]
    async fn serve_requests(mut self, periodic_check: Arc<PeriodicCheck>) {
        let mut status = NodeStatus::default();
        let mut accepting = true;
        let mut creator: Option<BlockCreator> = None;
        let mut proposer: Option<(mpsc::Sender<Block>, AbortHandle)> = None;
        let mut batch_timer: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            tokio::select! {
                Some(msg) = self.submit_rx.recv(), if accepting => {
                    let (request, leader_reply) = match msg {
                        SubmitMsg::Poll(reply) => {
                            let _ = reply.send(());
                            continue;
                        }
                        SubmitMsg::Request { request, leader_reply } => (request, leader_reply),
                    };

                    if status.is_candidate() {
                        let _ = leader_reply.send(raft::INVALID_ID);
                        continue;
                    }
                    let _ = leader_reply.send(status.leader);
                    if status.leader != self.raft_id {
                        // the submitter forwards to the actual leader
                        continue;
                    }

                    match self.ordered(request) {
                        Err(e) => {
                            tracing::error!("failed to order message: {}", e);
                        }
                        Ok((batches, pending)) => {
                            if pending {
                                if batch_timer.is_none() {
                                    let timeout = self.support.shared_config().batch_timeout();
                                    batch_timer = Some(Box::pin(tokio::time::sleep(timeout)));
                                }
                            } else {
                                batch_timer = None;
                            }
                            self.propose(&mut creator, proposer.as_ref().map(|p| &p.0), batches);
                        }
                    }

                    if self.config_inflight {
                        tracing::info!("received config block, pause accepting transactions till it is committed");
                        accepting = false;
                    } else if self.block_inflight >= self.max_inflight_msgs {
                        tracing::debug!(
                            in_flight = self.block_inflight,
                            limit = self.max_inflight_msgs,
                            "in-flight blocks reach limit, pause accepting transactions"
                        );
                        accepting = false;
                    }
                }

                Some(event) = self.apply_rx.recv() => {
                    if let Some(new_status) = event.status {
                        if new_status.leader != status.leader {
                            tracing::info!(
                                "raft leader changed: {} -> {}",
                                status.leader, new_status.leader
                            );
                            self.last_known_leader.store(new_status.leader, Ordering::SeqCst);

                            if new_status.leader == self.raft_id {
                                let (prop_tx, abort) = self.become_leader();
                                proposer = Some((prop_tx, abort));
                                accepting = false;
                            }
                            if status.leader == self.raft_id {
                                self.become_follower(&mut proposer, &mut creator, &mut batch_timer);
                                accepting = true;
                            }
                        }

                        let found_leader = status.leader == raft::INVALID_ID
                            && new_status.leader != raft::INVALID_ID;
                        let quit_candidate = status.is_candidate() && !new_status.is_candidate();
                        if found_leader || quit_candidate {
                            let _ = self.error_tx.send(false);
                        }

                        if new_status.is_candidate() || new_status.leader == raft::INVALID_ID {
                            self.last_known_leader.store(raft::INVALID_ID, Ordering::SeqCst);
                            if !*self.error_tx.borrow() {
                                let node_count = self.metadata.read().consenters.len();
                                // a cluster of 1 or 2 nodes loses its leader
                                // while expanding; that must not be surfaced
                                // as a consensus error
                                if node_count > 2 {
                                    let _ = self.error_tx.send(true);
                                } else {
                                    tracing::warn!(
                                        cluster_size = node_count,
                                        "no leader is present"
                                    );
                                }
                            }
                        }

                        status = new_status;
                        if let Some(observe) = &self.observe {
                            let _ = observe.send(status);
                        }
                    }

                    if let Some(snapshot) = &event.snapshot {
                        self.handle_snapshot(snapshot).await;
                    }

                    self.apply(event.entries).await;

                    if self.just_elected {
                        let Ok(last_index) = self.node.last_index().await else {
                            continue;
                        };
                        if last_index > self.applied_index {
                            tracing::debug!("there are in-flight blocks, new leader should not serve requests");
                            continue;
                        }
                        if self.config_inflight {
                            tracing::debug!("there is a config block in flight, new leader should not serve requests");
                            continue;
                        }

                        tracing::info!(
                            block = self.last_block.header.number,
                            "start accepting requests as raft leader"
                        );
                        creator = Some(BlockCreator::new(&self.last_block));
                        accepting = true;
                        self.just_elected = false;
                    } else if self.config_inflight {
                        tracing::info!("config block or config change in flight, pause accepting transactions");
                        accepting = false;
                    } else if self.block_inflight < self.max_inflight_msgs {
                        accepting = true;
                    }
                }

                () = async { batch_timer.as_mut().expect("armed").await }, if batch_timer.is_some() => {
                    batch_timer = None;

                    let batch = self.cutter.lock().cut();
                    if batch.is_empty() {
                        tracing::warn!("batch timer expired with no pending requests, this might indicate a bug");
                        continue;
                    }

                    tracing::debug!("batch timer expired, creating block");
                    self.propose(&mut creator, proposer.as_ref().map(|p| &p.0), vec![batch]);
                }

                Some(snapshot) = self.snap_rx.recv() => {
                    self.handle_snapshot(&snapshot).await;
                }

                Some(()) = self.halt_rx.recv() => {
                    if let Some((_, abort)) = proposer.take() {
                        abort.abort();
                    }
                    if !*self.error_tx.borrow() {
                        let _ = self.error_tx.send(true);
                    }
                    tracing::info!("stop serving requests");
                    periodic_check.stop();
                    let _ = self.done_tx.send(true);
                    return;
                }
            }
        }
    }

    /// Take over leader duties: reset in-flight accounting and spawn the
    /// proposal task. Re-proposes an unfinished config change left behind
    /// by the previous leader.
    fn become_leader(&mut self) -> (mpsc::Sender<Block>, AbortHandle) {
        self.block_inflight = 0;
        self.just_elected = true;

        if let Some(cc) = self.in_flight_conf_change() {
            let node = self.node.clone();
            let resumed = cc.clone();
            tokio::spawn(async move {
                if let Err(e) = node.propose_conf_change(resumed).await {
                    tracing::warn!("failed to propose configuration update to raft node: {}", e);
                }
            });
            self.conf_change_in_progress = Some(cc);
            self.config_inflight = true;
        }

        // proposing must not run on this loop: a leaderless hiccup would
        // stall apply processing and deadlock the chain
        let (prop_tx, mut prop_rx) = mpsc::channel::<Block>(self.max_inflight_msgs);
        let node = self.node.clone();
        let (abort, registration) = AbortHandle::new_pair();
        let proposing = Abortable::new(
            async move {
                while let Some(block) = prop_rx.recv().await {
                    let number = block.header.number;
                    if let Err(e) = node.propose(block.encode()).await {
                        tracing::error!(
                            block = number,
                            "failed to propose block to raft, discarding queued blocks: {}",
                            e
                        );
                        return;
                    }
                    tracing::debug!(block = number, "proposed block to raft consensus");
                }
            },
            registration,
        );
        tokio::spawn(async move {
            if proposing.await.is_err() {
                tracing::debug!("quit proposing blocks");
            }
        });

        (prop_tx, abort)
    }

    fn become_follower(
        &mut self,
        proposer: &mut Option<(mpsc::Sender<Block>, AbortHandle)>,
        creator: &mut Option<BlockCreator>,
        batch_timer: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>,
    ) {
        if let Some((_, abort)) = proposer.take() {
            abort.abort();
        }
        self.block_inflight = 0;
        let _ = self.cutter.lock().cut();
        *batch_timer = None;
        *creator = None;
    }

    /// Order one submission: classify, re-validate if the config sequence
    /// advanced, and cut batches. Returns the batches to propose and
    /// whether an envelope is still pending.
    fn ordered(
        &mut self,
        request: SubmitRequest,
    ) -> Result<(Vec<Vec<Envelope>>, bool), ChainError> {
        let seq = self.support.sequence();
        let mut payload = request.payload;

        if payload.is_config() {
            if request.last_validation_seq < seq {
                tracing::warn!(
                    validated_against = request.last_validation_seq,
                    current = seq,
                    "config message was validated against an older config sequence, re-validating"
                );
                let (reprocessed, _seq) = self
                    .support
                    .process_config_msg(&payload)
                    .map_err(ChainError::BadConfigMessage)?;
                payload = reprocessed;
                check_config_update_validity(&payload, &self.metadata)
                    .map_err(|e| ChainError::BadConfigMessage(e.to_string()))?;
            }

            // cut-on-config: flush the open batch, then the config envelope
            // rides alone
            let batch = self.cutter.lock().cut();
            let mut batches = Vec::new();
            if !batch.is_empty() {
                batches.push(batch);
            }
            batches.push(vec![payload]);
            return Ok((batches, false));
        }

        if request.last_validation_seq < seq {
            tracing::warn!(
                validated_against = request.last_validation_seq,
                current = seq,
                "normal message was validated against an older config sequence, re-validating"
            );
            self.support
                .process_normal_msg(&payload)
                .map_err(ChainError::BadNormalMessage)?;
        }
        let (batches, pending) = self.cutter.lock().ordered(payload);
        Ok((batches, pending))
    }

    /// Create blocks out of batches and hand them to the proposal task.
    fn propose(
        &mut self,
        creator: &mut Option<BlockCreator>,
        prop_tx: Option<&mpsc::Sender<Block>>,
        batches: Vec<Vec<Envelope>>,
    ) {
        for batch in batches {
            let creator = creator
                .as_mut()
                .unwrap_or_else(|| panic!("programming error: block creator is not initialized"));
            let prop_tx = prop_tx
                .unwrap_or_else(|| panic!("programming error: proposal task is not running"));

            let block = creator.create_next_block(batch);
            tracing::debug!(
                block = block.header.number,
                in_flight = self.block_inflight,
                "created block"
            );

            let is_config = block.is_config();
            if prop_tx.try_send(block).is_err() {
                panic!("programming error: limit of in-flight blocks does not properly take effect or block is proposed by follower");
            }

            // a config block must commit before anything else is ordered
            if is_config {
                self.config_inflight = true;
            }
            self.block_inflight += 1;
        }
    }

    /// Apply committed raft entries in log order.
    async fn apply(&mut self, entries: Vec<Entry>) {
        if entries.is_empty() {
            return;
        }

        if entries[0].get_index() > self.applied_index + 1 {
            panic!(
                "first index of committed entry [{}] should <= applied index [{}] + 1",
                entries[0].get_index(),
                self.applied_index
            );
        }

        let mut applied_block_number = 0;
        let mut position = 0;

        for (i, entry) in entries.iter().enumerate() {
            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    // empty payloads are raft-internal no-ops
                    if entry.get_data().is_empty() {
                        // nothing to write
                    } else if entry.get_index() <= self.applied_index {
                        tracing::debug!(
                            index = entry.get_index(),
                            applied = self.applied_index,
                            "received block with old raft index, skip"
                        );
                    } else {
                        let block = Block::decode(entry.get_data()).unwrap_or_else(|e| {
                            panic!("failed to unmarshal block carried by raft entry: {}", e)
                        });
                        self.write_block(block, entry.get_index()).await;

                        applied_block_number = self.last_block.header.number;
                        position = i;
                        self.acc_data_size += entry.get_data().len() as u32;
                    }
                }

                EntryType::EntryConfChange => {
                    let cc = match ConfChange::parse_from_bytes(entry.get_data()) {
                        Ok(cc) => cc,
                        Err(e) => {
                            tracing::warn!("failed to unmarshal conf change data: {}", e);
                            continue;
                        }
                    };

                    match self.node.apply_conf_change(cc.clone()).await {
                        Ok(conf_state) => self.conf_state = conf_state,
                        Err(NodeError::Stopped) => return,
                        Err(NodeError::Raft(e)) => {
                            panic!("failed to apply configuration change: {}", e)
                        }
                    }

                    match cc.get_change_type() {
                        ConfChangeType::AddNode => tracing::info!(
                            node = cc.get_node_id(),
                            nodes = ?self.conf_state.get_voters(),
                            "applied config change to add node"
                        ),
                        ConfChangeType::RemoveNode => tracing::info!(
                            node = cc.get_node_id(),
                            nodes = ?self.conf_state.get_voters(),
                            "applied config change to remove node"
                        ),
                        _ => panic!("programming error: encountered unsupported raft config change"),
                    }

                    // the conf change introduced by a previously committed
                    // config block has landed; submissions may resume
                    let matches_in_progress = self
                        .conf_change_in_progress
                        .as_ref()
                        .map(|in_progress| {
                            in_progress.get_node_id() == cc.get_node_id()
                                && in_progress.get_change_type() == cc.get_change_type()
                        })
                        .unwrap_or(false);
                    if matches_in_progress {
                        if let Err(e) = self.configure_comm() {
                            panic!("failed to configure communication: {}", e);
                        }
                        self.conf_change_in_progress = None;
                        self.config_inflight = false;
                    }

                    if cc.get_change_type() == ConfChangeType::RemoveNode
                        && cc.get_node_id() == self.raft_id
                    {
                        tracing::info!(
                            channel = %self.channel_id,
                            "current node removed from replica set"
                        );
                        // halting writes into the halt channel this loop
                        // consumes; it must run on its own task
                        spawn_halt(self.halt_tx.clone(), self.done_rx.clone());
                    }
                }

                EntryType::EntryConfChangeV2 => {
                    panic!("programming error: encountered unsupported raft config change")
                }
            }

            if entry.get_index() > self.applied_index {
                self.applied_index = entry.get_index();
            }
        }

        if applied_block_number == 0 {
            // no block was written in this round
            return;
        }

        if self.acc_data_size >= self.size_limit {
            let request = SnapshotRequest {
                index: self.applied_index,
                conf_state: self.conf_state.clone(),
                data: entries[position].get_data().to_vec(),
            };
            match self.gc_tx.try_send(request) {
                Ok(()) => {
                    tracing::info!(
                        accumulated = self.acc_data_size,
                        limit = self.size_limit,
                        block = applied_block_number,
                        last_snapshot_block = self.last_snap_block_num,
                        nodes = ?self.conf_state.get_voters(),
                        "taking snapshot"
                    );
                    self.acc_data_size = 0;
                    self.last_snap_block_num = applied_block_number;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("snapshotting is in progress, it is very likely that SnapshotInterval is too small");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Write one block to the ledger. Block `N` is only valid when the
    /// ledger holds exactly `N` blocks; a lower number is a catch-up race
    /// and ignored, a higher number is fatal.
    async fn write_block(&mut self, block: Block, index: u64) {
        let expected = self.last_block.header.number + 1;
        if block.header.number > expected {
            panic!("got block {}, expect block {}", block.header.number, expected);
        }
        if block.header.number < expected {
            tracing::info!(
                got = block.header.number,
                expect = expected,
                "this node was forced to catch up, ignoring stale block"
            );
            return;
        }

        if self.block_inflight > 0 {
            self.block_inflight -= 1; // only reduced on the leader
        }
        self.last_block = block.clone();

        tracing::debug!(block = block.header.number, "writing block to ledger");

        if block.is_config() {
            self.write_config_block(block, index).await;
            return;
        }

        let metadata_bytes = {
            let mut metadata = self.metadata.write();
            metadata.raft_index = index;
            metadata.encode()
        };
        self.support.write_block(block, Some(metadata_bytes));
    }

    /// Write a config block and act on the membership delta it may carry:
    /// propose the matching raft conf change, or reconfigure communication
    /// for a certificate rotation.
    async fn write_config_block(&mut self, block: Block, index: u64) {
        let header_type = block
            .config_envelope()
            .map(|env| env.channel_header.header_type)
            .unwrap_or_else(|| panic!("failed to get config header type from config block"));

        self.config_inflight = false;

        match header_type {
            HeaderType::Config => {
                let changes = self.detect_conf_change(&block);

                let metadata_bytes = {
                    let mut metadata = self.metadata.write();
                    if let Some(changes) = &changes {
                        *metadata = changes.new_metadata.clone();
                    }
                    metadata.raft_index = index;
                    metadata.encode()
                };
                self.support.write_config_block(block, Some(metadata_bytes));

                let Some(changes) = changes else {
                    return;
                };

                if let Some(cc) = changes.conf_change {
                    // proposing may block while leaderless; this loop must
                    // keep draining apply events, so propose elsewhere
                    let node = self.node.clone();
                    let proposed = cc.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.propose_conf_change(proposed).await {
                            tracing::warn!(
                                "failed to propose configuration update to raft node: {}",
                                e
                            );
                        }
                    });

                    match cc.get_change_type() {
                        ConfChangeType::AddNode => tracing::info!(
                            node = cc.get_node_id(),
                            "config block adds node, pause accepting transactions till config change is applied"
                        ),
                        ConfChangeType::RemoveNode => tracing::info!(
                            node = cc.get_node_id(),
                            "config block removes node, pause accepting transactions till config change is applied"
                        ),
                        _ => panic!("programming error: encountered unsupported raft config change"),
                    }

                    self.conf_change_in_progress = Some(cc);
                    self.config_inflight = true;
                } else if changes.rotated() {
                    tracing::info!(
                        node = changes.rotated_node,
                        "rotated certificate of node, reconfiguring communication"
                    );
                    if let Err(e) = self.configure_comm() {
                        panic!("failed to configure communication: {}", e);
                    }
                }
            }

            HeaderType::OrdererTransaction => {
                let metadata_bytes = {
                    let mut metadata = self.metadata.write();
                    metadata.raft_index = index;
                    metadata.encode()
                };
                self.support.write_config_block(block, Some(metadata_bytes));
            }

            HeaderType::Message => {
                panic!("programming error: unexpected config type: {:?}", header_type)
            }
        }
    }

    /// Inspect a config block for consenter-set changes. Also applies a
    /// runtime snapshot-interval update if the block carries one.
    fn detect_conf_change(&mut self, block: &Block) -> Option<MembershipChanges> {
        let metadata = block
            .consensus_metadata()
            .unwrap_or_else(|e| panic!("error reading consensus metadata: {}", e))?;

        if let Some(options) = &metadata.options {
            if let Some(interval) = options.snapshot_interval_bytes {
                if interval != 0 && interval != self.size_limit {
                    tracing::info!(
                        new = interval,
                        old = self.size_limit,
                        "snapshot interval is updated"
                    );
                    self.size_limit = interval;
                }
            }
        }

        let current = self.metadata.read().clone();
        let changes = compute_membership_changes(&current, &metadata.consenters)
            .unwrap_or_else(|e| panic!("illegal configuration change detected: {}", e));

        if changes.rotated() {
            tracing::info!(
                block = block.header.number,
                node = changes.rotated_node,
                "config block rotates TLS certificate"
            );
        }

        Some(changes)
    }

    /// Act on a snapshot: an index of 0 marks an artificial snapshot
    /// synthesized by the eviction suspector, which advances the ledger
    /// only; a real snapshot also advances the raft bookkeeping, unless it
    /// is stale.
    async fn handle_snapshot(&mut self, snapshot: &Snapshot) {
        let index = snapshot.get_metadata().get_index();
        if index != 0 {
            if index <= self.applied_index {
                tracing::debug!(
                    index,
                    applied = self.applied_index,
                    "skip snapshot because it is behind the current applied index"
                );
                return;
            }
            self.conf_state = snapshot.get_metadata().get_conf_state().clone();
            self.applied_index = index;
        } else {
            tracing::info!("received artificial snapshot to trigger catch up");
        }

        if let Err(e) = self.catch_up(snapshot).await {
            panic!(
                "failed to recover from snapshot taken at term {} and index {}: {}",
                snapshot.get_metadata().get_term(),
                index,
                e
            );
        }
    }

    /// Pull every block between the local ledger tip and the block embedded
    /// in `snapshot`, writing each one. A missing block is fatal for the
    /// caller.
    async fn catch_up(&mut self, snapshot: &Snapshot) -> Result<(), ClusterError> {
        let block = Block::decode(snapshot.get_data())
            .map_err(|e| ClusterError::Codec(format!("snapshot data is not a block: {}", e)))?;

        if self.last_block.header.number >= block.header.number {
            tracing::warn!(
                snapshot_block = block.header.number,
                local_block = self.last_block.header.number,
                "snapshot is behind the local ledger, no sync needed"
            );
            return Ok(());
        }

        let mut puller = (self.create_puller)()?;

        let mut next = self.last_block.header.number + 1;
        tracing::info!(
            snapshot_block = block.header.number,
            from = next,
            "catching up with snapshot"
        );

        while next <= block.header.number {
            let pulled = puller
                .pull_block(next)
                .await
                .ok_or(ClusterError::MissingBlock(next))?;

            if pulled.is_config() {
                self.support.write_config_block(pulled.clone(), None);

                if let Some(changes) = self.detect_conf_change(&pulled) {
                    if changes.changed() {
                        tracing::info!(
                            block = pulled.header.number,
                            "config block changes consenter set, reconfiguring communication"
                        );
                        *self.metadata.write() = changes.new_metadata.clone();
                        if let Err(e) = self.configure_comm() {
                            panic!("failed to configure communication: {}", e);
                        }
                    }
                }
            } else {
                self.support.write_block(pulled.clone(), None);
            }

            self.last_block = pulled;
            next += 1;
        }

        puller.close();
        tracing::info!(block = block.header.number, "finished syncing with cluster");
        Ok(())
    }

    /// The conf change a new leader must resume, if a membership transition
    /// was committed as a config block but never applied to raft.
    fn in_flight_conf_change(&self) -> Option<ConfChange> {
        if let Some(cc) = &self.conf_change_in_progress {
            return Some(cc.clone());
        }

        if self.last_block.header.number == 0 {
            // nothing to fail over, the chain just started
            return None;
        }
        if !self.last_block.is_config() {
            return None;
        }

        let metadata = self.metadata.read();
        if self.conf_state.get_voters().len() == metadata.consenters.len() {
            // a config change can only add or remove one node at a time, so
            // equal sizes mean raft and block metadata are in sync
            return None;
        }
        Some(conf_change_from_state(&metadata, &self.conf_state))
    }

    fn configure_comm(&self) -> Result<(), String> {
        let nodes = self.remote_peers()?;
        self.configurator.configure(&self.channel_id, nodes);
        Ok(())
    }

    fn remote_peers(&self) -> Result<Vec<RemoteNode>, String> {
        let metadata = self.metadata.read();
        let mut nodes = Vec::new();
        for (node_id, consenter) in &metadata.consenters {
            // no need to know yourself
            if *node_id == self.raft_id {
                continue;
            }
            nodes.push(RemoteNode {
                id: *node_id,
                endpoint: format!("{}:{}", consenter.host, consenter.port),
                server_tls_cert: pem_to_der(&consenter.server_tls_cert, *node_id, "server")?,
                client_tls_cert: pem_to_der(&consenter.client_tls_cert, *node_id, "client")?,
            });
        }
        Ok(nodes)
    }
}

/// Validate a config envelope on the submission path: orderer transactions
/// pass through, config updates may only carry a legal single-step
/// consenter change.
fn check_config_update_validity(
    envelope: &Envelope,
    metadata: &RwLock<BlockMetadata>,
) -> Result<(), ChainError> {
    match envelope.channel_header.header_type {
        HeaderType::OrdererTransaction => Ok(()),
        HeaderType::Config => {
            let update = envelope
                .config_update()
                .map_err(ChainError::BadConfigMessage)?;
            let Some(consensus) = update.consensus else {
                // the update does not touch the consenter set
                return Ok(());
            };
            metadata_has_duplication(&consensus)?;
            let current = metadata.read();
            compute_membership_changes(&current, &consensus.consenters)?;
            Ok(())
        }
        HeaderType::Message => Err(ChainError::UnknownConfigType),
    }
}

fn pem_to_der(pem_bytes: &[u8], node_id: u64, kind: &str) -> Result<Vec<u8>, String> {
    let block = pem::parse(pem_bytes).map_err(|e| {
        format!(
            "rejecting PEM block of {} TLS cert for node {}: {}",
            kind, node_id, e
        )
    })?;
    Ok(block.into_contents())
}

/// The snapshotter: drains the single-slot snapshot channel and persists
/// each request through the raft actor. Deliberately decoupled so a slow
/// snapshot write only causes the next snapshot to be skipped.
async fn snapshotter(
    mut gc_rx: mpsc::Receiver<SnapshotRequest>,
    node: NodeHandle,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = gc_rx.recv() => {
                match maybe {
                    Some(request) => {
                        if node
                            .take_snapshot(request.index, request.conf_state, request.data)
                            .is_err()
                        {
                            return;
                        }
                    }
                    None => return,
                }
            }
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    tracing::debug!("stop garbage collecting");
                    return;
                }
            }
        }
    }
}

fn spawn_halt(halt_tx: mpsc::Sender<()>, mut done: watch::Receiver<bool>) {
    tokio::spawn(async move {
        tokio::select! {
            _ = halt_tx.send(()) => {}
            _ = wait_done(&mut done) => {}
        }
    });
}

async fn wait_done(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|stopped| *stopped).await;
}
