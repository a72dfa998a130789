//! Actor wrapping the raft state machine.
//!
//! `RawNode` is single-threaded; every interaction goes through an mpsc
//! request channel with oneshot replies, while the actor multiplexes ticks,
//! requests and shutdown. Committed entries and leadership transitions are
//! fanned out to the chain loop as [`ApplyEvent`]s; snapshots raft installs
//! on this node are handed over for ledger catch-up.

use std::sync::Arc;
use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::eraftpb::ConfChange;
use raft::eraftpb::ConfState;
use raft::eraftpb::Entry;
use raft::eraftpb::Message;
use raft::eraftpb::MessageType;
use raft::eraftpb::Snapshot;
use raft::Config as RaftConfig;
use raft::RawNode;
use raft::SnapshotStatus;
use raft::StateRole;
use slog::o;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::config::Options;
use crate::error::NodeError;
use crate::message::ConsensusRequest;
use crate::storage::RaftStorage;
use crate::support::Transport;

/// Leadership view as last reported by raft.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub leader: u64,
    pub role: StateRole,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self { leader: raft::INVALID_ID, role: StateRole::Follower }
    }
}

impl NodeStatus {
    /// Pre-candidates and candidates have no usable leader view.
    pub fn is_candidate(&self) -> bool {
        matches!(self.role, StateRole::Candidate | StateRole::PreCandidate)
    }
}

/// One batch of raft output for the chain loop.
///
/// A snapshot raft installed on this node rides in the same event stream
/// as committed entries, so the chain observes them in log order.
pub(crate) struct ApplyEvent {
    pub entries: Vec<Entry>,
    /// Present when the soft state changed since the last event.
    pub status: Option<NodeStatus>,
    /// A snapshot installed before `entries`; triggers ledger catch-up.
    pub snapshot: Option<Snapshot>,
}

enum NodeRequest {
    Step {
        message: Message,
        reply: oneshot::Sender<Result<(), raft::Error>>,
    },
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), raft::Error>>,
    },
    ProposeConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<Result<(), raft::Error>>,
    },
    ApplyConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<Result<ConfState, raft::Error>>,
    },
    LastIndex {
        reply: oneshot::Sender<u64>,
    },
    TakeSnapshot {
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    },
}

/// Cheap handle to the node actor.
#[derive(Clone)]
pub(crate) struct NodeHandle {
    tx: mpsc::UnboundedSender<NodeRequest>,
}

impl NodeHandle {
    pub(crate) async fn step(&self, message: Message) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeRequest::Step { message, reply: tx })
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?.map_err(NodeError::Raft)
    }

    pub(crate) async fn propose(&self, data: Vec<u8>) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeRequest::Propose { data, reply: tx })
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?.map_err(NodeError::Raft)
    }

    pub(crate) async fn propose_conf_change(&self, cc: ConfChange) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeRequest::ProposeConfChange { cc, reply: tx })
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?.map_err(NodeError::Raft)
    }

    pub(crate) async fn apply_conf_change(&self, cc: ConfChange) -> Result<ConfState, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeRequest::ApplyConfChange { cc, reply: tx })
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?.map_err(NodeError::Raft)
    }

    pub(crate) async fn last_index(&self) -> Result<u64, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeRequest::LastIndex { reply: tx })
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Fire-and-forget: the actor logs failures, the next snapshot request
    /// covers the same data.
    pub(crate) fn take_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> Result<(), NodeError> {
        self.tx
            .send(NodeRequest::TakeSnapshot { index, conf_state, data })
            .map_err(|_| NodeError::Stopped)
    }
}

pub(crate) struct RaftNode {
    channel_id: String,
    raw: RawNode<RaftStorage>,
    storage: RaftStorage,
    transport: Arc<dyn Transport>,
    rx: mpsc::UnboundedReceiver<NodeRequest>,
    apply_tx: mpsc::UnboundedSender<ApplyEvent>,
    tick_interval: Duration,
    done: watch::Receiver<bool>,
}

impl RaftNode {
    pub(crate) fn new(
        channel_id: String,
        opts: &Options,
        storage: RaftStorage,
        transport: Arc<dyn Transport>,
        apply_tx: mpsc::UnboundedSender<ApplyEvent>,
        done: watch::Receiver<bool>,
    ) -> Result<(NodeHandle, RaftNode), raft::Error> {
        let config = RaftConfig {
            id: opts.raft_id,
            election_tick: opts.election_tick,
            heartbeat_tick: opts.heartbeat_tick,
            max_size_per_msg: opts.max_size_per_msg,
            max_inflight_msgs: opts.max_inflight_msgs,
            // a reconnected node must not disturb an established quorum
            pre_vote: true,
            check_quorum: true,
            ..Default::default()
        };
        let logger = slog::Logger::root(slog::Discard, o!());
        let raw = RawNode::new(&config, storage.clone(), &logger)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let node = RaftNode {
            channel_id,
            raw,
            storage,
            transport,
            rx,
            apply_tx,
            tick_interval: opts.tick_interval,
            done,
        };
        Ok((NodeHandle { tx }, node))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(channel = %self.channel_id))]
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.raw.tick();
                }

                maybe = self.rx.recv() => {
                    match maybe {
                        Some(request) => self.handle_request(request),
                        None => break,
                    }
                }

                changed = self.done.changed() => {
                    if changed.is_err() || *self.done.borrow() {
                        break;
                    }
                }
            }

            self.process_ready().await;
        }

        tracing::debug!("raft node actor stopped");
    }

    fn handle_request(&mut self, request: NodeRequest) {
        match request {
            NodeRequest::Step { message, reply } => {
                let _ = reply.send(self.raw.step(message));
            }
            NodeRequest::Propose { data, reply } => {
                let _ = reply.send(self.raw.propose(Vec::new(), data));
            }
            NodeRequest::ProposeConfChange { cc, reply } => {
                let _ = reply.send(self.raw.propose_conf_change(Vec::new(), cc));
            }
            NodeRequest::ApplyConfChange { cc, reply } => {
                let result = self.raw.apply_conf_change(&cc);
                if let Ok(conf_state) = &result {
                    self.storage.set_conf_state(conf_state.clone());
                }
                let _ = reply.send(result);
            }
            NodeRequest::LastIndex { reply } => {
                let _ = reply.send(self.raw.raft.raft_log.last_index());
            }
            NodeRequest::TakeSnapshot { index, conf_state, data } => {
                match self.storage.take_snapshot(index, conf_state, data) {
                    Ok(()) => tracing::debug!(index, "snapshot persisted"),
                    Err(e) => tracing::warn!(index, "failed to take snapshot: {}", e),
                }
            }
        }
    }

    async fn process_ready(&mut self) {
        if !self.raw.has_ready() {
            return;
        }
        let mut ready = self.raw.ready();

        let status = ready
            .ss()
            .map(|ss| NodeStatus { leader: ss.leader_id, role: ss.raft_state });

        self.send_messages(ready.take_messages()).await;

        let mut installed_snapshot = None;
        if !is_empty_snapshot(ready.snapshot()) {
            let snapshot = ready.snapshot().clone();
            if let Err(e) = self.storage.store(&[], None, Some(&snapshot)) {
                panic!("failed to persist raft snapshot: {}", e);
            }
            installed_snapshot = Some(snapshot);
        }

        let mut committed = ready.take_committed_entries();

        if let Err(e) = self.storage.store(ready.entries(), ready.hs().cloned(), None) {
            panic!("failed to persist raft data: {}", e);
        }

        self.send_messages(ready.take_persisted_messages()).await;

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.update_commit(commit);
        }
        self.send_messages(light.take_messages()).await;
        committed.extend(light.take_committed_entries());

        if status.is_some() || installed_snapshot.is_some() || !committed.is_empty() {
            let _ = self.apply_tx.send(ApplyEvent {
                entries: committed,
                status,
                snapshot: installed_snapshot,
            });
        }

        self.raw.advance_apply();
    }

    async fn send_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            let dest = message.get_to();
            let is_snapshot = message.get_msg_type() == MessageType::MsgSnapshot;
            let payload =
                message.write_to_bytes().expect("raft message encoding cannot fail");
            let request = ConsensusRequest {
                channel: self.channel_id.clone(),
                payload,
            };

            if let Err(e) = self.transport.send_consensus(dest, request).await {
                tracing::debug!(dest, "failed to send raft message: {}", e);
                self.raw.report_unreachable(dest);
                if is_snapshot {
                    self.raw.report_snapshot(dest, SnapshotStatus::Failure);
                }
            } else if is_snapshot {
                self.raw.report_snapshot(dest, SnapshotStatus::Finish);
            }
        }
    }
}

/// etcd-style empty-snapshot test: a zero index means "no snapshot".
pub(crate) fn is_empty_snapshot(snapshot: &Snapshot) -> bool {
    snapshot.get_metadata().get_index() == 0
}
