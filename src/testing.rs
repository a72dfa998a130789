//! Shared mocks and fixtures for the crate's tests.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::block::Block;
use crate::block::BlockAttachments;
use crate::block::BlockHeader;
use crate::block::ChannelHeader;
use crate::block::ConfigUpdate;
use crate::block::ConsensusMetadata;
use crate::block::ConsenterIdentity;
use crate::block::Envelope;
use crate::block::HeaderType;
use crate::error::ClusterError;
use crate::error::LedgerError;
use crate::error::TransportError;
use crate::message::ConsensusRequest;
use crate::message::SubmitRequest;
use crate::puller::BlockPuller;
use crate::support::BlockCutter;
use crate::support::Configurator;
use crate::support::ConsenterSupport;
use crate::support::RemoteNode;
use crate::support::SharedConfig;
use crate::support::Transport;

pub(crate) const CHANNEL: &str = "test-channel";

/// A consenter with well-formed PEM certificates, so that the chain can
/// decode them to DER when building remote-node configurations.
pub(crate) fn consenter(n: u64) -> ConsenterIdentity {
    let pem_cert = |kind: &str| {
        pem::encode(&pem::Pem::new(
            "CERTIFICATE",
            format!("{}-cert-{}", kind, n).into_bytes(),
        ))
        .into_bytes()
    };
    ConsenterIdentity {
        host: format!("orderer{}", n),
        port: 7050,
        server_tls_cert: pem_cert("server"),
        client_tls_cert: pem_cert("client"),
    }
}

pub(crate) fn normal_envelope(payload: &[u8]) -> Envelope {
    Envelope {
        channel_header: ChannelHeader {
            header_type: HeaderType::Message,
            channel_id: CHANNEL.to_string(),
        },
        payload: payload.to_vec(),
    }
}

pub(crate) fn config_envelope(consenters: Vec<ConsenterIdentity>) -> Envelope {
    let update = ConfigUpdate {
        channel_id: CHANNEL.to_string(),
        consensus: Some(ConsensusMetadata { consenters, options: None }),
    };
    Envelope {
        channel_header: ChannelHeader {
            header_type: HeaderType::Config,
            channel_id: CHANNEL.to_string(),
        },
        payload: bincode::serialize(&update).unwrap(),
    }
}

pub(crate) fn genesis_block(consenters: Vec<ConsenterIdentity>) -> Block {
    Block {
        header: BlockHeader {
            number: 0,
            previous_hash: [0u8; 32],
            data_hash: [0u8; 32],
        },
        envelopes: vec![config_envelope(consenters)],
        metadata: BlockAttachments::default(),
    }
}

pub(crate) fn block_at(number: u64, envelopes: Vec<Envelope>) -> Block {
    Block {
        header: BlockHeader {
            number,
            previous_hash: [0u8; 32],
            data_hash: [0u8; 32],
        },
        envelopes,
        metadata: BlockAttachments::default(),
    }
}

/// Cuts a batch every `max_message_count` envelopes.
pub(crate) struct MockCutter {
    pub pending: Vec<Envelope>,
    pub max_message_count: usize,
}

impl MockCutter {
    pub fn new(max_message_count: usize) -> Self {
        Self { pending: Vec::new(), max_message_count }
    }
}

impl BlockCutter for MockCutter {
    fn ordered(&mut self, envelope: Envelope) -> (Vec<Vec<Envelope>>, bool) {
        self.pending.push(envelope);
        if self.pending.len() >= self.max_message_count {
            (vec![std::mem::take(&mut self.pending)], false)
        } else {
            (Vec::new(), true)
        }
    }

    fn cut(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.pending)
    }
}

pub(crate) struct MockSharedConfig {
    pub batch_timeout: Duration,
}

impl SharedConfig for MockSharedConfig {
    fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }
}

/// In-memory ledger plus recorded interactions.
pub(crate) struct MockSupport {
    pub ledger: Mutex<Vec<Block>>,
    pub appended: Mutex<Vec<Block>>,
    pub written_metadata: Mutex<Vec<Option<Vec<u8>>>>,
    pub config_blocks_written: Mutex<Vec<Block>>,
    pub sequence: AtomicU64,
    pub cutter: Arc<Mutex<MockCutter>>,
    pub batch_timeout: Duration,
}

impl MockSupport {
    pub fn new(genesis: Block, batch_size: usize) -> Self {
        Self {
            ledger: Mutex::new(vec![genesis]),
            appended: Mutex::new(Vec::new()),
            written_metadata: Mutex::new(Vec::new()),
            config_blocks_written: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            cutter: Arc::new(Mutex::new(MockCutter::new(batch_size))),
            batch_timeout: Duration::from_millis(500),
        }
    }
}

impl ConsenterSupport for MockSupport {
    fn height(&self) -> u64 {
        self.ledger.lock().len() as u64
    }

    fn block(&self, number: u64) -> Option<Block> {
        self.ledger.lock().get(number as usize).cloned()
    }

    fn chain_id(&self) -> String {
        CHANNEL.to_string()
    }

    fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn shared_config(&self) -> Arc<dyn SharedConfig> {
        Arc::new(MockSharedConfig { batch_timeout: self.batch_timeout })
    }

    fn block_cutter(&self) -> Arc<Mutex<dyn BlockCutter>> {
        self.cutter.clone()
    }

    fn process_normal_msg(&self, _envelope: &Envelope) -> Result<u64, String> {
        Ok(self.sequence())
    }

    fn process_config_msg(&self, envelope: &Envelope) -> Result<(Envelope, u64), String> {
        Ok((envelope.clone(), self.sequence()))
    }

    fn write_block(&self, block: Block, consensus_metadata: Option<Vec<u8>>) {
        self.written_metadata.lock().push(consensus_metadata);
        self.ledger.lock().push(block);
    }

    fn write_config_block(&self, block: Block, consensus_metadata: Option<Vec<u8>>) {
        self.written_metadata.lock().push(consensus_metadata);
        self.config_blocks_written.lock().push(block.clone());
        self.ledger.lock().push(block);
    }

    fn append(&self, block: Block) -> Result<(), LedgerError> {
        self.appended.lock().push(block.clone());
        self.ledger.lock().push(block);
        Ok(())
    }

    fn is_system_channel(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    pub consensus_sent: Mutex<Vec<(u64, ConsensusRequest)>>,
    pub submit_sent: Mutex<Vec<(u64, SubmitRequest)>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_consensus(
        &self,
        dest: u64,
        request: ConsensusRequest,
    ) -> Result<(), TransportError> {
        self.consensus_sent.lock().push((dest, request));
        Ok(())
    }

    async fn send_submit(&self, dest: u64, request: SubmitRequest) -> Result<(), TransportError> {
        self.submit_sent.lock().push((dest, request));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockConfigurator {
    pub calls: Mutex<Vec<(String, Vec<RemoteNode>)>>,
}

impl Configurator for MockConfigurator {
    fn configure(&self, channel: &str, new_nodes: Vec<RemoteNode>) {
        self.calls.lock().push((channel.to_string(), new_nodes));
    }
}

/// Serves a fixed set of blocks and records every pull.
pub(crate) struct MockPuller {
    pub blocks: HashMap<u64, Block>,
    pub heights: HashMap<String, u64>,
    pub pulled: Arc<Mutex<Vec<u64>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl MockPuller {
    pub fn serving(blocks: Vec<Block>) -> Self {
        let height = blocks.iter().map(|b| b.header.number + 1).max().unwrap_or(0);
        Self {
            blocks: blocks.into_iter().map(|b| (b.header.number, b)).collect(),
            heights: HashMap::from([("orderer1:7050".to_string(), height)]),
            pulled: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
        }
    }
}

#[async_trait]
impl BlockPuller for MockPuller {
    async fn pull_block(&mut self, seq: u64) -> Option<Block> {
        self.pulled.lock().push(seq);
        self.blocks.get(&seq).cloned()
    }

    async fn heights_by_endpoints(&mut self) -> Result<HashMap<String, u64>, ClusterError> {
        Ok(self.heights.clone())
    }

    fn close(&mut self) {
        *self.closed.lock() = true;
    }
}
