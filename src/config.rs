//! Chain runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use raft::storage::MemStorage;

use crate::block::BlockMetadata;
use crate::error::ConfigError;

/// Default number of log entries preserved past a snapshot, so slow
/// followers can still catch up from the log instead of the snapshot.
pub const DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES: u64 = 20;

/// Default snapshot interval, in accumulated entry bytes. Used when
/// `snap_interval_bytes` is left 0, to enforce that snapshotting is always
/// on.
pub const DEFAULT_SNAPSHOT_INTERVAL: u32 = 100 * 1024 * 1024;

/// Default leaderless duration after which a node starts suspecting its own
/// eviction from the channel.
pub const DEFAULT_EVICTION_SUSPICION: Duration = Duration::from_secs(10 * 60);

/// Default interval at which a chain checks its own leadership status.
pub const DEFAULT_LEADERLESS_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// All the tunables relevant to one chain.
///
/// Assembled by the embedding orderer from channel configuration; the zero
/// values of `snap_interval_bytes`, `snapshot_catch_up_entries`,
/// `eviction_suspicion` and `leader_check_interval` select the defaults
/// above.
#[derive(Clone)]
pub struct Options {
    pub raft_id: u64,

    pub wal_dir: PathBuf,
    pub snap_dir: PathBuf,
    /// Accumulated entry bytes that trigger a snapshot. 0 selects
    /// [`DEFAULT_SNAPSHOT_INTERVAL`].
    pub snap_interval_bytes: u32,
    /// Configurable mainly for testing; 0 selects
    /// [`DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES`].
    pub snapshot_catch_up_entries: u64,

    /// Injected in-memory raft log, shared with tests that want to inspect
    /// it. `None` creates a fresh one.
    pub memory_storage: Option<MemStorage>,

    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    /// Bound on blocks proposed but not yet committed; also the raft
    /// in-flight message window.
    pub max_inflight_msgs: usize,

    /// Consenter bookkeeping restored from the latest committed block.
    pub block_metadata: BlockMetadata,
    /// This node's own TLS certificate (PEM), matched against consenter
    /// sets to detect eviction.
    pub cert: Vec<u8>,

    /// Leaderless duration after which eviction is suspected. Zero selects
    /// [`DEFAULT_EVICTION_SUSPICION`].
    pub eviction_suspicion: Duration,
    /// Zero selects [`DEFAULT_LEADERLESS_CHECK_INTERVAL`].
    pub leader_check_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            raft_id: 0,
            wal_dir: PathBuf::new(),
            snap_dir: PathBuf::new(),
            snap_interval_bytes: 0,
            snapshot_catch_up_entries: 0,
            memory_storage: None,
            tick_interval: Duration::from_millis(500),
            election_tick: 10,
            heartbeat_tick: 1,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            block_metadata: BlockMetadata::default(),
            cert: Vec::new(),
            eviction_suspicion: Duration::ZERO,
            leader_check_interval: Duration::ZERO,
        }
    }
}

impl Options {
    /// Check the invariants the raft layer and the chain loop depend on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.raft_id == 0 {
            return Err(ConfigError::ZeroRaftId);
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(ConfigError::ElectionTick {
                election_tick: self.election_tick,
                heartbeat_tick: self.heartbeat_tick,
            });
        }
        if self.max_inflight_msgs == 0 {
            return Err(ConfigError::ZeroMaxInflight);
        }
        Ok(())
    }

    /// Snapshot interval with the default applied.
    pub(crate) fn snapshot_interval(&self) -> u32 {
        if self.snap_interval_bytes == 0 {
            DEFAULT_SNAPSHOT_INTERVAL
        } else {
            self.snap_interval_bytes
        }
    }

    pub(crate) fn catch_up_entries(&self) -> u64 {
        if self.snapshot_catch_up_entries == 0 {
            DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES
        } else {
            self.snapshot_catch_up_entries
        }
    }

    pub(crate) fn eviction_suspicion(&self) -> Duration {
        if self.eviction_suspicion.is_zero() {
            DEFAULT_EVICTION_SUSPICION
        } else {
            self.eviction_suspicion
        }
    }

    pub(crate) fn leader_check_interval(&self) -> Duration {
        if self.leader_check_interval.is_zero() {
            DEFAULT_LEADERLESS_CHECK_INTERVAL
        } else {
            self.leader_check_interval
        }
    }
}
