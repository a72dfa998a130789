//! Durable raft storage: an in-memory log fronted by a write-ahead log and
//! snapshot files.
//!
//! Entries and hard states are WAL-appended before they become visible to
//! raft. Snapshots are written as standalone files; taking a snapshot
//! compacts the log but keeps `snapshot_catch_up_entries` entries so slow
//! followers can catch up from the log instead of a snapshot transfer.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use protobuf::Message as PbMessage;
use raft::eraftpb::ConfState;
use raft::eraftpb::Entry;
use raft::eraftpb::HardState;
use raft::eraftpb::Snapshot;
use raft::storage::MemStorage;
use raft::GetEntriesContext;
use raft::RaftState;
use raft::Storage;
use serde::Deserialize;
use serde::Serialize;

use crate::error::StorageError;

const WAL_FILE: &str = "wal.log";
const SNAP_SUFFIX: &str = "snap";

/// Snapshot files retained past the newest one.
const KEEP_SNAPSHOT_FILES: usize = 4;

#[derive(Serialize, Deserialize)]
enum WalRecord {
    /// Protobuf-serialized `eraftpb::Entry`.
    Entry(Vec<u8>),
    /// Protobuf-serialized `eraftpb::HardState`.
    HardState(Vec<u8>),
}

struct StorageCore {
    ram: MemStorage,
    /// Latest durable snapshot; what raft hands to slow followers.
    snapshot: RwLock<Snapshot>,
    /// Mirror of the latest persisted hard state, used when rewriting the
    /// WAL after compaction.
    hard_state: Mutex<HardState>,
    wal: Mutex<BufWriter<File>>,
    wal_path: PathBuf,
    snap_dir: PathBuf,
    catch_up_entries: u64,
}

/// Cheaply cloneable handle to the chain's raft storage.
#[derive(Clone)]
pub struct RaftStorage {
    inner: Arc<StorageCore>,
}

/// Whether a prior incarnation of this chain left a WAL behind.
pub fn wal_exists(wal_dir: &Path) -> bool {
    wal_dir.join(WAL_FILE).exists()
}

impl RaftStorage {
    /// Open (or initialize) durable storage, replaying any persisted state
    /// into `ram`.
    pub fn create(
        wal_dir: &Path,
        snap_dir: &Path,
        ram: MemStorage,
        catch_up_entries: u64,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(wal_dir)?;
        fs::create_dir_all(snap_dir)?;

        let snapshot = load_latest_snapshot(snap_dir)?.unwrap_or_default();
        let snap_index = snapshot.get_metadata().get_index();
        if snap_index > 0 {
            ram.wl().apply_snapshot(snapshot.clone())?;
        }

        let wal_path = wal_dir.join(WAL_FILE);
        let (entries, hard_state) = replay_wal(&wal_path)?;
        let entries: Vec<Entry> =
            entries.into_iter().filter(|e| e.get_index() > snap_index).collect();
        if !entries.is_empty() {
            ram.wl().append(&entries)?;
        }
        if let Some(hs) = &hard_state {
            ram.wl().set_hardstate(hs.clone());
        }

        let file = OpenOptions::new().create(true).append(true).open(&wal_path)?;

        // without a WAL record the mirror starts from the snapshot-derived
        // state, never behind it
        let hard_state = match hard_state {
            Some(hs) => hs,
            None => ram.initial_state()?.hard_state,
        };

        Ok(Self {
            inner: Arc::new(StorageCore {
                ram,
                snapshot: RwLock::new(snapshot),
                hard_state: Mutex::new(hard_state),
                wal: Mutex::new(BufWriter::new(file)),
                wal_path,
                snap_dir: snap_dir.to_path_buf(),
                catch_up_entries,
            }),
        })
    }

    /// Seed a fresh raft group with its initial voter set.
    pub fn bootstrap(&self, voters: Vec<u64>) {
        self.inner.ram.initialize_with_conf_state((voters, vec![]));
    }

    /// Persist one Ready's worth of state: snapshot (if any), then entries
    /// and hard state, WAL first.
    pub fn store(
        &self,
        entries: &[Entry],
        hard_state: Option<HardState>,
        snapshot: Option<&Snapshot>,
    ) -> Result<(), StorageError> {
        if let Some(snap) = snapshot {
            self.install_snapshot(snap)?;
        }

        {
            let mut wal = self.inner.wal.lock();
            for entry in entries {
                let bytes =
                    entry.write_to_bytes().expect("raft entry encoding cannot fail");
                write_record(&mut *wal, &WalRecord::Entry(bytes))?;
            }
            if let Some(hs) = &hard_state {
                let bytes = hs.write_to_bytes().expect("hard state encoding cannot fail");
                write_record(&mut *wal, &WalRecord::HardState(bytes))?;
            }
            wal.flush()?;
            wal.get_ref().sync_data()?;
        }

        if !entries.is_empty() {
            self.inner.ram.wl().append(entries)?;
        }
        if let Some(hs) = hard_state {
            *self.inner.hard_state.lock() = hs.clone();
            self.inner.ram.wl().set_hardstate(hs);
        }
        Ok(())
    }

    /// Record a snapshot produced by the chain itself and compact the log
    /// behind it.
    pub fn take_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        {
            let current = self.inner.snapshot.read();
            if index <= current.get_metadata().get_index() {
                return Ok(());
            }
        }

        let term = self.inner.ram.term(index)?;
        let mut snap = Snapshot::default();
        snap.set_data(data.into());
        {
            let md = snap.mut_metadata();
            md.set_index(index);
            md.set_term(term);
            md.set_conf_state(conf_state);
        }

        self.save_snapshot_file(&snap)?;
        *self.inner.snapshot.write() = snap;
        self.purge_old_snapshots()?;

        // keep a tail of entries so lagging followers avoid a snapshot
        // transfer
        if index > self.inner.catch_up_entries {
            let compact_to = index - self.inner.catch_up_entries;
            let first = self.inner.ram.first_index()?;
            if compact_to > first {
                self.inner.ram.wl().compact(compact_to)?;
            }
        }

        self.rotate_wal()
    }

    /// Snapshot coming out of the raft layer (a leader installing state on
    /// this lagging node).
    fn install_snapshot(&self, snap: &Snapshot) -> Result<(), StorageError> {
        self.save_snapshot_file(snap)?;
        *self.inner.snapshot.write() = snap.clone();
        self.purge_old_snapshots()?;
        self.inner.ram.wl().apply_snapshot(snap.clone())?;
        {
            let mut hs = self.inner.hard_state.lock();
            let md = snap.get_metadata();
            if md.get_index() > hs.get_commit() {
                hs.set_commit(md.get_index());
                let new_term = std::cmp::max(hs.get_term(), md.get_term());
                hs.set_term(new_term);
            }
        }
        self.rotate_wal()
    }

    /// Advance the persisted commit index.
    pub fn update_commit(&self, commit: u64) {
        self.inner.hard_state.lock().set_commit(commit);
        self.inner.ram.wl().mut_hard_state().set_commit(commit);
    }

    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.inner.ram.wl().set_conf_state(conf_state);
    }

    /// The latest durable snapshot, empty if none was ever taken.
    pub fn durable_snapshot(&self) -> Snapshot {
        self.inner.snapshot.read().clone()
    }

    fn save_snapshot_file(&self, snap: &Snapshot) -> Result<(), StorageError> {
        let md = snap.get_metadata();
        let name = format!("{:016x}-{:016x}.{}", md.get_index(), md.get_term(), SNAP_SUFFIX);
        let path = self.inner.snap_dir.join(&name);
        let tmp = self.inner.snap_dir.join(format!("{}.tmp", name));

        let bytes = snap.write_to_bytes().expect("snapshot encoding cannot fail");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn purge_old_snapshots(&self) -> Result<(), StorageError> {
        let mut names = snapshot_file_names(&self.inner.snap_dir)?;
        if names.len() <= KEEP_SNAPSHOT_FILES {
            return Ok(());
        }
        // names sort by index because of the fixed-width hex prefix
        names.sort();
        let excess = names.len() - KEEP_SNAPSHOT_FILES;
        for name in names.into_iter().take(excess) {
            fs::remove_file(self.inner.snap_dir.join(name))?;
        }
        Ok(())
    }

    /// Rewrite the WAL down to the entries the in-memory log still holds.
    fn rotate_wal(&self) -> Result<(), StorageError> {
        let first = self.inner.ram.first_index()?;
        let last = self.inner.ram.last_index()?;
        let entries = if last >= first {
            self.inner.ram.entries(first, last + 1, u64::MAX, GetEntriesContext::empty(false))?
        } else {
            Vec::new()
        };

        let tmp = self.inner.wal_path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in &entries {
                let bytes =
                    entry.write_to_bytes().expect("raft entry encoding cannot fail");
                write_record(&mut writer, &WalRecord::Entry(bytes))?;
            }
            let hs = self.inner.hard_state.lock().clone();
            let bytes = hs.write_to_bytes().expect("hard state encoding cannot fail");
            write_record(&mut writer, &WalRecord::HardState(bytes))?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        let mut wal = self.inner.wal.lock();
        fs::rename(&tmp, &self.inner.wal_path)?;
        let file = OpenOptions::new().append(true).open(&self.inner.wal_path)?;
        *wal = BufWriter::new(file);
        Ok(())
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.inner.ram.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.inner.ram.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.inner.ram.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.inner.ram.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.inner.ram.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let snap = self.inner.snapshot.read();
        if snap.get_metadata().get_index() < request_index {
            return Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snap.clone())
    }
}

fn write_record(writer: &mut impl Write, record: &WalRecord) -> Result<(), StorageError> {
    let bytes = bincode::serialize(record)
        .map_err(|e| StorageError::CorruptWal(format!("failed to encode record: {}", e)))?;
    writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Replay WAL records, tolerating a torn tail from a crashed writer.
fn replay_wal(path: &Path) -> Result<(Vec<Entry>, Option<HardState>), StorageError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut entries: Vec<Entry> = Vec::new();
    let mut hard_state = None;

    loop {
        let len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let mut buf = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut buf) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                tracing::warn!("dropping torn record at WAL tail");
                break;
            }
            return Err(e.into());
        }

        let record: WalRecord = bincode::deserialize(&buf)
            .map_err(|e| StorageError::CorruptWal(e.to_string()))?;
        match record {
            WalRecord::Entry(bytes) => {
                let entry = Entry::parse_from_bytes(&bytes)
                    .map_err(|e| StorageError::CorruptWal(e.to_string()))?;
                // a later term may rewrite the log suffix
                while entries
                    .last()
                    .map(|e: &Entry| e.get_index() >= entry.get_index())
                    .unwrap_or(false)
                {
                    entries.pop();
                }
                entries.push(entry);
            }
            WalRecord::HardState(bytes) => {
                let hs = HardState::parse_from_bytes(&bytes)
                    .map_err(|e| StorageError::CorruptWal(e.to_string()))?;
                hard_state = Some(hs);
            }
        }
    }

    Ok((entries, hard_state))
}

fn snapshot_file_names(snap_dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut names = Vec::new();
    for dirent in fs::read_dir(snap_dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name.ends_with(&format!(".{}", SNAP_SUFFIX)) {
            names.push(name);
        }
    }
    Ok(names)
}

fn load_latest_snapshot(snap_dir: &Path) -> Result<Option<Snapshot>, StorageError> {
    if !snap_dir.exists() {
        return Ok(None);
    }
    let mut names = snapshot_file_names(snap_dir)?;
    names.sort();

    // walk newest-first; an unreadable newest snapshot falls back to the
    // previous one
    for name in names.iter().rev() {
        let path = snap_dir.join(name);
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        match Snapshot::parse_from_bytes(&bytes) {
            Ok(snap) => return Ok(Some(snap)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "skipping unreadable snapshot file: {}", e
                );
            }
        }
    }
    Ok(None)
}
