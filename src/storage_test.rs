use raft::eraftpb::ConfState;
use raft::eraftpb::Entry;
use raft::eraftpb::HardState;
use raft::storage::MemStorage;
use raft::GetEntriesContext;
use raft::Storage;

use crate::storage::wal_exists;
use crate::storage::RaftStorage;

fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
    let mut e = Entry::default();
    e.set_index(index);
    e.set_term(term);
    e.set_data(data.to_vec().into());
    e
}

fn hard_state(term: u64, commit: u64) -> HardState {
    let mut hs = HardState::default();
    hs.set_term(term);
    hs.set_vote(1);
    hs.set_commit(commit);
    hs
}

#[test]
fn test_wal_replay_after_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let wal_dir = dir.path().join("wal");
    let snap_dir = dir.path().join("snap");

    assert!(!wal_exists(&wal_dir));
    {
        let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 20)?;
        let entries: Vec<Entry> =
            (1..=3).map(|i| entry(i, 1, format!("block-{}", i).as_bytes())).collect();
        storage.store(&entries, Some(hard_state(1, 3)), None)?;
    }
    assert!(wal_exists(&wal_dir));

    let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 20)?;
    assert_eq!(1, storage.first_index()?);
    assert_eq!(3, storage.last_index()?);

    let replayed =
        storage.entries(1, 4, u64::MAX, GetEntriesContext::empty(false))?;
    assert_eq!(3, replayed.len());
    assert_eq!(b"block-2", replayed[1].get_data());

    let state = storage.initial_state()?;
    assert_eq!(3, state.hard_state.get_commit());
    Ok(())
}

#[test]
fn test_wal_replay_truncates_overwritten_suffix() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let wal_dir = dir.path().join("wal");
    let snap_dir = dir.path().join("snap");

    {
        let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 20)?;
        storage.store(&[entry(1, 1, b"a"), entry(2, 1, b"b")], Some(hard_state(1, 1)), None)?;
        // a new term rewrites index 2
        storage.store(&[entry(2, 2, b"c")], Some(hard_state(2, 2)), None)?;
    }

    let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 20)?;
    let replayed =
        storage.entries(1, 3, u64::MAX, GetEntriesContext::empty(false))?;
    assert_eq!(2, replayed.len());
    assert_eq!(2, replayed[1].get_term());
    assert_eq!(b"c", replayed[1].get_data());
    Ok(())
}

#[test]
fn test_take_snapshot_compacts_and_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let wal_dir = dir.path().join("wal");
    let snap_dir = dir.path().join("snap");

    let mut conf_state = ConfState::default();
    conf_state.set_voters(vec![1, 2, 3]);

    {
        let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 2)?;
        let entries: Vec<Entry> =
            (1..=10).map(|i| entry(i, 1, format!("block-{}", i).as_bytes())).collect();
        storage.store(&entries, Some(hard_state(1, 10)), None)?;

        storage.take_snapshot(10, conf_state.clone(), b"snapshot-data".to_vec())?;

        // the log is compacted to index - catch_up_entries = 8
        assert_eq!(8, storage.first_index()?);
        assert_eq!(10, storage.last_index()?);

        let snap = storage.snapshot(0, 0)?;
        assert_eq!(10, snap.get_metadata().get_index());
        assert_eq!(b"snapshot-data", snap.get_data());
    }

    // restart: the snapshot seeds the log, the WAL tail fills in the rest
    let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 2)?;
    let snap = storage.durable_snapshot();
    assert_eq!(10, snap.get_metadata().get_index());
    assert_eq!(vec![1, 2, 3], snap.get_metadata().get_conf_state().get_voters().to_vec());
    assert_eq!(b"snapshot-data", snap.get_data());
    assert_eq!(10, storage.last_index()?);
    Ok(())
}

#[test]
fn test_stale_snapshot_requests_are_ignored() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = RaftStorage::create(
        &dir.path().join("wal"),
        &dir.path().join("snap"),
        MemStorage::new(),
        2,
    )?;
    let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1, b"x")).collect();
    storage.store(&entries, Some(hard_state(1, 5)), None)?;

    storage.take_snapshot(5, ConfState::default(), b"first".to_vec())?;
    // an older index must not clobber the newer snapshot
    storage.take_snapshot(3, ConfState::default(), b"stale".to_vec())?;

    assert_eq!(5, storage.durable_snapshot().get_metadata().get_index());
    assert_eq!(b"first", storage.durable_snapshot().get_data());
    Ok(())
}

#[test]
fn test_torn_wal_tail_is_dropped() -> anyhow::Result<()> {
    use std::io::Write;

    let dir = tempfile::tempdir()?;
    let wal_dir = dir.path().join("wal");
    let snap_dir = dir.path().join("snap");

    {
        let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 20)?;
        storage.store(&[entry(1, 1, b"a")], Some(hard_state(1, 1)), None)?;
    }

    // simulate a crash mid-append: a length prefix with no payload behind it
    let mut file = std::fs::OpenOptions::new().append(true).open(wal_dir.join("wal.log"))?;
    file.write_all(&1000u32.to_le_bytes())?;
    file.write_all(b"trunc")?;
    drop(file);

    let storage = RaftStorage::create(&wal_dir, &snap_dir, MemStorage::new(), 20)?;
    assert_eq!(1, storage.last_index()?);
    Ok(())
}
