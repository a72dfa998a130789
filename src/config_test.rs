use std::time::Duration;

use crate::config::Options;
use crate::config::DEFAULT_EVICTION_SUSPICION;
use crate::config::DEFAULT_LEADERLESS_CHECK_INTERVAL;
use crate::config::DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES;
use crate::config::DEFAULT_SNAPSHOT_INTERVAL;
use crate::error::ConfigError;

#[test]
fn test_zero_values_select_defaults() {
    let opts = Options::default();

    assert_eq!(DEFAULT_SNAPSHOT_INTERVAL, opts.snapshot_interval());
    assert_eq!(100 * 1024 * 1024, opts.snapshot_interval());
    assert_eq!(DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES, opts.catch_up_entries());
    assert_eq!(DEFAULT_EVICTION_SUSPICION, opts.eviction_suspicion());
    assert_eq!(Duration::from_secs(600), opts.eviction_suspicion());
    assert_eq!(DEFAULT_LEADERLESS_CHECK_INTERVAL, opts.leader_check_interval());
    assert_eq!(Duration::from_secs(10), opts.leader_check_interval());
}

#[test]
fn test_explicit_values_win() {
    let opts = Options {
        snap_interval_bytes: 4096,
        snapshot_catch_up_entries: 5,
        eviction_suspicion: Duration::from_secs(1),
        leader_check_interval: Duration::from_millis(50),
        ..Default::default()
    };

    assert_eq!(4096, opts.snapshot_interval());
    assert_eq!(5, opts.catch_up_entries());
    assert_eq!(Duration::from_secs(1), opts.eviction_suspicion());
    assert_eq!(Duration::from_millis(50), opts.leader_check_interval());
}

#[test]
fn test_validate() {
    let valid = Options { raft_id: 1, ..Default::default() };
    assert!(valid.validate().is_ok());

    let err = Options::default().validate().unwrap_err();
    assert_eq!(ConfigError::ZeroRaftId, err);

    let err = Options {
        raft_id: 1,
        tick_interval: Duration::ZERO,
        ..Default::default()
    }
    .validate()
    .unwrap_err();
    assert_eq!(ConfigError::ZeroTickInterval, err);

    let err = Options {
        raft_id: 1,
        election_tick: 1,
        heartbeat_tick: 5,
        ..Default::default()
    }
    .validate()
    .unwrap_err();
    assert_eq!(
        ConfigError::ElectionTick {
            election_tick: 1,
            heartbeat_tick: 5
        },
        err
    );

    let err = Options {
        raft_id: 1,
        max_inflight_msgs: 0,
        ..Default::default()
    }
    .validate()
    .unwrap_err();
    assert_eq!(ConfigError::ZeroMaxInflight, err);
}
