// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{get, lock_only, make_txn, set, TestCluster};
use serval_config::{LockManagerKind, RemasterProtocol, SchedulerConfig};
use serval_types::transaction::{KeyEntry, Metadata, Program, TxnStatus};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(15);

fn ddr_config(num_partitions: u32, num_regions: u32) -> SchedulerConfig {
    SchedulerConfig {
        num_regions,
        num_partitions,
        num_workers: 2,
        ddr_interval_ms: 25,
        poll_timeout_ms: 50,
        ..SchedulerConfig::default()
    }
}

fn simple_queue_config(num_regions: u32) -> SchedulerConfig {
    SchedulerConfig {
        num_regions,
        num_partitions: 1,
        num_workers: 2,
        ddr_interval_ms: 0,
        poll_timeout_ms: 50,
        lock_manager: LockManagerKind::SimpleQueue,
        remaster_protocol: RemasterProtocol::Simple,
        ..SchedulerConfig::default()
    }
}

#[test]
fn read_write_contention_serializes_in_log_order() {
    let cluster = TestCluster::start(ddr_config(1, 1));
    cluster.seed("0", "a", Metadata::new(0, 0));

    let t1 = make_txn(
        cluster.config(),
        1,
        Program::Commands(vec![get("0")]),
        vec![KeyEntry::read("0", Metadata::new(0, 0))],
    );
    let t2 = make_txn(
        cluster.config(),
        2,
        Program::Commands(vec![set("0", "b")]),
        vec![KeyEntry::write("0", Metadata::new(0, 0))],
    );
    cluster.forward(&t1);
    cluster.forward(&t2);

    let t1_result = cluster.wait_for_completions(1, 1, TIMEOUT);
    assert_eq!(t1_result[0].1.status, TxnStatus::Committed);
    assert_eq!(
        t1_result[0].1.key_entry("0").unwrap().value.as_deref(),
        Some("a")
    );

    let t2_result = cluster.wait_for_completions(2, 1, TIMEOUT);
    assert_eq!(t2_result[0].1.status, TxnStatus::Committed);
    assert_eq!(cluster.read("0").unwrap().value, "b");

    cluster.shutdown();
}

#[test]
fn cross_partition_deadlock_resolves_deterministically() {
    let cluster = TestCluster::start(ddr_config(2, 1));
    cluster.seed("0", "x0", Metadata::new(0, 0));
    cluster.seed("1", "x1", Metadata::new(0, 0));

    // T1 and T2 both write keys 0 (partition 0) and 1 (partition 1), but
    // the partitions see them in opposite orders, which locks the two txns
    // into a cycle only the deadlock resolver can break.
    let t1 = make_txn(
        cluster.config(),
        1,
        Program::Commands(vec![set("0", "t1"), set("1", "t1")]),
        vec![
            KeyEntry::write("0", Metadata::new(0, 0)),
            KeyEntry::write("1", Metadata::new(0, 0)),
        ],
    );
    let t2 = make_txn(
        cluster.config(),
        2,
        Program::Commands(vec![set("0", "t2"), set("1", "t2")]),
        vec![
            KeyEntry::write("0", Metadata::new(0, 0)),
            KeyEntry::write("1", Metadata::new(0, 0)),
        ],
    );
    cluster.forward_to(0, &t1);
    cluster.forward_to(0, &t2);
    cluster.forward_to(1, &t2);
    cluster.forward_to(1, &t1);

    // Both txns complete on both partitions once the cycle is rewired to
    // T1 -> T2.
    for (_, txn) in cluster.wait_for_completions(1, 2, TIMEOUT) {
        assert_eq!(txn.status, TxnStatus::Committed);
    }
    for (_, txn) in cluster.wait_for_completions(2, 2, TIMEOUT) {
        assert_eq!(txn.status, TxnStatus::Committed);
    }

    // T2 runs second on every partition, so its writes win.
    assert_eq!(cluster.read("0").unwrap().value, "t2");
    assert_eq!(cluster.read("1").unwrap().value, "t2");

    cluster.shutdown();
}

#[test]
fn stale_counter_aborts_before_dispatch() {
    let cluster = TestCluster::start(simple_queue_config(1));
    cluster.seed("0", "v", Metadata::new(0, 5));

    let txn = make_txn(
        cluster.config(),
        1,
        Program::Commands(vec![set("0", "w")]),
        vec![KeyEntry::write("0", Metadata::new(0, 3))],
    );
    cluster.forward(&txn);

    let completions = cluster.wait_for_completions(1, 1, TIMEOUT);
    assert_eq!(completions[0].1.status, TxnStatus::Aborted);
    assert_eq!(completions[0].1.abort_reason, "outdated counter");
    // The stale write never reached storage.
    assert_eq!(cluster.read("0").unwrap().value, "v");

    cluster.shutdown();
}

#[test]
fn remaster_commit_unblocks_waiting_txn() {
    let cluster = TestCluster::start(simple_queue_config(2));
    cluster.seed("0", "v", Metadata::new(0, 5));

    // T2 was built against the post-remaster metadata and has to wait in
    // the remaster manager until T1 commits the move.
    let t2 = make_txn(
        cluster.config(),
        10,
        Program::Commands(vec![set("0", "w")]),
        vec![KeyEntry::write("0", Metadata::new(1, 6))],
    );
    cluster.forward(&t2);

    let t1 = make_txn(
        cluster.config(),
        9,
        Program::Remaster { new_master: 1 },
        vec![KeyEntry::write("0", Metadata::new(0, 5))],
    );
    cluster.forward_multi_home(&t1);

    let t1_result = cluster.wait_for_completions(9, 1, TIMEOUT);
    assert_eq!(t1_result[0].1.status, TxnStatus::Committed);

    let t2_result = cluster.wait_for_completions(10, 1, TIMEOUT);
    assert_eq!(t2_result[0].1.status, TxnStatus::Committed);

    let record = cluster.read("0").unwrap();
    assert_eq!(record.value, "w");
    assert_eq!(record.metadata, Metadata::new(1, 6));

    cluster.shutdown();
}

#[test]
fn multi_home_header_arriving_last_dispatches_immediately() {
    let cluster = TestCluster::start(ddr_config(1, 2));
    cluster.seed("0", "a", Metadata::new(0, 0));
    cluster.seed("1", "b", Metadata::new(1, 0));

    let txn = make_txn(
        cluster.config(),
        5,
        Program::Commands(vec![set("0", "x"), set("1", "y")]),
        vec![
            KeyEntry::write("0", Metadata::new(0, 0)),
            KeyEntry::write("1", Metadata::new(1, 0)),
        ],
    );
    // Lock-only fragments first; the header brings up the rear.
    cluster.forward(&lock_only(&txn, 0));
    cluster.forward(&lock_only(&txn, 1));
    cluster.forward(&txn);

    let completions = cluster.wait_for_completions(5, 1, TIMEOUT);
    assert_eq!(completions[0].1.status, TxnStatus::Committed);
    assert_eq!(cluster.read("0").unwrap().value, "x");
    assert_eq!(cluster.read("1").unwrap().value, "y");

    cluster.shutdown();
}

#[test]
fn stats_snapshot_reports_scheduler_internals() {
    let cluster = TestCluster::start(ddr_config(1, 1));
    cluster.seed("0", "a", Metadata::new(0, 0));

    let txn = make_txn(
        cluster.config(),
        1,
        Program::Commands(vec![get("0")]),
        vec![KeyEntry::read("0", Metadata::new(0, 0))],
    );
    cluster.forward(&txn);
    cluster.wait_for_completions(1, 1, TIMEOUT);

    // The completion reaches the server slightly before the scheduler
    // processes the worker-done message; give it a moment to settle.
    std::thread::sleep(Duration::from_millis(250));

    cluster.request_stats(0, 7, 1);
    let response = cluster.wait_for_stats(7, TIMEOUT);
    assert_eq!(response.id, 7);
    assert_eq!(response.stats["lock_manager_type"], "ddr");
    assert_eq!(response.stats["num_all_txns"], 0);
    assert!(response.stats["waited_by_graph"].is_array());

    cluster.shutdown();
}
