// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

/// Transactions handed to a worker, counting deadlock re-runs separately.
pub static TXN_DISPATCHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "serval_scheduler_txn_dispatched",
        "Number of transaction runs dispatched to workers"
    )
    .unwrap()
});

pub static TXN_COMMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "serval_scheduler_txn_committed",
        "Number of transactions committed by this partition"
    )
    .unwrap()
});

pub static TXN_ABORTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "serval_scheduler_txn_aborted",
        "Number of transactions aborted by this partition"
    )
    .unwrap()
});

/// Deadlock groups rewired by the resolver, including groups whose members
/// all live on other partitions.
pub static DEADLOCKS_RESOLVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "serval_scheduler_deadlocks_resolved",
        "Number of deadlock groups resolved"
    )
    .unwrap()
});

pub static ACTIVE_TXNS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "serval_scheduler_active_txns",
        "Number of transactions currently tracked by the scheduler"
    )
    .unwrap()
});
