// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::lock_manager::{AcquireLocksResult, LockManager, LOCK_TABLE_SIZE_LIMIT};
use parking_lot::Mutex;
use serde_json::json;
use serval_types::{
    transaction::{KeyMode, Transaction},
    KeyReplica, TxnId, SENTINEL_TXN_ID,
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::warn;

/// Tail of the lock queue for one key replica. Released transactions are
/// not removed here, so any id read out of this structure has to be checked
/// against the txn info table before use. Keeping only the tail makes
/// acquisition O(locks): a new requester only needs to know who it directly
/// depends on, and those edges live in the txn info graph.
#[derive(Default)]
pub(crate) struct LockQueueTail {
    write_lock_requester: Option<TxnId>,
    read_lock_requesters: Vec<TxnId>,
}

impl LockQueueTail {
    /// Appends a read request and returns the write request it waits on,
    /// if any.
    fn acquire_read_lock(&mut self, txn_id: TxnId) -> Option<TxnId> {
        self.read_lock_requesters.push(txn_id);
        self.write_lock_requester
    }

    /// Makes `txn_id` the write tail and returns everything it waits on:
    /// all queued reads, or the previous write request when there are none.
    fn acquire_write_lock(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        let deps = if self.read_lock_requesters.is_empty() {
            self.write_lock_requester.into_iter().collect()
        } else {
            std::mem::take(&mut self.read_lock_requesters)
        };
        self.write_lock_requester = Some(txn_id);
        deps
    }

    pub(crate) fn write_lock_requester(&self) -> Option<TxnId> {
        self.write_lock_requester
    }

    pub(crate) fn read_lock_requesters(&self) -> &[TxnId] {
        &self.read_lock_requesters
    }
}

/// Wait bookkeeping for one transaction.
#[derive(Clone)]
pub(crate) struct TxnInfo {
    pub(crate) id: TxnId,
    /// Transactions waiting on this one. The list only grows; the deadlock
    /// resolver blanks entries with the sentinel instead of erasing them so
    /// that its snapshot prefix stays valid. The list starts with one
    /// sentinel slot so a resolver chain edge always finds room.
    pub(crate) waited_by: Vec<TxnId>,
    pub(crate) num_waiting_for: i32,
    pub(crate) unarrived_lock_requests: i32,
    /// Number of partitions this txn participates in; the resolver uses it
    /// to judge whether the merged view of a vertex is complete.
    pub(crate) num_partitions: i32,
    pub(crate) deadlocked: bool,
}

impl TxnInfo {
    pub(crate) fn new(id: TxnId, num_partitions: i32, expected_locks: i32) -> Self {
        Self {
            id,
            waited_by: vec![SENTINEL_TXN_ID],
            num_waiting_for: 0,
            unarrived_lock_requests: expected_locks,
            num_partitions,
            deadlocked: false,
        }
    }

    pub(crate) fn is_stable(&self) -> bool {
        self.unarrived_lock_requests == 0
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.num_waiting_for == 0 && self.unarrived_lock_requests == 0
    }
}

/// Deterministic lock manager with Deterministic Deadlock Resolving. Locks
/// are granted in log order; deadlocks between partitions are left in place
/// and periodically rewired by the companion `DeadlockResolver`, which
/// shares `txn_info` and `ready_txns` with this struct.
///
/// Locks are taken on `(key, home region)` using the transaction's master
/// metadata. Masters are re-checked in the worker, so if two transactions
/// hold separate locks for the same key, one of them carries an outdated
/// master and will abort there. Remaster transactions lock both
/// `(key, old home)` and `(key, new home)`.
#[derive(Default)]
pub struct DdrLockManager {
    lock_table: Mutex<HashMap<KeyReplica, LockQueueTail>>,
    pub(crate) txn_info: Mutex<HashMap<TxnId, TxnInfo>>,
    pub(crate) ready_txns: Mutex<Vec<TxnId>>,
    pub(crate) num_deadlocks_resolved: AtomicU64,
}

impl LockManager for DdrLockManager {
    fn accept_transaction(&self, txn: &Transaction) -> bool {
        let mut txn_info = self.txn_info.lock();
        let info = txn_info.entry(txn.id).or_insert_with(|| {
            TxnInfo::new(
                txn.id,
                txn.involved_partitions.len() as i32,
                txn.num_required_locks() as i32,
            )
        });
        info.is_ready()
    }

    fn acquire_locks(&self, txn: &Transaction) -> AcquireLocksResult {
        let txn_id = txn.id;
        let home = txn.home;
        let is_remaster = txn.is_remaster();

        // The txn may contain keys homed in another region; only the keys
        // homed here count against this fragment.
        let mut num_relevant_locks = 0;
        let mut blocking_txns = vec![];
        {
            let mut lock_table = self.lock_table.lock();
            for entry in &txn.keys {
                if !is_remaster && entry.metadata.master != home {
                    continue;
                }
                num_relevant_locks += 1;

                let key_replica = KeyReplica::new(entry.key.clone(), home);
                let tail = lock_table.entry(key_replica).or_default();
                match entry.mode {
                    KeyMode::Read => {
                        if let Some(blocker) = tail.acquire_read_lock(txn_id) {
                            blocking_txns.push(blocker);
                        }
                    }
                    KeyMode::Write => {
                        blocking_txns.extend(tail.acquire_write_lock(txn_id));
                    }
                }
            }
            if lock_table.len() > LOCK_TABLE_SIZE_LIMIT {
                warn!(size = lock_table.len(), "lock table exceeds its soft cap");
            }
        }

        blocking_txns.sort_unstable();
        blocking_txns.dedup();

        let mut txn_info = self.txn_info.lock();
        txn_info.entry(txn_id).or_insert_with(|| {
            TxnInfo::new(
                txn_id,
                txn.involved_partitions.len() as i32,
                txn.num_required_locks() as i32,
            )
        });

        let mut new_edges = 0;
        for blocker in blocking_txns {
            // A txn can show up as its own blocker when it requests a read
            // and a write on the same key.
            if blocker == txn_id {
                continue;
            }
            // Ids read from the lock queue tails may belong to transactions
            // that already released.
            //
            // Let A block a multi-home txn B through two of B's lock-only
            // fragments: A is recorded twice here across the two calls, and
            // B appears twice in A's waited_by list, so releasing A
            // subtracts the matching count.
            if let Some(blocker_info) = txn_info.get_mut(&blocker) {
                blocker_info.waited_by.push(txn_id);
                new_edges += 1;
            }
        }

        let info = txn_info
            .get_mut(&txn_id)
            .expect("txn info inserted above must exist");
        info.unarrived_lock_requests -= num_relevant_locks;
        info.num_waiting_for += new_edges;
        if info.is_ready() {
            AcquireLocksResult::Acquired
        } else {
            AcquireLocksResult::Waiting
        }
    }

    fn release_locks(&self, txn_id: TxnId) -> Vec<(TxnId, bool)> {
        let mut txn_info = self.txn_info.lock();

        let info = match txn_info.remove(&txn_id) {
            Some(info) => info,
            None => return vec![],
        };
        assert!(
            info.is_ready(),
            "releasing unready txn {} is forbidden; unarrived lock requests: {}, \
             blocking txns: {}, deadlocked: {}",
            txn_id,
            info.unarrived_lock_requests,
            info.num_waiting_for,
            info.deadlocked,
        );

        let mut result = vec![];
        for blocked_txn_id in info.waited_by {
            if blocked_txn_id == SENTINEL_TXN_ID {
                continue;
            }
            let blocked_txn = match txn_info.get_mut(&blocked_txn_id) {
                Some(blocked_txn) => blocked_txn,
                None => {
                    warn!(blocked_txn_id, "blocked txn does not exist");
                    continue;
                }
            };
            blocked_txn.num_waiting_for -= 1;
            // The waited_by list may contain duplicates; the blocked txn
            // only becomes ready when its last entry is accounted for.
            if blocked_txn.is_ready() {
                result.push((blocked_txn_id, blocked_txn.deadlocked));
            }
        }
        result
    }

    fn get_ready_txns(&self) -> Vec<TxnId> {
        std::mem::take(&mut *self.ready_txns.lock())
    }

    fn get_stats(&self, level: u32) -> serde_json::Value {
        let mut stats = json!({
            "lock_manager_type": "ddr",
            "num_deadlocks_resolved": self.num_deadlocks_resolved.load(Ordering::Relaxed),
        });
        {
            let txn_info = self.txn_info.lock();
            stats["num_txns_waiting_for_lock"] = json!(txn_info.len());
            if level >= 1 {
                let graph: Vec<serde_json::Value> = txn_info
                    .values()
                    .map(|info| json!([info.id, info.waited_by]))
                    .collect();
                stats["waited_by_graph"] = json!(graph);
            }
        }
        if level >= 2 {
            let lock_table = self.lock_table.lock();
            let table: Vec<serde_json::Value> = lock_table
                .iter()
                .map(|(key_replica, tail)| {
                    json!([
                        key_replica.key,
                        key_replica.home,
                        tail.write_lock_requester().unwrap_or(SENTINEL_TXN_ID),
                        tail.read_lock_requesters(),
                    ])
                })
                .collect();
            stats["lock_table"] = json!(table);
        }
        stats
    }
}
