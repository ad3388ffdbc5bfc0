// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::lock_manager::{AcquireLocksResult, LockManager, LOCK_TABLE_SIZE_LIMIT};
use parking_lot::Mutex;
use serde_json::json;
use serval_types::{
    transaction::{KeyMode, Transaction},
    KeyReplica, TxnId,
};
use std::collections::HashMap;
use tracing::warn;

/// Full wait queue for one key replica. The granted prefix is the leading
/// run of reads, or the single leading write.
#[derive(Default)]
struct LockQueue {
    requests: Vec<LockRequest>,
}

struct LockRequest {
    txn_id: TxnId,
    mode: KeyMode,
    granted: bool,
    /// Number of key entries this request stands for. A txn that reads and
    /// writes the same key is queued once with the write mode but still
    /// needs credit for both entries.
    multiplicity: usize,
}

impl LockQueue {
    fn grant_prefix_len(&self) -> usize {
        match self.requests.first() {
            None => 0,
            Some(first) if first.mode == KeyMode::Write => 1,
            Some(_) => self
                .requests
                .iter()
                .take_while(|r| r.mode == KeyMode::Read)
                .count(),
        }
    }

    /// Appends a request and reports whether it is granted right away.
    fn push(&mut self, txn_id: TxnId, mode: KeyMode, multiplicity: usize) -> bool {
        self.requests.push(LockRequest {
            txn_id,
            mode,
            granted: false,
            multiplicity,
        });
        let granted = self.requests.len() <= self.grant_prefix_len();
        self.requests.last_mut().unwrap().granted = granted;
        granted
    }

    /// Removes every request of `txn_id` and grants what moved into the
    /// prefix. Returns the newly granted txn ids with their multiplicities.
    fn remove(&mut self, txn_id: TxnId) -> Vec<(TxnId, usize)> {
        self.requests.retain(|r| r.txn_id != txn_id);
        let prefix = self.grant_prefix_len();
        let mut newly_granted = vec![];
        for request in &mut self.requests[..prefix] {
            if !request.granted {
                request.granted = true;
                newly_granted.push((request.txn_id, request.multiplicity));
            }
        }
        newly_granted
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Default)]
struct TxnLockState {
    needed: usize,
    granted: usize,
    key_replicas: Vec<KeyReplica>,
}

#[derive(Default)]
struct SimpleLockManagerInner {
    lock_table: HashMap<KeyReplica, LockQueue>,
    txn_locks: HashMap<TxnId, TxnLockState>,
}

/// Classical deterministic lock manager: per key-replica FIFO wait queues
/// with read sharing, no deadlock resolution. Kept as the non-DDR variant;
/// under it the scheduler's pre-dispatch abort path is active.
#[derive(Default)]
pub struct SimpleLockManager {
    inner: Mutex<SimpleLockManagerInner>,
}

impl SimpleLockManagerInner {
    fn state(&mut self, txn: &Transaction) -> &mut TxnLockState {
        self.txn_locks.entry(txn.id).or_insert_with(|| TxnLockState {
            needed: txn.num_required_locks(),
            ..TxnLockState::default()
        })
    }
}

impl LockManager for SimpleLockManager {
    fn accept_transaction(&self, txn: &Transaction) -> bool {
        let mut inner = self.inner.lock();
        let state = inner.state(txn);
        state.granted == state.needed
    }

    fn acquire_locks(&self, txn: &Transaction) -> AcquireLocksResult {
        let txn_id = txn.id;
        let home = txn.home;
        let is_remaster = txn.is_remaster();

        // Collapse duplicate keys to their strongest mode so a txn that
        // reads and writes the same key queues one upgraded request instead
        // of blocking on itself.
        let mut requests: Vec<(&str, KeyMode, usize)> = vec![];
        for entry in &txn.keys {
            if !is_remaster && entry.metadata.master != home {
                continue;
            }
            match requests.iter().position(|(key, _, _)| *key == entry.key) {
                Some(i) => {
                    let (_, mode, multiplicity) = &mut requests[i];
                    if entry.mode == KeyMode::Write {
                        *mode = KeyMode::Write;
                    }
                    *multiplicity += 1;
                }
                None => requests.push((entry.key.as_str(), entry.mode, 1)),
            }
        }

        let mut inner = self.inner.lock();
        inner.state(txn);

        let mut granted_now = 0;
        let mut touched = vec![];
        for (key, mode, multiplicity) in requests {
            let key_replica = KeyReplica::new(key.to_string(), home);
            touched.push(key_replica.clone());
            let queue = inner.lock_table.entry(key_replica).or_default();
            if queue.push(txn_id, mode, multiplicity) {
                granted_now += multiplicity;
            }
        }
        if inner.lock_table.len() > LOCK_TABLE_SIZE_LIMIT {
            warn!(
                size = inner.lock_table.len(),
                "lock table exceeds its soft cap"
            );
        }

        let state = inner
            .txn_locks
            .get_mut(&txn_id)
            .expect("txn lock state inserted above must exist");
        state.granted += granted_now;
        state.key_replicas.extend(touched);
        if state.granted == state.needed {
            AcquireLocksResult::Acquired
        } else {
            AcquireLocksResult::Waiting
        }
    }

    fn release_locks(&self, txn_id: TxnId) -> Vec<(TxnId, bool)> {
        let mut inner = self.inner.lock();
        let state = match inner.txn_locks.remove(&txn_id) {
            Some(state) => state,
            None => return vec![],
        };

        let mut newly_granted = vec![];
        for key_replica in state.key_replicas {
            if let Some(queue) = inner.lock_table.get_mut(&key_replica) {
                newly_granted.extend(queue.remove(txn_id));
                if queue.is_empty() {
                    inner.lock_table.remove(&key_replica);
                }
            }
        }

        let mut result = vec![];
        for (granted_txn_id, multiplicity) in newly_granted {
            let state = match inner.txn_locks.get_mut(&granted_txn_id) {
                Some(state) => state,
                None => {
                    warn!(granted_txn_id, "granted txn does not exist");
                    continue;
                }
            };
            state.granted += multiplicity;
            if state.granted == state.needed {
                result.push((granted_txn_id, false));
            }
        }
        result
    }

    fn get_ready_txns(&self) -> Vec<TxnId> {
        vec![]
    }

    fn get_stats(&self, level: u32) -> serde_json::Value {
        let inner = self.inner.lock();
        let mut stats = json!({
            "lock_manager_type": "simple_queue",
            "num_txns_waiting_for_lock": inner
                .txn_locks
                .values()
                .filter(|s| s.granted < s.needed)
                .count(),
        });
        if level >= 2 {
            let table: Vec<serde_json::Value> = inner
                .lock_table
                .iter()
                .map(|(key_replica, queue)| {
                    let requests: Vec<serde_json::Value> = queue
                        .requests
                        .iter()
                        .map(|r| json!([r.txn_id, format!("{:?}", r.mode), r.granted]))
                        .collect();
                    json!([key_replica.key, key_replica.home, requests])
                })
                .collect();
            stats["lock_table"] = json!(table);
        }
        stats
    }
}
