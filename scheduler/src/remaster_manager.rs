// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use serval_storage::{Storage, StorageRef};
use serval_types::{
    transaction::{Transaction, TxnType},
    Key, RegionId, TxnId,
};
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMasterResult {
    Valid,
    Waiting,
    Abort,
}

/// Identity of a fragment parked in the remaster manager. The scheduler
/// owns the transactions themselves and resolves these back through its
/// registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParkedTxn {
    pub txn_id: TxnId,
    /// Home region for a lock-only fragment, `None` for a single-home txn.
    pub lock_only_home: Option<RegionId>,
}

impl ParkedTxn {
    fn from_txn(txn: &Transaction) -> Self {
        Self {
            txn_id: txn.id,
            lock_only_home: match txn.txn_type {
                TxnType::LockOnly => Some(txn.home),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct RemasterOccurredResult {
    /// Fragments whose counters are now fully valid; the scheduler sends
    /// them on to the lock manager.
    pub unblocked: Vec<ParkedTxn>,
    /// Fragments that turned out stale; the scheduler aborts them.
    pub should_abort: Vec<ParkedTxn>,
}

struct WaitingTxn {
    parked: ParkedTxn,
    /// Every key of the fragment with the counter the txn was built
    /// against, re-verified in full whenever the blocking key moves.
    keys: Vec<(Key, u64)>,
}

/// Validates each transaction's key counters against storage before the
/// transaction reaches the lock manager. A transaction that is ahead of
/// storage is held here until the remaster that it anticipates commits; a
/// transaction behind storage is stale and aborts.
pub struct SimpleRemasterManager {
    storage: StorageRef,
    waiting: HashMap<Key, Vec<WaitingTxn>>,
}

impl SimpleRemasterManager {
    pub fn new(storage: StorageRef) -> Self {
        Self {
            storage,
            waiting: HashMap::new(),
        }
    }

    /// Checks all counters of one fragment. `Waiting` parks the fragment
    /// under the first key whose stored counter lags the transaction's.
    pub fn verify_master(&mut self, txn: &Transaction) -> VerifyMasterResult {
        let keys: Vec<(Key, u64)> = txn
            .keys
            .iter()
            .map(|e| (e.key.clone(), e.metadata.counter))
            .collect();
        match self.check_counters(&keys) {
            CounterCheck::Valid => VerifyMasterResult::Valid,
            CounterCheck::Abort => VerifyMasterResult::Abort,
            CounterCheck::WaitingOn(key) => {
                debug!(txn_id = txn.id, key = %key, "txn waiting on remaster");
                self.waiting.entry(key).or_default().push(WaitingTxn {
                    parked: ParkedTxn::from_txn(txn),
                    keys,
                });
                VerifyMasterResult::Waiting
            }
        }
    }

    /// A remaster of `key` committed, raising its stored counter to
    /// `new_counter`. Waiters at the new counter are re-verified and either
    /// released or re-parked on their next lagging key; waiters below it
    /// can never become valid and abort.
    pub fn remaster_occurred(&mut self, key: &Key, new_counter: u64) -> RemasterOccurredResult {
        let mut result = RemasterOccurredResult::default();
        let waiters = match self.waiting.remove(key) {
            Some(waiters) => waiters,
            None => return result,
        };
        for waiter in waiters {
            let expected = waiter
                .keys
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, counter)| *counter)
                .expect("parked txn must reference the key it waits on");
            if expected < new_counter {
                result.should_abort.push(waiter.parked);
                continue;
            }
            if expected > new_counter {
                // Still ahead of storage; wait for a later remaster.
                self.waiting.entry(key.clone()).or_default().push(waiter);
                continue;
            }
            match self.check_counters(&waiter.keys) {
                CounterCheck::Valid => result.unblocked.push(waiter.parked),
                CounterCheck::Abort => result.should_abort.push(waiter.parked),
                CounterCheck::WaitingOn(next_key) => {
                    self.waiting.entry(next_key).or_default().push(waiter);
                }
            }
        }
        result
    }

    /// Drops every parked fragment of an aborting transaction. Nothing
    /// becomes verifiable through the removal itself, so the returned
    /// result only exists to mirror `remaster_occurred`.
    pub fn release_transaction(&mut self, txn_id: TxnId) -> RemasterOccurredResult {
        self.waiting.retain(|_, waiters| {
            waiters.retain(|w| w.parked.txn_id != txn_id);
            !waiters.is_empty()
        });
        RemasterOccurredResult::default()
    }

    fn check_counters(&self, keys: &[(Key, u64)]) -> CounterCheck {
        for (key, txn_counter) in keys {
            let stored_counter = self
                .storage
                .read(key)
                .map(|record| record.metadata.counter)
                .unwrap_or_default();
            if stored_counter > *txn_counter {
                return CounterCheck::Abort;
            }
            if stored_counter < *txn_counter {
                return CounterCheck::WaitingOn(key.clone());
            }
        }
        CounterCheck::Valid
    }
}

enum CounterCheck {
    Valid,
    Abort,
    WaitingOn(Key),
}
