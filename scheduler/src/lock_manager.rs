// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{ddr_lock_manager::DdrLockManager, simple_lock_manager::SimpleLockManager};
use serval_config::LockManagerKind;
use serval_types::{transaction::Transaction, TxnId};
use std::sync::Arc;

/// Soft cap on the number of tracked key replicas. Exceeding it is logged,
/// not enforced; upstream admission control keeps it from growing unbounded.
pub const LOCK_TABLE_SIZE_LIMIT: usize = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireLocksResult {
    Acquired,
    Waiting,
    Abort,
}

/// Capability set shared by the lock manager variants. The scheduler only
/// talks to this interface; the variant is picked at startup from the
/// configuration.
pub trait LockManager: Send + Sync {
    /// Registers a transaction without contributing locks. Returns true if
    /// the transaction already holds everything it needs, which happens
    /// when a multi-home header arrives after all of its lock-only
    /// fragments were granted.
    fn accept_transaction(&self, txn: &Transaction) -> bool;

    /// Acquires the locks one fragment contributes. Blocked transactions
    /// are queued; the result says whether the whole transaction is now
    /// dispatchable.
    fn acquire_locks(&self, txn: &Transaction) -> AcquireLocksResult;

    /// Releases everything a transaction holds or waits for. Returns the
    /// transactions that became dispatchable, each with its deadlocked
    /// flag.
    fn release_locks(&self, txn_id: TxnId) -> Vec<(TxnId, bool)>;

    /// Drains the set of transactions made ready asynchronously by the
    /// deadlock resolver. Empty for variants without a resolver.
    fn get_ready_txns(&self) -> Vec<TxnId>;

    fn get_stats(&self, level: u32) -> serde_json::Value;
}

/// Builds the configured lock manager. The DDR manager is also returned
/// concretely so the caller can hand it to a deadlock resolver.
pub fn make_lock_manager(
    kind: LockManagerKind,
) -> (Arc<dyn LockManager>, Option<Arc<DdrLockManager>>) {
    match kind {
        LockManagerKind::Ddr => {
            let ddr = Arc::new(DdrLockManager::default());
            let lock_manager: Arc<dyn LockManager> = ddr.clone();
            (lock_manager, Some(ddr))
        }
        LockManagerKind::SimpleQueue => (Arc::new(SimpleLockManager::default()), None),
    }
}
