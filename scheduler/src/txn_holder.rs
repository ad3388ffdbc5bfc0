// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use serval_types::{transaction::Transaction, Key, RegionId};
use std::sync::Arc;

/// The dispatchable form of a transaction. The scheduler keeps the holder
/// in its registry and hands workers a shared reference; the worker fills
/// in reads, runs the program and stashes the remaster outcome here.
pub struct TxnHolder {
    pub txn: Transaction,
    /// Set by the worker when a remaster commits: the key and its new
    /// counter, consumed by the scheduler to release remaster waiters.
    pub remaster_result: Option<(Key, u64)>,
}

impl TxnHolder {
    pub fn new(txn: Transaction) -> TxnHolderRef {
        Arc::new(Mutex::new(Self {
            txn,
            remaster_result: None,
        }))
    }
}

pub type TxnHolderRef = Arc<Mutex<TxnHolder>>;

/// Registry entry assembling one in-flight transaction out of its
/// fragments. A single-home txn is complete on arrival; a multi-home txn is
/// complete once the header and every expected lock-only fragment filled
/// their slots.
pub(crate) struct ActiveTxn {
    holder: Option<TxnHolderRef>,
    /// Lock-only fragments in a fixed slot array indexed by home region.
    lock_only: Vec<Option<Transaction>>,
    num_lock_only: usize,
    expected_num_lock_only: usize,
    pub(crate) aborting: bool,
    pub(crate) done: bool,
    /// Abort reason decided before the header arrived, applied once it
    /// does.
    pub(crate) pending_abort_reason: Option<String>,
}

impl ActiveTxn {
    /// Creates the entry from whichever fragment arrives first. All
    /// fragments of a txn agree on the involved regions, so the expected
    /// fragment count is fixed at creation.
    pub(crate) fn new(first_fragment: &Transaction, num_regions: u32) -> Self {
        let expected_num_lock_only = match first_fragment.txn_type {
            serval_types::transaction::TxnType::SingleHome => 0,
            _ => first_fragment.involved_regions.len(),
        };
        Self {
            holder: None,
            lock_only: (0..num_regions).map(|_| None).collect(),
            num_lock_only: 0,
            expected_num_lock_only,
            aborting: false,
            done: false,
            pending_abort_reason: None,
        }
    }

    /// Installs the single-home txn or multi-home header. False on a
    /// duplicate.
    pub(crate) fn set_header(&mut self, txn: Transaction) -> bool {
        if self.holder.is_some() {
            return false;
        }
        self.holder = Some(TxnHolder::new(txn));
        true
    }

    /// Fills the lock-only slot for the fragment's home. False on a
    /// duplicate.
    pub(crate) fn add_lock_only(&mut self, txn: Transaction) -> bool {
        let slot = match self.lock_only.get_mut(txn.home as usize) {
            Some(slot) => slot,
            None => return false,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(txn);
        self.num_lock_only += 1;
        true
    }

    pub(crate) fn holder(&self) -> Option<&TxnHolderRef> {
        self.holder.as_ref()
    }

    pub(crate) fn lock_only(&self, home: RegionId) -> Option<&Transaction> {
        self.lock_only.get(home as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn is_ready_for_gc(&self) -> bool {
        self.done && self.num_lock_only == self.expected_num_lock_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serval_types::transaction::{
        KeyEntry, Metadata, Program, TransactionBuilder, TxnType,
    };

    fn header(id: u64) -> Transaction {
        TransactionBuilder::new(id)
            .txn_type(TxnType::MultiHome)
            .involved_regions(vec![0, 1])
            .program(Program::Commands(vec![]))
            .key(KeyEntry::write("k", Metadata::default()))
            .build()
    }

    fn fragment(id: u64, home: u32) -> Transaction {
        TransactionBuilder::new(id)
            .txn_type(TxnType::LockOnly)
            .involved_regions(vec![0, 1])
            .home(home)
            .key(KeyEntry::write("k", Metadata::default()))
            .build()
    }

    #[test]
    fn multi_home_assembles_from_fragments_in_any_order() {
        let frag = fragment(1, 1);
        let mut active = ActiveTxn::new(&frag, 2);
        assert!(active.add_lock_only(frag));
        assert!(active.lock_only(1).is_some());
        assert!(active.lock_only(0).is_none());

        assert!(active.add_lock_only(fragment(1, 0)));
        assert!(active.set_header(header(1)));
        assert!(active.holder().is_some());

        assert!(!active.is_ready_for_gc());
        active.done = true;
        assert!(active.is_ready_for_gc());
    }

    #[test]
    fn duplicate_fragments_are_rejected() {
        let frag = fragment(2, 0);
        let mut active = ActiveTxn::new(&frag, 2);
        assert!(active.add_lock_only(frag));
        assert!(!active.add_lock_only(fragment(2, 0)));

        assert!(active.set_header(header(2)));
        assert!(!active.set_header(header(2)));
    }

    #[test]
    fn gc_waits_for_missing_fragments() {
        let mut active = ActiveTxn::new(&header(3), 2);
        assert!(active.set_header(header(3)));
        active.done = true;
        // One lock-only fragment is still in flight.
        assert!(active.add_lock_only(fragment(3, 0)));
        assert!(!active.is_ready_for_gc());
        assert!(active.add_lock_only(fragment(3, 1)));
        assert!(active.is_ready_for_gc());
    }
}
