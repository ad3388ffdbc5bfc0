// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod transaction;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a transaction. Unique for the lifetime of a process and
/// never reused: once a txn id has passed through a lock manager, no later
/// transaction may carry the same id.
pub type TxnId = u64;

/// Txn id 0 is reserved. The lock manager uses it to blank out edges in the
/// wait-for graph without shrinking the edge list.
pub const SENTINEL_TXN_ID: TxnId = 0;

pub type RegionId = u32;
pub type PartitionId = u32;

/// Dense machine identifier: `region * num_partitions + partition`.
/// Packing and unpacking live on the configuration, which knows the grid.
pub type MachineId = u32;

/// Keys are opaque byte strings. Values are whatever the client stored.
pub type Key = String;
pub type Value = String;

/// A single execution attempt of a transaction. A transaction that was
/// rewired by the deadlock resolver is dispatched again as a distinct run so
/// that remote-read streams from the two dispatches do not collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub txn_id: TxnId,
    pub deadlocked: bool,
}

impl RunId {
    pub fn new(txn_id: TxnId, deadlocked: bool) -> Self {
        Self { txn_id, deadlocked }
    }

    /// Broker redirect tag for this run. Assumes at most one re-run per txn.
    pub fn tag(&self) -> u64 {
        self.txn_id * 10 + self.deadlocked as u64
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.txn_id, self.deadlocked as u8)
    }
}

/// Unit of locking: a key paired with the region that masters it. A remaster
/// transaction locks the same key under both the old and the new region.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyReplica {
    pub key: Key,
    pub home: RegionId,
}

impl KeyReplica {
    pub fn new(key: Key, home: RegionId) -> Self {
        Self { key, home }
    }
}

impl fmt::Display for KeyReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.key, self.home)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_tag_separates_reruns() {
        let first = RunId::new(42, false);
        let rerun = RunId::new(42, true);
        assert_ne!(first.tag(), rerun.tag());
        assert_eq!(first.tag(), 420);
        assert_eq!(rerun.tag(), 421);
    }

    #[test]
    fn key_replica_distinguishes_homes() {
        let a = KeyReplica::new("alice".to_string(), 0);
        let b = KeyReplica::new("alice".to_string(), 1);
        assert_ne!(a, b);
    }
}
