// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Key, MachineId, PartitionId, RegionId, TxnId, Value};
use serde::{Deserialize, Serialize};

/// Lock mode requested for a key entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    #[default]
    NotStarted,
    Committed,
    Aborted,
}

/// How a transaction is delivered to a partition. A multi-home transaction
/// decomposes into one lock-only fragment per participating home region plus
/// a header that carries the program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnType {
    SingleHome,
    MultiHome,
    LockOnly,
}

/// Mastership metadata attached to each key: the region holding the
/// authoritative copy and the number of times the key has been remastered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub master: RegionId,
    pub counter: u64,
}

impl Metadata {
    pub fn new(master: RegionId, counter: u64) -> Self {
        Self { master, counter }
    }
}

/// One key accessed by a transaction. `value` is filled in by the worker
/// from local storage (or from a peer partition's remote read); `new_value`
/// is produced by the program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: Key,
    pub mode: KeyMode,
    pub metadata: Metadata,
    pub value: Option<Value>,
    pub new_value: Option<Value>,
}

impl KeyEntry {
    pub fn read(key: impl Into<Key>, metadata: Metadata) -> Self {
        Self {
            key: key.into(),
            mode: KeyMode::Read,
            metadata,
            value: None,
            new_value: None,
        }
    }

    pub fn write(key: impl Into<Key>, metadata: Metadata) -> Self {
        Self {
            key: key.into(),
            mode: KeyMode::Write,
            metadata,
            value: None,
            new_value: None,
        }
    }
}

/// A single step of a key-value program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get { key: Key },
    Set { key: Key, value: Value },
    Del { key: Key },
    Copy { src: Key, dst: Key },
}

/// The transaction body: either a list of key-value commands or a remaster
/// directive moving a single key to a new master region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Program {
    Commands(Vec<Command>),
    Remaster { new_master: RegionId },
}

/// A transaction as seen by a partition. Upstream layers prune the key set
/// to the receiving partition before delivery, so `keys` only ever contains
/// keys this partition is responsible for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub txn_type: TxnType,
    /// Home region of this fragment. For a single-home txn this is the home
    /// of every key; for a lock-only fragment it names the region whose
    /// locks the fragment acquires.
    pub home: RegionId,
    pub coordinating_server: MachineId,
    pub involved_partitions: Vec<PartitionId>,
    pub active_partitions: Vec<PartitionId>,
    pub involved_regions: Vec<RegionId>,
    pub program: Program,
    pub keys: Vec<KeyEntry>,
    pub status: TxnStatus,
    pub abort_reason: String,
}

impl Transaction {
    pub fn is_remaster(&self) -> bool {
        matches!(self.program, Program::Remaster { .. })
    }

    pub fn remaster_new_master(&self) -> Option<RegionId> {
        match self.program {
            Program::Remaster { new_master } => Some(new_master),
            Program::Commands(_) => None,
        }
    }

    /// Number of locks the whole transaction needs at this partition. A
    /// remaster has a single key but locks it under both the old and the
    /// new home region.
    pub fn num_required_locks(&self) -> usize {
        if self.is_remaster() {
            2
        } else {
            self.keys.len()
        }
    }

    pub fn key_entry(&self, key: &str) -> Option<&KeyEntry> {
        self.keys.iter().find(|e| e.key == key)
    }

    pub fn key_entry_mut(&mut self, key: &str) -> Option<&mut KeyEntry> {
        self.keys.iter_mut().find(|e| e.key == key)
    }

    pub fn set_aborted(&mut self, reason: impl Into<String>) {
        self.status = TxnStatus::Aborted;
        self.abort_reason = reason.into();
    }

    pub fn is_aborted(&self) -> bool {
        self.status == TxnStatus::Aborted
    }
}

/// Builder used by workload generators and tests to assemble transactions
/// with consistent internal fields.
pub struct TransactionBuilder {
    txn: Transaction,
}

impl TransactionBuilder {
    pub fn new(id: TxnId) -> Self {
        Self {
            txn: Transaction {
                id,
                txn_type: TxnType::SingleHome,
                home: 0,
                coordinating_server: 0,
                involved_partitions: vec![],
                active_partitions: vec![],
                involved_regions: vec![],
                program: Program::Commands(vec![]),
                keys: vec![],
                status: TxnStatus::NotStarted,
                abort_reason: String::new(),
            },
        }
    }

    pub fn txn_type(mut self, txn_type: TxnType) -> Self {
        self.txn.txn_type = txn_type;
        self
    }

    pub fn home(mut self, home: RegionId) -> Self {
        self.txn.home = home;
        self
    }

    pub fn coordinating_server(mut self, server: MachineId) -> Self {
        self.txn.coordinating_server = server;
        self
    }

    pub fn involved_partitions(mut self, partitions: Vec<PartitionId>) -> Self {
        self.txn.involved_partitions = partitions;
        self
    }

    pub fn active_partitions(mut self, partitions: Vec<PartitionId>) -> Self {
        self.txn.active_partitions = partitions;
        self
    }

    pub fn involved_regions(mut self, regions: Vec<RegionId>) -> Self {
        self.txn.involved_regions = regions;
        self
    }

    pub fn program(mut self, program: Program) -> Self {
        self.txn.program = program;
        self
    }

    pub fn key(mut self, entry: KeyEntry) -> Self {
        self.txn.keys.push(entry);
        self
    }

    pub fn build(self) -> Transaction {
        self.txn
    }
}
