// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use serval_config::{ConfigurationRef, ExecutionKind};
use serval_storage::{Record, Storage, StorageRef};
use serval_types::transaction::{Command, KeyMode, Program, Transaction, TxnStatus};

/// Runs the program of a dispatched transaction against the assembled
/// key-value view. Implementations must leave the transaction either
/// COMMITTED or ABORTED with a reason.
pub trait Execution: Send + Sync {
    fn execute(&self, txn: &mut Transaction);
}

pub fn make_execution(
    kind: ExecutionKind,
    config: ConfigurationRef,
    storage: StorageRef,
) -> Box<dyn Execution> {
    match kind {
        ExecutionKind::KeyValue => Box::new(KeyValueExecution { config, storage }),
        ExecutionKind::Noop => Box::new(NoopExecution),
    }
}

/// Interprets `Program::Commands`. Reads come from the view the worker
/// assembled out of local and remote reads; writes land in `new_value` and,
/// for keys of the local partition, in storage.
pub struct KeyValueExecution {
    config: ConfigurationRef,
    storage: StorageRef,
}

impl KeyValueExecution {
    fn apply_write(&self, txn: &mut Transaction, key: &str, value: String) {
        let entry = txn
            .key_entry_mut(key)
            .expect("write target checked before applying");
        entry.new_value = Some(value.clone());
        let metadata = entry.metadata;
        let key = key.to_string();
        if self.config.key_is_in_local_partition(&key) {
            let record = match self.storage.read(&key) {
                Some(mut record) => {
                    record.value = value;
                    record
                }
                None => Record::new(value, metadata),
            };
            self.storage.write(&key, record);
        }
    }
}

impl Execution for KeyValueExecution {
    fn execute(&self, txn: &mut Transaction) {
        let commands = match &txn.program {
            Program::Commands(commands) => commands.clone(),
            Program::Remaster { .. } => {
                unreachable!("remaster transactions are applied by the worker")
            }
        };
        for command in commands {
            match command {
                Command::Get { key } => {
                    if txn.key_entry(&key).is_none() {
                        txn.set_aborted(format!("key {key} is not in the read set"));
                        break;
                    }
                }
                Command::Set { key, value } => {
                    if !writable(txn, &key) {
                        txn.set_aborted(format!("key {key} is not in the write set"));
                        break;
                    }
                    self.apply_write(txn, &key, value);
                }
                Command::Del { key } => {
                    if !writable(txn, &key) {
                        txn.set_aborted(format!("key {key} is not in the write set"));
                        break;
                    }
                    txn.key_entry_mut(&key).unwrap().new_value = None;
                    if self.config.key_is_in_local_partition(&key) {
                        self.storage.delete(&key);
                    }
                }
                Command::Copy { src, dst } => {
                    let value = match txn.key_entry(&src).and_then(|e| e.value.clone()) {
                        Some(value) => value,
                        None => {
                            txn.set_aborted(format!("key {src} is not in the read set"));
                            break;
                        }
                    };
                    if !writable(txn, &dst) {
                        txn.set_aborted(format!("key {dst} is not in the write set"));
                        break;
                    }
                    self.apply_write(txn, &dst, value);
                }
            }
        }
        if !txn.is_aborted() {
            txn.status = TxnStatus::Committed;
        }
    }
}

fn writable(txn: &Transaction, key: &str) -> bool {
    matches!(
        txn.key_entry(key),
        Some(entry) if entry.mode == KeyMode::Write
    )
}

/// Commits without touching data; used for scheduling benchmarks.
pub struct NoopExecution;

impl Execution for NoopExecution {
    fn execute(&self, txn: &mut Transaction) {
        if !txn.is_aborted() {
            txn.status = TxnStatus::Committed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serval_config::{Configuration, SchedulerConfig};
    use serval_storage::MemStorage;
    use serval_types::transaction::{KeyEntry, Metadata, TransactionBuilder};
    use std::sync::Arc;

    fn single_partition_execution() -> (KeyValueExecution, StorageRef) {
        let config = Configuration::new(
            SchedulerConfig {
                num_workers: 1,
                ..SchedulerConfig::default()
            },
            0,
            0,
        )
        .unwrap();
        let storage: StorageRef = MemStorage::new();
        (
            KeyValueExecution {
                config,
                storage: Arc::clone(&storage),
            },
            storage,
        )
    }

    fn txn_with(program: Vec<Command>, keys: Vec<KeyEntry>) -> Transaction {
        let builder = TransactionBuilder::new(1)
            .involved_partitions(vec![0])
            .program(Program::Commands(program));
        keys.into_iter().fold(builder, |b, k| b.key(k)).build()
    }

    #[test]
    fn set_commits_and_writes_storage() {
        let (execution, storage) = single_partition_execution();
        let mut txn = txn_with(
            vec![Command::Set {
                key: "a".to_string(),
                value: "1".to_string(),
            }],
            vec![KeyEntry::write("a", Metadata::default())],
        );
        execution.execute(&mut txn);
        assert_eq!(txn.status, TxnStatus::Committed);
        assert_eq!(storage.read(&"a".to_string()).unwrap().value, "1");
        assert_eq!(txn.key_entry("a").unwrap().new_value.as_deref(), Some("1"));
    }

    #[test]
    fn write_outside_the_write_set_aborts() {
        let (execution, storage) = single_partition_execution();
        let mut txn = txn_with(
            vec![Command::Set {
                key: "a".to_string(),
                value: "1".to_string(),
            }],
            vec![KeyEntry::read("a", Metadata::default())],
        );
        execution.execute(&mut txn);
        assert_eq!(txn.status, TxnStatus::Aborted);
        assert_eq!(txn.abort_reason, "key a is not in the write set");
        assert!(storage.read(&"a".to_string()).is_none());
    }

    #[test]
    fn copy_moves_a_read_value_into_a_write() {
        let (execution, storage) = single_partition_execution();
        let mut src = KeyEntry::read("src", Metadata::default());
        src.value = Some("42".to_string());
        let mut txn = txn_with(
            vec![Command::Copy {
                src: "src".to_string(),
                dst: "dst".to_string(),
            }],
            vec![src, KeyEntry::write("dst", Metadata::default())],
        );
        execution.execute(&mut txn);
        assert_eq!(txn.status, TxnStatus::Committed);
        assert_eq!(storage.read(&"dst".to_string()).unwrap().value, "42");
    }

    #[test]
    fn del_removes_the_record() {
        let (execution, storage) = single_partition_execution();
        storage.write(&"a".to_string(), Record::new("x", Metadata::default()));
        let mut txn = txn_with(
            vec![Command::Del {
                key: "a".to_string(),
            }],
            vec![KeyEntry::write("a", Metadata::default())],
        );
        execution.execute(&mut txn);
        assert_eq!(txn.status, TxnStatus::Committed);
        assert!(storage.read(&"a".to_string()).is_none());
    }

    #[test]
    fn aborted_txn_stays_aborted() {
        let (execution, _) = single_partition_execution();
        let mut txn = txn_with(vec![], vec![]);
        txn.set_aborted("outdated master");
        NoopExecution.execute(&mut txn);
        assert_eq!(txn.status, TxnStatus::Aborted);
        execution.execute(&mut txn);
        assert_eq!(txn.status, TxnStatus::Aborted);
        assert_eq!(txn.abort_reason, "outdated master");
    }
}
