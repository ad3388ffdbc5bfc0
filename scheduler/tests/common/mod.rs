// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-process cluster harness: one region's worth of partition schedulers
//! wired through a shared broker, driven through the same envelopes the
//! sequencing layer would send.

use crossbeam_channel::Receiver;
use serval_config::{Configuration, ConfigurationRef, SchedulerConfig};
use serval_scheduler::{
    messages::{Envelope, Message, StatsRequest, StatsResponse, SCHEDULER_CHANNEL, SERVER_CHANNEL},
    Broker, BrokerRef, Scheduler, SchedulerHandle,
};
use serval_storage::{MemStorage, Record, Storage};
use serval_types::{
    transaction::{KeyEntry, Metadata, Program, Transaction, TransactionBuilder, TxnType},
    PartitionId, RegionId, TxnId,
};
use std::{
    cell::RefCell,
    sync::Arc,
    time::{Duration, Instant},
};

pub const COORDINATOR: u32 = 0;

pub struct TestCluster {
    broker: BrokerRef,
    configs: Vec<ConfigurationRef>,
    storages: Vec<Arc<MemStorage>>,
    handles: Vec<SchedulerHandle>,
    server_rx: Receiver<Envelope>,
    /// Completions that arrived while waiting for a different txn.
    pending: RefCell<Vec<(PartitionId, Transaction)>>,
}

impl TestCluster {
    /// Starts every partition of region 0. Tests use simple partitioning so
    /// integer keys land on predictable partitions.
    pub fn start(mut config: SchedulerConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        config.hash_partitioning = None;
        config.simple_partitioning = true;
        let broker = Broker::new();
        let server_rx = broker.register(COORDINATOR, SERVER_CHANNEL);

        let mut configs = vec![];
        let mut storages = vec![];
        let mut handles = vec![];
        for partition in 0..config.num_partitions {
            let configuration = Configuration::new(config.clone(), 0, partition).unwrap();
            let storage = MemStorage::new();
            handles.push(Scheduler::start(
                configuration.clone(),
                storage.clone(),
                broker.clone(),
            ));
            configs.push(configuration);
            storages.push(storage);
        }
        Self {
            broker,
            configs,
            storages,
            handles,
            server_rx,
            pending: RefCell::new(vec![]),
        }
    }

    pub fn config(&self) -> &ConfigurationRef {
        &self.configs[0]
    }

    fn partition_of(&self, key: &str) -> PartitionId {
        self.configs[0].partition_of_key(&key.to_string())
    }

    pub fn seed(&self, key: &str, value: &str, metadata: Metadata) {
        let partition = self.partition_of(key) as usize;
        self.storages[partition].write(&key.to_string(), Record::new(value, metadata));
    }

    pub fn read(&self, key: &str) -> Option<Record> {
        let partition = self.partition_of(key) as usize;
        self.storages[partition].read(&key.to_string())
    }

    /// Sends a fragment to every involved partition, pruned to each
    /// partition's keys the way the interleaver would deliver it.
    pub fn forward(&self, txn: &Transaction) {
        for partition in &txn.involved_partitions {
            self.forward_to(*partition, txn);
        }
    }

    /// Sends a multi-home transaction the way the sequencing layer would:
    /// the header plus one lock-only fragment per involved region.
    pub fn forward_multi_home(&self, txn: &Transaction) {
        assert_eq!(txn.txn_type, TxnType::MultiHome);
        for home in &txn.involved_regions {
            self.forward(&lock_only(txn, *home));
        }
        self.forward(txn);
    }

    pub fn forward_to(&self, partition: PartitionId, txn: &Transaction) {
        let mut pruned = txn.clone();
        pruned
            .keys
            .retain(|entry| self.partition_of(&entry.key) == partition);
        assert!(
            !pruned.keys.is_empty(),
            "txn {} has no keys in partition {}",
            txn.id,
            partition
        );
        self.broker.send(
            partition,
            SCHEDULER_CHANNEL,
            Envelope {
                from: COORDINATOR,
                message: Message::ForwardTxn(Box::new(pruned)),
            },
        );
    }

    pub fn request_stats(&self, partition: PartitionId, id: u32, level: u32) {
        self.broker.send(
            partition,
            SCHEDULER_CHANNEL,
            Envelope {
                from: COORDINATOR,
                message: Message::Stats(StatsRequest { id, level }),
            },
        );
    }

    /// Collects `count` completed sub-txns for `txn_id`. Completions of
    /// other transactions are set aside for later waits.
    pub fn wait_for_completions(
        &self,
        txn_id: TxnId,
        count: usize,
        timeout: Duration,
    ) -> Vec<(PartitionId, Transaction)> {
        let deadline = Instant::now() + timeout;
        let mut completions = vec![];

        let mut pending = self.pending.borrow_mut();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].1.id == txn_id {
                completions.push(pending.remove(i));
            } else {
                i += 1;
            }
        }

        while completions.len() < count {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| {
                    panic!(
                        "timed out waiting for {} completions of txn {}, got {}",
                        count,
                        txn_id,
                        completions.len()
                    )
                });
            let env = self
                .server_rx
                .recv_timeout(remaining)
                .unwrap_or_else(|_| panic!("timed out waiting for completions of txn {}", txn_id));
            if let Message::CompletedSubTxn { partition, txn } = env.message {
                if txn.id == txn_id {
                    completions.push((partition, *txn));
                } else {
                    pending.push((partition, *txn));
                }
            }
        }
        completions
    }

    pub fn wait_for_stats(&self, id: u32, timeout: Duration) -> StatsResponse {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for stats response");
            let env = self
                .server_rx
                .recv_timeout(remaining)
                .expect("timed out waiting for stats response");
            if let Message::StatsResponse(response) = env.message {
                if response.id == id {
                    return response;
                }
            }
        }
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown();
        }
    }
}

/// Derives the lock-only fragment of a multi-home transaction for one home
/// region. Fragments carry the full key set; each partition prunes on
/// delivery and each fragment's acquire call filters by its home.
pub fn lock_only(txn: &Transaction, home: RegionId) -> Transaction {
    let mut fragment = txn.clone();
    fragment.txn_type = TxnType::LockOnly;
    fragment.home = home;
    fragment
}

/// Assembles a transaction with internal fields derived from its keys, the
/// way the forwarder and sequencer fill them in.
pub fn make_txn(
    config: &Configuration,
    id: TxnId,
    program: Program,
    keys: Vec<KeyEntry>,
) -> Transaction {
    let mut involved_partitions: Vec<PartitionId> = keys
        .iter()
        .map(|entry| config.partition_of_key(&entry.key))
        .collect();
    involved_partitions.sort_unstable();
    involved_partitions.dedup();

    let mut involved_regions: Vec<RegionId> =
        keys.iter().map(|entry| entry.metadata.master).collect();
    if let Program::Remaster { new_master } = &program {
        involved_regions.push(*new_master);
    }
    involved_regions.sort_unstable();
    involved_regions.dedup();

    let is_remaster = matches!(program, Program::Remaster { .. });
    let (txn_type, home) = if involved_regions.len() == 1 && !is_remaster {
        (TxnType::SingleHome, involved_regions[0])
    } else {
        (TxnType::MultiHome, involved_regions[0])
    };

    let builder = TransactionBuilder::new(id)
        .txn_type(txn_type)
        .home(home)
        .coordinating_server(COORDINATOR)
        .involved_partitions(involved_partitions.clone())
        .active_partitions(involved_partitions)
        .involved_regions(involved_regions)
        .program(program);
    keys.into_iter().fold(builder, |b, k| b.key(k)).build()
}

pub fn set(key: &str, value: &str) -> serval_types::transaction::Command {
    serval_types::transaction::Command::Set {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub fn get(key: &str) -> serval_types::transaction::Command {
    serval_types::transaction::Command::Get {
        key: key.to_string(),
    }
}
