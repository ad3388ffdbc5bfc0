// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serval_types::{Key, MachineId, PartitionId, RegionId};
use std::{fs, path::Path, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Which lock manager variant the scheduler runs with. The original source
/// selected these with compile-time flags; here they are a startup choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockManagerKind {
    /// Deterministic Deadlock Resolving: tail-only lock queues plus a
    /// companion resolver that rewires stable cycles. Pre-dispatch aborts
    /// are disabled under this variant.
    #[default]
    Ddr,
    /// Classical deterministic per-key FIFO wait queues, no deadlock
    /// resolution.
    SimpleQueue,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemasterProtocol {
    /// Counter validation in the remaster manager before lock acquisition,
    /// and again in the worker before reading.
    Simple,
    /// No counter validation before dispatch; remasters are ordered like any
    /// other multi-home transaction.
    #[default]
    Counterless,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    #[default]
    KeyValue,
    Noop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPartitioning {
    /// Number of leading key bytes fed to the hash when routing a key to a
    /// partition.
    pub partition_key_num_bytes: usize,
}

impl Default for HashPartitioning {
    fn default() -> Self {
        Self {
            partition_key_num_bytes: 8,
        }
    }
}

/// File-loadable portion of the configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Transport family used by the outer layers ("tcp" or "ipc"). The core
    /// never opens sockets itself; the value is validated and passed along.
    pub protocol: String,
    pub num_regions: u32,
    pub num_partitions: u32,
    pub num_workers: usize,
    /// Period of the deadlock resolver. Zero disables it.
    pub ddr_interval_ms: u64,
    /// Send multi-home txns directly to the involved regions instead of the
    /// multi-home orderer.
    pub bypass_mh_orderer: bool,
    /// Strip payload from the transaction returned to the client.
    pub return_dummy_txn: bool,
    pub hash_partitioning: Option<HashPartitioning>,
    pub simple_partitioning: bool,
    pub replication_factor: u32,
    /// Soft cap on the active-txn table. Exceeding it is logged, not
    /// enforced.
    pub scheduler_max_txns: usize,
    pub poll_timeout_ms: u64,
    pub lock_manager: LockManagerKind,
    pub remaster_protocol: RemasterProtocol,
    pub execution: ExecutionKind,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            num_regions: 1,
            num_partitions: 1,
            num_workers: num_cpus::get().max(1),
            ddr_interval_ms: 100,
            bypass_mh_orderer: false,
            return_dummy_txn: false,
            hash_partitioning: Some(HashPartitioning::default()),
            simple_partitioning: false,
            replication_factor: 1,
            scheduler_max_txns: 50_000,
            poll_timeout_ms: 1_000,
            lock_manager: LockManagerKind::Ddr,
            remaster_protocol: RemasterProtocol::Counterless,
            execution: ExecutionKind::KeyValue,
        }
    }
}

impl SchedulerConfig {
    pub fn sanitize(&self) -> Result<(), Error> {
        if self.protocol != "tcp" && self.protocol != "ipc" {
            return Err(Error::InvalidConfig(format!(
                "unrecognized protocol: {}",
                self.protocol
            )));
        }
        if self.num_regions == 0 || self.num_partitions == 0 {
            return Err(Error::InvalidConfig(
                "topology must have at least one region and one partition".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(Error::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(Error::InvalidConfig(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.hash_partitioning.is_some() == self.simple_partitioning {
            return Err(Error::InvalidConfig(
                "exactly one of hash_partitioning and simple_partitioning must be set".to_string(),
            ));
        }
        if self.lock_manager == LockManagerKind::Ddr
            && self.remaster_protocol == RemasterProtocol::Simple
        {
            return Err(Error::InvalidConfig(
                "the simple remaster protocol relies on pre-dispatch aborts, \
                 which the ddr lock manager disables"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Immutable configuration of one machine: the shared scheduler config plus
/// this machine's coordinates in the region × partition grid.
#[derive(Clone, Debug)]
pub struct Configuration {
    config: SchedulerConfig,
    local_region: RegionId,
    local_partition: PartitionId,
}

pub type ConfigurationRef = Arc<Configuration>;

impl Configuration {
    pub fn new(
        config: SchedulerConfig,
        local_region: RegionId,
        local_partition: PartitionId,
    ) -> Result<ConfigurationRef, Error> {
        config.sanitize()?;
        if local_region >= config.num_regions || local_partition >= config.num_partitions {
            return Err(Error::InvalidConfig(format!(
                "local machine ({}, {}) is outside the {}x{} grid",
                local_region, local_partition, config.num_regions, config.num_partitions
            )));
        }
        Ok(Arc::new(Self {
            config,
            local_region,
            local_partition,
        }))
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        local_region: RegionId,
        local_partition: PartitionId,
    ) -> Result<ConfigurationRef, Error> {
        let contents = fs::read_to_string(path)?;
        let config: SchedulerConfig = serde_yaml::from_str(&contents)?;
        Self::new(config, local_region, local_partition)
    }

    pub fn inner(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn num_regions(&self) -> u32 {
        self.config.num_regions
    }

    pub fn num_partitions(&self) -> u32 {
        self.config.num_partitions
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn ddr_interval(&self) -> Duration {
        Duration::from_millis(self.config.ddr_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.config.poll_timeout_ms)
    }

    pub fn replication_factor(&self) -> u32 {
        self.config.replication_factor
    }

    pub fn bypass_mh_orderer(&self) -> bool {
        self.config.bypass_mh_orderer
    }

    pub fn return_dummy_txn(&self) -> bool {
        self.config.return_dummy_txn
    }

    pub fn scheduler_max_txns(&self) -> usize {
        self.config.scheduler_max_txns
    }

    pub fn lock_manager(&self) -> LockManagerKind {
        self.config.lock_manager
    }

    pub fn remaster_protocol(&self) -> RemasterProtocol {
        self.config.remaster_protocol
    }

    pub fn execution(&self) -> ExecutionKind {
        self.config.execution
    }

    pub fn local_region(&self) -> RegionId {
        self.local_region
    }

    pub fn local_partition(&self) -> PartitionId {
        self.local_partition
    }

    pub fn local_machine_id(&self) -> MachineId {
        self.make_machine_id(self.local_region, self.local_partition)
    }

    pub fn make_machine_id(&self, region: RegionId, partition: PartitionId) -> MachineId {
        region * self.config.num_partitions + partition
    }

    pub fn unpack_machine_id(&self, machine_id: MachineId) -> (RegionId, PartitionId) {
        (
            machine_id / self.config.num_partitions,
            machine_id % self.config.num_partitions,
        )
    }

    pub fn all_machine_ids(&self) -> Vec<MachineId> {
        (0..self.config.num_regions)
            .flat_map(|r| (0..self.config.num_partitions).map(move |p| (r, p)))
            .map(|(r, p)| self.make_machine_id(r, p))
            .collect()
    }

    /// Routes a key to its partition: FNV-1a over a key prefix under hash
    /// partitioning, integer parse under simple partitioning. A key that
    /// does not parse as an integer under simple partitioning lands in
    /// partition 0.
    pub fn partition_of_key(&self, key: &Key) -> PartitionId {
        match &self.config.hash_partitioning {
            Some(hash) => {
                let prefix_len = hash.partition_key_num_bytes.min(key.len());
                fnv_1a_32(&key.as_bytes()[..prefix_len]) % self.config.num_partitions
            }
            None => {
                let int_key: u64 = key.parse().unwrap_or(0);
                (int_key % self.config.num_partitions as u64) as PartitionId
            }
        }
    }

    /// Master region of an integer key under simple partitioning.
    pub fn master_of_key(&self, int_key: u64) -> RegionId {
        ((int_key / self.config.num_partitions as u64) % self.config.num_regions as u64) as RegionId
    }

    pub fn key_is_in_local_partition(&self, key: &Key) -> bool {
        self.partition_of_key(key) == self.local_partition
    }
}

const FNV_OFFSET_BASIS_32: u32 = 0x811c_9dc5;
const FNV_PRIME_32: u32 = 0x0100_0193;

fn fnv_1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS_32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(FNV_PRIME_32);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use rand::{distributions::Alphanumeric, Rng};

    fn test_config(num_regions: u32, num_partitions: u32) -> SchedulerConfig {
        SchedulerConfig {
            num_regions,
            num_partitions,
            num_workers: 2,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn machine_id_round_trips_over_the_grid() {
        let config = Configuration::new(test_config(3, 4), 1, 2).unwrap();
        for r in 0..3 {
            for p in 0..4 {
                let id = config.make_machine_id(r, p);
                assert_eq!(config.unpack_machine_id(id), (r, p));
            }
        }
        assert_eq!(config.local_machine_id(), 6);
        assert_eq!(config.all_machine_ids().len(), 12);
    }

    #[test]
    fn hash_partitioning_is_stable() {
        let config = Configuration::new(test_config(1, 7), 0, 0).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let key: Key = (&mut rng)
                .sample_iter(Alphanumeric)
                .take(12)
                .collect::<String>();
            let p = config.partition_of_key(&key);
            assert!(p < 7);
            assert_eq!(p, config.partition_of_key(&key));
        }
    }

    #[test]
    fn hash_partitioning_uses_key_prefix() {
        let config = Configuration::new(test_config(1, 5), 0, 0).unwrap();
        // Identical 8-byte prefixes must land in the same partition.
        assert_eq!(
            config.partition_of_key(&"abcdefgh-1".to_string()),
            config.partition_of_key(&"abcdefgh-2".to_string()),
        );
    }

    #[test]
    fn simple_partitioning_routes_by_modulo() {
        let mut inner = test_config(3, 4);
        inner.hash_partitioning = None;
        inner.simple_partitioning = true;
        let config = Configuration::new(inner, 0, 0).unwrap();
        assert_eq!(config.partition_of_key(&"13".to_string()), 1);
        assert_eq!(config.master_of_key(13), 0);
        assert_eq!(config.master_of_key(17), 1);
        // 4 partitions, 3 regions: key/4 mod 3
        assert_eq!(config.master_of_key(21), 2);
    }

    #[test]
    fn sanitize_rejects_bad_topology() {
        let mut config = test_config(0, 1);
        assert_err!(config.sanitize());
        config.num_regions = 1;
        assert_ok!(config.sanitize());
        config.num_workers = 0;
        assert_err!(config.sanitize());
    }

    #[test]
    fn sanitize_rejects_conflicting_partitioning() {
        let mut config = test_config(1, 1);
        config.simple_partitioning = true;
        assert_err!(config.sanitize());
        config.hash_partitioning = None;
        assert_ok!(config.sanitize());
        config.simple_partitioning = false;
        assert_err!(config.sanitize());
    }

    #[test]
    fn sanitize_rejects_ddr_with_simple_remaster() {
        let mut config = test_config(1, 1);
        config.remaster_protocol = RemasterProtocol::Simple;
        assert_err!(config.sanitize());
        config.lock_manager = LockManagerKind::SimpleQueue;
        assert_ok!(config.sanitize());
    }

    #[test]
    fn local_machine_must_be_inside_the_grid() {
        assert_err!(Configuration::new(test_config(2, 2), 2, 0));
        assert_err!(Configuration::new(test_config(2, 2), 0, 2));
    }

    #[test]
    fn config_loads_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.yaml");
        std::fs::write(
            &path,
            "num_regions: 2\nnum_partitions: 3\nnum_workers: 4\nddr_interval_ms: 50\n",
        )
        .unwrap();
        let config = Configuration::from_file(&path, 1, 2).unwrap();
        assert_eq!(config.num_regions(), 2);
        assert_eq!(config.num_partitions(), 3);
        assert_eq!(config.num_workers(), 4);
        assert_eq!(config.ddr_interval(), Duration::from_millis(50));

        std::fs::write(&path, "no_such_option: 1\n").unwrap();
        assert_err!(Configuration::from_file(&path, 0, 0));
    }
}
