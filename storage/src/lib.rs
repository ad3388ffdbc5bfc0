// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serval_types::{transaction::Metadata, Key, Value};
use std::sync::Arc;

/// A stored record: the client value plus the mastership metadata the
/// scheduler validates transactions against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    pub metadata: Metadata,
}

impl Record {
    pub fn new(value: impl Into<Value>, metadata: Metadata) -> Self {
        Self {
            value: value.into(),
            metadata,
        }
    }
}

/// Storage interface the scheduler core reads and commits through. The
/// on-disk format is owned by the hosting process; the core only needs
/// point reads and writes.
pub trait Storage: Send + Sync {
    fn read(&self, key: &Key) -> Option<Record>;
    fn write(&self, key: &Key, record: Record);
    fn delete(&self, key: &Key) -> bool;
}

pub type StorageRef = Arc<dyn Storage>;

/// In-memory storage backed by a concurrent map. Workers on different
/// threads read and commit through it without external locking.
#[derive(Debug, Default)]
pub struct MemStorage {
    data: DashMap<Key, Record>,
}

impl MemStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &Key) -> Option<Record> {
        self.data.get(key).map(|r| r.clone())
    }

    fn write(&self, key: &Key, record: Record) {
        self.data.insert(key.clone(), record);
    }

    fn delete(&self, key: &Key) -> bool {
        self.data.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some_eq};

    #[test]
    fn read_write_delete() {
        let storage = MemStorage::new();
        let key = "balance".to_string();
        assert_none!(storage.read(&key));

        let record = Record::new("100", Metadata::new(1, 3));
        storage.write(&key, record.clone());
        assert_some_eq!(storage.read(&key), record);

        assert!(storage.delete(&key));
        assert!(!storage.delete(&key));
        assert_none!(storage.read(&key));
    }

    #[test]
    fn overwrite_replaces_metadata() {
        let storage = MemStorage::new();
        let key = "k".to_string();
        storage.write(&key, Record::new("a", Metadata::new(0, 1)));
        storage.write(&key, Record::new("b", Metadata::new(1, 2)));
        let record = storage.read(&key).unwrap();
        assert_eq!(record.value, "b");
        assert_eq!(record.metadata, Metadata::new(1, 2));
    }
}
