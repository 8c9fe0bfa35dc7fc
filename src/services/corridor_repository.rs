//! Corridor persistence boundary
//!
//! The storage collaborator offers lookup-by-key and a versioned
//! upsert-by-key. A write carrying a stale version is rejected with
//! `StoreError::Conflict`, which the baseline store turns into a re-read and
//! retry. `MemoryCorridorRepository` is the in-process implementation.

use crate::domain::error::StoreError;
use crate::domain::types::{CorridorBaseline, CorridorKey, Traversal};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Everything persisted for one corridor
#[derive(Debug, Clone, PartialEq)]
pub struct CorridorRecord {
    pub key: CorridorKey,
    pub traversals: Vec<Traversal>,
    pub baselines: Vec<CorridorBaseline>,
}

impl CorridorRecord {
    pub fn new(key: CorridorKey) -> Self {
        Self { key, traversals: Vec::new(), baselines: Vec::new() }
    }
}

/// A stored value with its write version
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Storage collaborator for corridors, traversals and baselines
pub trait CorridorRepository: Send + Sync {
    /// Current record for a corridor, if it was ever observed
    fn load(&self, key: &CorridorKey) -> Option<Versioned<Arc<CorridorRecord>>>;

    /// Write `record` if the stored version still equals `expected`
    /// (`None` meaning "not yet stored"). Returns the new version.
    fn upsert(&self, record: CorridorRecord, expected: Option<u64>) -> Result<u64, StoreError>;

    /// Keys of all stored corridors
    fn keys(&self) -> Vec<CorridorKey>;
}

/// In-memory repository with compare-and-swap upserts
#[derive(Default)]
pub struct MemoryCorridorRepository {
    records: RwLock<FxHashMap<CorridorKey, Versioned<Arc<CorridorRecord>>>>,
}

impl MemoryCorridorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl CorridorRepository for MemoryCorridorRepository {
    fn load(&self, key: &CorridorKey) -> Option<Versioned<Arc<CorridorRecord>>> {
        self.records.read().get(key).cloned()
    }

    fn upsert(&self, record: CorridorRecord, expected: Option<u64>) -> Result<u64, StoreError> {
        let mut records = self.records.write();
        let actual = records.get(&record.key).map(|v| v.version);
        if actual != expected {
            return Err(StoreError::Conflict { expected, actual });
        }
        let version = actual.map_or(1, |v| v + 1);
        records.insert(record.key, Versioned { version, value: Arc::new(record) });
        Ok(version)
    }

    fn keys(&self) -> Vec<CorridorKey> {
        self.records.read().keys().copied().collect()
    }
}
