//! Local persistence for sync status records.
//!
//! Every record carries a version. Writers pass the version they read and
//! the store refuses the write if another writer got there first, which is
//! the only cross-process coordination besides leases.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SyncError};

/// Versioned key-value persistence.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reads a record and its version.
    async fn read_record(&self, key: &str) -> Result<Option<(Bytes, u64)>>;

    /// Writes a record and returns its new version.
    ///
    /// `exclusive` requires the record to be absent. `expected_version`
    /// requires the stored version to match.
    async fn write_record(
        &self,
        key: &str,
        value: Bytes,
        expected_version: Option<u64>,
        exclusive: bool,
    ) -> Result<u64>;

    /// Removes a record. Removing a missing record without an expected version succeeds.
    async fn remove_record(&self, key: &str, expected_version: Option<u64>) -> Result<()>;

    /// Keys under `prefix` sorting strictly after `marker`, relative to the prefix.
    async fn list_keys(&self, prefix: &str, marker: &str, max: usize) -> Result<Vec<String>>;
}

/// In-memory [`LocalStore`] backed by a BTreeMap.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, (Bytes, u64)>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn read_record(&self, key: &str) -> Result<Option<(Bytes, u64)>> {
        let data = self
            .data
            .read()
            .map_err(|e| SyncError::storage(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    async fn write_record(
        &self,
        key: &str,
        value: Bytes,
        expected_version: Option<u64>,
        exclusive: bool,
    ) -> Result<u64> {
        let mut data = self
            .data
            .write()
            .map_err(|e| SyncError::storage(e.to_string()))?;
        let found = data.get(key).map(|(_, v)| *v);
        let conflict = (exclusive && found.is_some())
            || (expected_version.is_some() && expected_version != found);
        if conflict {
            return Err(SyncError::Conflict {
                key: key.to_string(),
                expected: expected_version,
                found,
            });
        }
        let version = found.map_or(1, |v| v + 1);
        data.insert(key.to_string(), (value, version));
        Ok(version)
    }

    async fn remove_record(&self, key: &str, expected_version: Option<u64>) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| SyncError::storage(e.to_string()))?;
        let found = data.get(key).map(|(_, v)| *v);
        if expected_version.is_some() && expected_version != found {
            return Err(SyncError::Conflict {
                key: key.to_string(),
                expected: expected_version,
                found,
            });
        }
        data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str, marker: &str, max: usize) -> Result<Vec<String>> {
        let data = self
            .data
            .read()
            .map_err(|e| SyncError::storage(e.to_string()))?;
        let start = format!("{}{}", prefix, marker);
        let keys = data
            .range::<String, _>((Bound::Excluded(start), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .take(max)
            .map(|k| k[prefix.len()..].to_string())
            .collect();
        Ok(keys)
    }
}

/// A decoded record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Decoded value.
    pub value: T,
    /// Store version.
    pub version: u64,
}

/// Typed bincode layer over a [`LocalStore`].
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn LocalStore>,
}

impl RecordStore {
    /// Wraps a raw store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// The underlying raw store.
    pub fn raw(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Reads and decodes a record.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>> {
        match self.store.read_record(key).await? {
            Some((bytes, version)) => Ok(Some(Versioned {
                value: bincode::deserialize(&bytes)?,
                version,
            })),
            None => Ok(None),
        }
    }

    /// Writes a record if it is still at `expected_version`.
    pub async fn write<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let bytes = Bytes::from(bincode::serialize(value)?);
        self.store
            .write_record(key, bytes, expected_version, false)
            .await
    }

    /// Writes a record that must not exist yet.
    pub async fn create<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<u64> {
        let bytes = Bytes::from(bincode::serialize(value)?);
        self.store.write_record(key, bytes, None, true).await
    }

    /// Removes a record unconditionally.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove_record(key, None).await
    }

    /// Lists keys under `prefix`, see [`LocalStore::list_keys`].
    pub async fn list_keys(&self, prefix: &str, marker: &str, max: usize) -> Result<Vec<String>> {
        self.store.list_keys(prefix, marker, max).await
    }
}
