//! redb wrapper
//!
//! Everything lives in one physical table of byte keys and byte values.
//! Logical families are key prefixes, so a prefix scan is a range
//! `[prefix, prefix + 0xFF)`. UTF-8 never produces the byte `0xFF`, which
//! makes that bound cover every textual key under the prefix.

use crate::core::error::{kv_err, Result, StoreError};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

pub const DATA_TABLE: TableDefinition<'static, &[u8], &[u8]> =
    TableDefinition::new("audiobook_data");

/// Exclusive upper bound for a prefix scan
pub fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    end.push(0xFF);
    end
}

fn decode_key(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|e| StoreError::Encoding(format!("non UTF-8 key: {}", e)))
}

fn table_get<T>(table: &T, key: &str) -> Result<Option<Vec<u8>>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table
        .get(key.as_bytes())
        .map_err(kv_err)?
        .map(|value| value.value().to_vec()))
}

fn table_scan<T>(table: &T, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let end = prefix_end(prefix);
    let mut entries = Vec::new();
    for entry in table
        .range(prefix.as_bytes()..end.as_slice())
        .map_err(kv_err)?
    {
        let (key, value) = entry.map_err(kv_err)?;
        entries.push((decode_key(key.value())?, value.value().to_vec()));
    }
    Ok(entries)
}

/// Read access shared by snapshots and write batches
pub trait KvReader {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every `(key, value)` whose key starts with `prefix`, in key order
    fn scan_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get_raw(key)?.is_some())
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.get_raw(key)?
            .map(|raw| {
                String::from_utf8(raw)
                    .map_err(|e| StoreError::Encoding(format!("value of {}: {}", key, e)))
            })
            .transpose()
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Decode every value under `prefix` whose key passes `keep`; undecodable values are skipped
    fn scan_json<T, F>(&self, prefix: &str, keep: F) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> bool,
    {
        Ok(self
            .scan_raw(prefix)?
            .into_iter()
            .filter(|(key, _)| keep(key))
            .filter_map(|(key, raw)| {
                serde_json::from_slice(&raw).ok().map(|value| (key, value))
            })
            .collect())
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .scan_raw(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
}

/// Consistent read view
pub struct Snapshot {
    tx: ReadTransaction,
}

impl KvReader for Snapshot {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.tx.open_table(DATA_TABLE) {
            Ok(table) => table_get(&table, key),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(kv_err(e)),
        }
    }

    fn scan_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        match self.tx.open_table(DATA_TABLE) {
            Ok(table) => table_scan(&table, prefix),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(Vec::new()),
            Err(e) => Err(kv_err(e)),
        }
    }
}

/// Atomic write batch
///
/// Reads through a batch observe its own pending writes. Dropping a batch
/// without calling [`Batch::commit`] discards every write.
pub struct Batch {
    tx: WriteTransaction,
}

impl Batch {
    pub fn put_raw(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let mut table = self.tx.open_table(DATA_TABLE).map_err(kv_err)?;
        table.insert(key.as_bytes(), value).map_err(kv_err)?;
        Ok(())
    }

    pub fn put_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.put_raw(key, value.as_bytes())
    }

    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.put_raw(key, &encoded)
    }

    /// Returns whether the key existed
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let mut table = self.tx.open_table(DATA_TABLE).map_err(kv_err)?;
        let removed = table.remove(key.as_bytes()).map_err(kv_err)?.is_some();
        Ok(removed)
    }

    /// Delete every key under `prefix`; returns how many were removed
    pub fn delete_prefix(&mut self, prefix: &str) -> Result<usize> {
        let keys = self.scan_keys(prefix)?;
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit().map_err(kv_err)
    }
}

impl KvReader for Batch {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let table = self.tx.open_table(DATA_TABLE).map_err(kv_err)?;
        table_get(&table, key)
    }

    fn scan_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let table = self.tx.open_table(DATA_TABLE).map_err(kv_err)?;
        table_scan(&table, prefix)
    }
}

/// Embedded ordered key-value engine
pub struct KvEngine {
    db: Database,
}

impl KvEngine {
    /// Open or create a database file, creating parent directories as needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(kv_err)?;
        Ok(Self { db })
    }

    /// Volatile database, dropped with the engine
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(kv_err)?;
        Ok(Self { db })
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let tx = self.db.begin_read().map_err(kv_err)?;
        Ok(Snapshot { tx })
    }

    pub fn batch(&self) -> Result<Batch> {
        let tx = self.db.begin_write().map_err(kv_err)?;
        Ok(Batch { tx })
    }

    /// Run `f` in a write batch, committing only when it succeeds
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Batch) -> Result<T>,
    {
        let mut batch = self.batch()?;
        let value = f(&mut batch)?;
        batch.commit()?;
        Ok(value)
    }
}
