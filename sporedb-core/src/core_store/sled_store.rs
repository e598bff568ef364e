//! Default storage driver, backed by sled.

use std::collections::BTreeMap;
use std::path::Path;

use crate::core_version::{Version, VERSION_BYTES};

use super::{check_batch, Store, StoreError};

/// Durable store persisting each value as `digest || bytes` under the raw
/// key.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a store at the given directory.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(SledStore { db })
    }
}

impl Store for SledStore {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        let data = match self.db.get(key.as_bytes())? {
            Some(data) => data,
            None => return Err(StoreError::NotFound),
        };

        if data.len() < VERSION_BYTES {
            return Err(StoreError::NotFound);
        }

        Ok((
            data[VERSION_BYTES..].to_vec(),
            Version::from_bytes(&data[..VERSION_BYTES]),
        ))
    }

    fn set(&mut self, key: &str, value: &[u8], version: &Version) -> Result<(), StoreError> {
        self.set_batch(
            &[key.to_string()],
            &[value.to_vec()],
            std::slice::from_ref(version),
        )
    }

    fn set_batch(
        &mut self,
        keys: &[String],
        values: &[Vec<u8>],
        versions: &[Version],
    ) -> Result<(), StoreError> {
        check_batch(keys, values, versions)?;

        let mut batch = sled::Batch::default();
        for (i, key) in keys.iter().enumerate() {
            let mut record = Vec::with_capacity(VERSION_BYTES + values[i].len());
            record.extend_from_slice(versions[i].as_bytes());
            record.extend_from_slice(&values[i]);
            batch.insert(key.as_bytes(), record);
        }

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn list(&self) -> Result<BTreeMap<String, Version>, StoreError> {
        let mut catalog = BTreeMap::new();

        for entry in self.db.iter() {
            let (key, data) = entry?;
            if data.len() < VERSION_BYTES {
                continue; // skip corrupted entries
            }
            if let Ok(key) = std::str::from_utf8(&key) {
                catalog.insert(
                    key.to_string(),
                    Version::from_bytes(&data[..VERSION_BYTES]),
                );
            }
        }

        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SledStore::open(dir.path()).unwrap();

        let keys = vec!["x".to_string(), "y".to_string()];
        let values = vec![b"1".to_vec(), b"2".to_vec()];
        let versions = vec![Version::of(b"1"), Version::of(b"2")];
        store.set_batch(&keys, &values, &versions).unwrap();

        assert_eq!(store.get("x").unwrap().0, b"1");
        assert_eq!(store.get("y").unwrap().0, b"2");
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = SledStore::open(dir.path()).unwrap();
            store.set("key", b"persisted", &Version::of(b"persisted")).unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        let (data, version) = store.get("key").unwrap();
        assert_eq!(data, b"persisted");
        assert_eq!(version, Version::of(b"persisted"));
    }

    #[test]
    fn test_overwrite_updates_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SledStore::open(dir.path()).unwrap();

        store.set("key", b"one", &Version::of(b"one")).unwrap();
        store.set("key", b"two", &Version::of(b"two")).unwrap();

        let (data, version) = store.get("key").unwrap();
        assert_eq!(data, b"two");
        assert_eq!(version, Version::of(b"two"));
    }
}
