//! In-memory storage driver for tests and ephemeral nodes.

use std::collections::BTreeMap;

use crate::core_version::Version;

use super::{check_batch, Store, StoreError};

/// BTreeMap-backed store with the same digest-prefixed record layout as
/// the durable drivers.
#[derive(Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, (Vec<u8>, Version)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<(Vec<u8>, Version), StoreError> {
        match self.entries.get(key) {
            Some((value, version)) => Ok((value.clone(), version.clone())),
            None => Err(StoreError::NotFound),
        }
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

        for (i, key) in keys.iter().enumerate() {
            self.entries
                .insert(key.clone(), (values[i].clone(), versions[i].clone()));
        }
        Ok(())
    }

    fn list(&self) -> Result<BTreeMap<String, Version>, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|(k, (_, v))| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basics() {
        let mut store = MemoryStore::new();
        assert!(matches!(store.get("a"), Err(StoreError::NotFound)));

        store.set("a", b"hello", &Version::of(b"hello")).unwrap();
        let (data, version) = store.get("a").unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(version, Version::of(b"hello"));
    }
}
