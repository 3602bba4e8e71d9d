//! Fjall-based state store implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Each client session gets its own partition so co-located clients can
//! share one keyspace directory.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::error::Result;
use super::StateStore;

/// Fjall-backed durable session store
pub struct FjallStore {
    keyspace: Keyspace,
    session: PartitionHandle,
}

impl FjallStore {
    /// Open a store at the given path, partitioned by client id.
    pub fn open_at<P: AsRef<Path>>(path: P, client_id: &str) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let partition = format!("session_{}", client_id);
        let session = keyspace.open_partition(&partition, PartitionCreateOptions::default())?;

        Ok(Self { keyspace, session })
    }
}

#[async_trait]
impl StateStore for FjallStore {
    async fn open(&self) -> Result<()> {
        // The partition is opened eagerly in the constructor
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.session.insert(key, value.as_ref())?;
        // QoS guarantees depend on this blob surviving a crash before the
        // matching wire packet goes out
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.session.get(key)? {
            Some(slice) => Ok(Some(Bytes::copy_from_slice(&slice))),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.session.remove(key)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.session.iter() {
            let (key, _value) = item?;
            keys.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(keys)
    }

    async fn close(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        // fjall handles cleanup on drop
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fjall_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FjallStore::open_at(dir.path(), "cl1").unwrap();
            store.open().await.unwrap();
            store
                .put("out/00001", Bytes::from_static(b"\x32\x00"))
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let store = FjallStore::open_at(dir.path(), "cl1").unwrap();
        assert_eq!(
            store.get("out/00001").await.unwrap(),
            Some(Bytes::from_static(b"\x32\x00"))
        );
        assert_eq!(store.keys().await.unwrap(), vec!["out/00001"]);
    }

    #[tokio::test]
    async fn test_fjall_store_partitions_by_client() {
        let dir = tempfile::tempdir().unwrap();

        {
            let a = FjallStore::open_at(dir.path(), "a").unwrap();
            a.put("out/00001", Bytes::from_static(b"x")).await.unwrap();
            a.close().await.unwrap();
        }

        let b = FjallStore::open_at(dir.path(), "b").unwrap();
        assert_eq!(b.get("out/00001").await.unwrap(), None);
    }
}
