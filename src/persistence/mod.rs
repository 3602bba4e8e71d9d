//! Durable session persistence
//!
//! The engine stores in-flight QoS state as opaque blobs in a key/value
//! store. Keys are partitioned by prefix: outbound PUBLISH/PUBREL wire bytes
//! under `out/`, inbound QoS 2 acknowledgement markers under `in/`, both
//! keyed by packet id. Blobs holding packets carry the exact wire encoding,
//! so the codec is the only serialization authority.
//!
//! Writes must be durable before the corresponding wire packet is emitted
//! (PUBREC) or the packet id is reused (PUBCOMP); backends are expected to
//! sync on `put`.

mod error;
mod fjall;

pub use error::{PersistenceError, Result};
pub use fjall::FjallStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

/// Key prefix for outbound in-flight messages (PUBLISH awaiting PUBACK or
/// PUBREC, PUBREL awaiting PUBCOMP).
pub const OUTBOUND_PREFIX: &str = "out/";

/// Key prefix for inbound QoS 2 packet ids (PUBREC sent, PUBREL pending).
pub const INBOUND_PREFIX: &str = "in/";

/// Store key for an outbound in-flight message.
///
/// Packet ids are zero-padded so lexicographic key order equals packet-id
/// order, which `keys()` consumers rely on for replay.
pub fn outbound_key(packet_id: u16) -> String {
    format!("{}{:05}", OUTBOUND_PREFIX, packet_id)
}

/// Store key for an inbound QoS 2 packet id.
pub fn inbound_key(packet_id: u16) -> String {
    format!("{}{:05}", INBOUND_PREFIX, packet_id)
}

/// Extract the packet id from a key under the given prefix.
pub fn packet_id_from_key(key: &str, prefix: &str) -> Option<u16> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Durable mapping from string key to byte blob.
///
/// The engine owns the handle and accesses it only from its event loop, so
/// implementations need interior mutability but no ordering guarantees
/// beyond per-call atomicity.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the store for use.
    async fn open(&self) -> Result<()>;

    /// Durably write a blob. The blob must be on stable storage when this
    /// returns.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Read a blob.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove a blob. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys, in lexicographic order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Flush and release resources.
    async fn close(&self) -> Result<()>;

    /// Remove every blob. Invoked on clean start and session expiry.
    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }
}

/// In-memory store. State does not survive the process; suitable for
/// sessions that never request durability and for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(outbound_key(1), "out/00001");
        assert_eq!(outbound_key(65535), "out/65535");
        assert_eq!(inbound_key(7), "in/00007");

        assert_eq!(packet_id_from_key("out/00042", OUTBOUND_PREFIX), Some(42));
        assert_eq!(packet_id_from_key("in/00007", INBOUND_PREFIX), Some(7));
        assert_eq!(packet_id_from_key("out/00042", INBOUND_PREFIX), None);
        assert_eq!(packet_id_from_key("junk", OUTBOUND_PREFIX), None);
    }

    #[test]
    fn test_key_order_is_packet_id_order() {
        let mut keys: Vec<String> = [1u16, 300, 12, 65535, 2]
            .iter()
            .map(|id| outbound_key(*id))
            .collect();
        keys.sort();
        let ids: Vec<u16> = keys
            .iter()
            .filter_map(|k| packet_id_from_key(k, OUTBOUND_PREFIX))
            .collect();
        assert_eq!(ids, vec![1, 2, 12, 300, 65535]);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.open().await.unwrap();

        store
            .put("out/00001", Bytes::from_static(b"publish"))
            .await
            .unwrap();
        store
            .put("in/00002", Bytes::from_static(b""))
            .await
            .unwrap();

        assert_eq!(
            store.get("out/00001").await.unwrap(),
            Some(Bytes::from_static(b"publish"))
        );
        assert_eq!(store.keys().await.unwrap(), vec!["in/00002", "out/00001"]);

        store.remove("out/00001").await.unwrap();
        assert_eq!(store.get("out/00001").await.unwrap(), None);

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
