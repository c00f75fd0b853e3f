// Snapshot: independent load/save of queue, dedup and session state
//
// Each structure lives under its own key. A corrupt value is logged and
// treated as absent so one bad record never blocks startup.

use super::backend::{StorageBackend, StorageError};
use super::bloom::BloomFilter;
use super::dedup::{DedupEngine, DedupRecord};
use super::queue::{PriorityQueue, QueueSnapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

pub const QUEUE_KEY: &[u8] = b"queue/v1";
pub const DEDUP_LRU_KEY: &[u8] = b"dedup/lru";
pub const DEDUP_BLOOM_KEY: &[u8] = b"dedup/bloom";
pub const SESSION_PREFIX: &str = "session/";

pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub(crate) fn decode_record<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

/// Persisted mesh state on top of a `StorageBackend`.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StorageBackend>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // Read and decode one key; corruption degrades to None.
    fn load<T: DeserializeOwned>(&self, key: &[u8]) -> Option<T> {
        let bytes = match self.backend.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %String::from_utf8_lossy(key), "failed to read state: {}", e);
                return None;
            }
        };
        match decode_record(key, &bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{}; starting empty", e);
                None
            }
        }
    }

    pub fn save_queue(&self, queue: &PriorityQueue) -> Result<(), StorageError> {
        self.backend.put(QUEUE_KEY, &encode_record(&queue.snapshot())?)
    }

    pub fn load_queue(&self) -> Option<QueueSnapshot> {
        self.load(QUEUE_KEY)
    }

    pub fn save_dedup(&self, dedup: &DedupEngine, with_bloom: bool) -> Result<(), StorageError> {
        self.backend
            .put(DEDUP_LRU_KEY, &encode_record(&dedup.records())?)?;
        if with_bloom {
            self.backend.put(DEDUP_BLOOM_KEY, &dedup.bloom().to_bytes())?;
        }
        Ok(())
    }

    /// LRU records plus the filter, each independently optional.
    pub fn load_dedup(&self) -> (Vec<DedupRecord>, Option<BloomFilter>) {
        let records = self.load(DEDUP_LRU_KEY).unwrap_or_default();
        let bloom = match self.backend.get(DEDUP_BLOOM_KEY) {
            Ok(Some(bytes)) => match BloomFilter::from_bytes(&bytes) {
                Ok(bloom) => Some(bloom),
                Err(e) => {
                    warn!("{}; rebuilding bloom filter from records", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read bloom filter: {}", e);
                None
            }
        };
        (records, bloom)
    }

    fn session_key(thread_id: &str) -> Vec<u8> {
        format!("{}{}", SESSION_PREFIX, thread_id).into_bytes()
    }

    pub fn save_session<T: Serialize>(&self, thread_id: &str, record: &T) -> Result<(), StorageError> {
        self.backend
            .put(&Self::session_key(thread_id), &encode_record(record)?)
    }

    pub fn remove_session(&self, thread_id: &str) -> Result<(), StorageError> {
        self.backend.remove(&Self::session_key(thread_id))
    }

    /// Every decodable session record; corrupt ones are skipped.
    pub fn load_sessions<T: DeserializeOwned>(&self) -> Vec<(String, T)> {
        let rows = match self.backend.scan_prefix(SESSION_PREFIX.as_bytes()) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("failed to scan sessions: {}", e);
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter_map(|(key, value)| {
                let thread_id = String::from_utf8_lossy(&key[SESSION_PREFIX.len()..]).into_owned();
                match decode_record(&key, &value) {
                    Ok(record) => Some((thread_id, record)),
                    Err(e) => {
                        warn!("{}; dropping session", e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, QueueConfig};
    use crate::message::{Envelope, Payload, SafePayload};
    use crate::store::backend::MemoryStorage;

    fn store() -> (StateStore, MemoryStorage) {
        let mem = MemoryStorage::new();
        (StateStore::new(Arc::new(mem.clone())), mem)
    }

    #[test]
    fn test_queue_roundtrip() {
        let (state, _) = store();
        let mut queue = PriorityQueue::new(QueueConfig::default());
        let env = Envelope::new([1u8; 32], Payload::Safe(SafePayload { note: None }), 1);
        queue.enqueue(env.clone(), 2, false, 1).unwrap();
        state.save_queue(&queue).unwrap();

        let snapshot = state.load_queue().unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].envelope, env);
    }

    #[test]
    fn test_corrupt_queue_degrades_to_none() {
        let (state, mem) = store();
        mem.put(QUEUE_KEY, &[0xFF, 0x00, 0x13]).unwrap();
        assert!(state.load_queue().is_none());
    }

    #[test]
    fn test_dedup_roundtrip_and_corrupt_bloom() {
        let (state, mem) = store();
        let mut dedup = DedupEngine::new(DedupConfig::default());
        dedup.mark_seen("abc", 0, 5);
        state.save_dedup(&dedup, true).unwrap();

        let (records, bloom) = state.load_dedup();
        assert_eq!(records.len(), 1);
        assert!(bloom.unwrap().might_contain(b"abc"));

        mem.put(DEDUP_BLOOM_KEY, b"garbage").unwrap();
        let (records, bloom) = state.load_dedup();
        assert_eq!(records.len(), 1);
        assert!(bloom.is_none());
    }

    #[test]
    fn test_sessions_skip_corrupt_rows() {
        let (state, mem) = store();
        state.save_session("t1", &vec![1u8, 2, 3]).unwrap();
        mem.put(b"session/t2", &[0xFF; 3]).unwrap();

        let sessions: Vec<(String, Vec<u8>)> = state.load_sessions();
        assert_eq!(sessions, vec![("t1".to_string(), vec![1u8, 2, 3])]);

        state.remove_session("t1").unwrap();
        assert!(state.load_sessions::<Vec<u8>>().is_empty());
    }
}
