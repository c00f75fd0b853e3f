// Identity persistence: the node's keys and an optional display name live
// next to the mesh state in the same key-value backend.

use super::IdentityKeys;
use crate::store::backend::StorageBackend;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

const IDENTITY_KEY: &[u8] = b"identity/keys";
const NICKNAME_KEY: &[u8] = b"identity/nickname";

#[derive(Clone)]
pub struct IdentityStore {
    backend: Arc<dyn StorageBackend>,
}

impl IdentityStore {
    pub fn persistent(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn save_keys(&self, keys: &IdentityKeys) -> Result<()> {
        self.backend
            .put(IDENTITY_KEY, &keys.to_bytes())
            .context("Failed to store identity keys")?;
        self.backend.flush().context("Failed to flush identity keys")?;
        Ok(())
    }

    pub fn load_keys(&self) -> Result<Option<IdentityKeys>> {
        match self.backend.get(IDENTITY_KEY)? {
            Some(bytes) => Ok(Some(
                IdentityKeys::from_bytes(&bytes).context("Stored identity is corrupt")?,
            )),
            None => Ok(None),
        }
    }

    /// Load existing keys or generate and persist fresh ones.
    pub fn load_or_generate(&self) -> Result<IdentityKeys> {
        if let Some(keys) = self.load_keys()? {
            info!(identity = %keys.identity_id(), "loaded existing identity");
            return Ok(keys);
        }
        let keys = IdentityKeys::generate();
        self.save_keys(&keys)?;
        info!(identity = %keys.identity_id(), "generated new identity");
        Ok(keys)
    }

    /// Name shown to rescuers next to this node's id. Empty clears it.
    pub fn save_nickname(&self, nickname: &str) -> Result<()> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            self.backend.remove(NICKNAME_KEY)?;
        } else {
            self.backend.put(NICKNAME_KEY, nickname.as_bytes())?;
        }
        self.backend.flush()?;
        Ok(())
    }

    pub fn load_nickname(&self) -> Result<Option<String>> {
        match self.backend.get(NICKNAME_KEY)? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).context("Stored nickname is not UTF-8")?,
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::{MemoryStorage, SledStorage};
    use tempfile::tempdir;

    #[test]
    fn test_keys_and_nickname_roundtrip() {
        let store = IdentityStore::persistent(Arc::new(MemoryStorage::new()));
        assert!(store.load_keys().unwrap().is_none());

        let keys = IdentityKeys::generate();
        store.save_keys(&keys).unwrap();
        let loaded = store.load_keys().unwrap().unwrap();
        assert_eq!(keys.identity_id(), loaded.identity_id());
        assert_eq!(keys.prekey_public(), loaded.prekey_public());

        store.save_nickname("  field-medic-3 ").unwrap();
        assert_eq!(store.load_nickname().unwrap().as_deref(), Some("field-medic-3"));
        store.save_nickname("").unwrap();
        assert!(store.load_nickname().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_identity_is_an_error() {
        let backend = Arc::new(MemoryStorage::new());
        backend.put(IDENTITY_KEY, b"short").unwrap();
        assert!(IdentityStore::persistent(backend).load_keys().is_err());
    }

    #[test]
    fn test_load_or_generate_is_stable_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("id");

        let first = {
            let backend = Arc::new(SledStorage::open(&path).unwrap());
            IdentityStore::persistent(backend).load_or_generate().unwrap()
        };
        let second = {
            let backend = Arc::new(SledStorage::open(&path).unwrap());
            IdentityStore::persistent(backend).load_or_generate().unwrap()
        };
        assert_eq!(first.identity_id(), second.identity_id());
    }
}
