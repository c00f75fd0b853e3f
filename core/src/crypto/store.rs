// Session table: one ratchet per thread, each behind its own lock
//
// The table lock is only held to look a session up; encrypt/decrypt lock
// the individual session, so different threads never contend.

use super::session::{Session, SessionRecord};
use super::CryptoError;
use crate::message::SealedPayload;
use crate::store::StateStore;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    state: Option<StateStore>,
    max_skip: u32,
}

impl SessionStore {
    pub fn new(max_skip: u32, state: Option<StateStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            state,
            max_skip,
        }
    }

    /// Restore persisted sessions. Returns how many were loaded.
    pub fn load(&self) -> usize {
        let Some(state) = &self.state else {
            return 0;
        };
        let records: Vec<(String, SessionRecord)> = state.load_sessions();
        let mut sessions = self.sessions.write();
        for (thread_id, record) in &records {
            sessions.insert(
                thread_id.clone(),
                Arc::new(Mutex::new(Session::from_record(record, self.max_skip))),
            );
        }
        if !records.is_empty() {
            info!(count = records.len(), "restored sessions");
        }
        records.len()
    }

    fn persist(&self, session: &Session) {
        if let Some(state) = &self.state {
            if let Err(e) = state.save_session(session.thread_id(), &session.to_record()) {
                warn!(thread = session.thread_id(), "failed to persist session: {}", e);
            }
        }
    }

    pub fn insert(&self, session: Session) {
        self.persist(&session);
        let thread_id = session.thread_id().to_string();
        debug!(thread = %thread_id, "session stored");
        self.sessions
            .write()
            .insert(thread_id, Arc::new(Mutex::new(session)));
    }

    pub fn get(&self, thread_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(thread_id).cloned()
    }

    pub fn contains(&self, thread_id: &str) -> bool {
        self.sessions.read().contains_key(thread_id)
    }

    /// Thread we share with a given peer identity, if any.
    pub fn thread_for_peer(&self, peer_identity: &[u8; 32]) -> Option<String> {
        self.sessions
            .read()
            .iter()
            .find(|(_, s)| s.lock().peer_identity() == peer_identity)
            .map(|(id, _)| id.clone())
    }

    pub fn encrypt(&self, thread_id: &str, plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
        let handle = self
            .get(thread_id)
            .ok_or_else(|| CryptoError::SessionNotFound(thread_id.to_string()))?;
        let mut session = handle.lock();
        let sealed = session.ratchet_encrypt(plaintext)?;
        self.persist(&session);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
        let handle = self
            .get(&sealed.thread_id)
            .ok_or_else(|| CryptoError::SessionNotFound(sealed.thread_id.clone()))?;
        let mut session = handle.lock();
        let plaintext = session.ratchet_decrypt(sealed)?;
        self.persist(&session);
        Ok(plaintext)
    }

    /// Tear a session down, including its persisted record.
    pub fn remove(&self, thread_id: &str) -> bool {
        let removed = self.sessions.write().remove(thread_id).is_some();
        if let Some(state) = &self.state {
            if let Err(e) = state.remove_session(thread_id) {
                warn!(thread = thread_id, "failed to delete session record: {}", e);
            }
        }
        removed
    }

    pub fn persist_all(&self) {
        let handles: Vec<_> = self.sessions.read().values().cloned().collect();
        for handle in handles {
            self.persist(&handle.lock());
        }
    }

    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
