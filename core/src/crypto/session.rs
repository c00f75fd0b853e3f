//! Pairwise sessions: X3DH-lite handshake plus a double ratchet.
//!
//! ## Handshake
//!
//! The initiator A holds B's verified pre-key bundle and a fresh ephemeral
//! X25519 key `E`:
//!
//! ```text
//! dh1    = DH(E, B.identity)        (B's Ed25519 key mapped to X25519)
//! dh2    = DH(E, B.signed_prekey)
//! master = KDF(dh1 ‖ dh2 ‖ A.identity ‖ B.identity ‖ E ‖ thread_id)
//! root   = KDF(master, "root")
//! A: ck_s = KDF(master, "ck_s"), ck_r = KDF(master, "ck_r")
//! B: mirrored
//! ```
//!
//! A announces `E` and its first ratchet key in a `SESSION_INIT` envelope.
//! B starts with its signed prekey as ratchet key and rotates it on its
//! first send, which opens the DH ratchet.
//!
//! ## Ratchet
//!
//! Each message key comes from one step of the sending chain; the chain key
//! moves forward through a one-way function. When a message arrives under
//! a new ratchet public key, both chains are replaced from a fresh DH and
//! the counters reset. Decryption works on a copy and only commits on
//! success, so a forged or stale message never disturbs the session.
//! Skipped message keys are not retained: a counter behind the chain never
//! decrypts.

use super::kdf::{
    derive_labeled, derive_master_secret, ed25519_public_to_x25519, ed25519_to_x25519_secret,
    kdf_chain, kdf_root, open, seal,
};
use super::CryptoError;
use crate::identity::{IdentityKeys, PreKeyBundle};
use crate::message::{SealedPayload, SessionInitPayload};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

fn transcript(
    initiator: &[u8; 32],
    responder: &[u8; 32],
    ephemeral: &[u8; 32],
    thread_id: &str,
) -> Vec<u8> {
    let mut t = Vec::with_capacity(96 + thread_id.len());
    t.extend_from_slice(initiator);
    t.extend_from_slice(responder);
    t.extend_from_slice(ephemeral);
    t.extend_from_slice(thread_id.as_bytes());
    t
}

fn contributory(shared: SharedSecret) -> Result<[u8; 32], CryptoError> {
    if shared.was_contributory() {
        Ok(shared.to_bytes())
    } else {
        Err(CryptoError::InvalidPublicKey)
    }
}

fn message_aad(thread_id: &str, ratchet_public: &[u8; 32], counter: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(thread_id.len() + 36);
    aad.extend_from_slice(thread_id.as_bytes());
    aad.extend_from_slice(ratchet_public);
    aad.extend_from_slice(&counter.to_le_bytes());
    aad
}

/// Ratchet state for one thread.
#[derive(Clone)]
pub struct Session {
    thread_id: String,
    peer_identity: [u8; 32],
    root_key: [u8; 32],
    our_ratchet: StaticSecret,
    our_ratchet_public: [u8; 32],
    their_ratchet_public: [u8; 32],
    sending_chain_key: [u8; 32],
    receiving_chain_key: [u8; 32],
    send_counter: u32,
    recv_counter: u32,
    /// Rotate our ratchet key before the next send
    pending_rotation: bool,
    max_skip: u32,
    created_at: u64,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.sending_chain_key.zeroize();
        self.receiving_chain_key.zeroize();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("thread_id", &self.thread_id)
            .field("peer", &hex::encode(&self.peer_identity[..4]))
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a thread with the owner of `bundle`. The returned payload goes
    /// out in a `SESSION_INIT` envelope.
    pub fn initiate(
        ours: &IdentityKeys,
        bundle: &PreKeyBundle,
        max_skip: u32,
        now: u64,
    ) -> Result<(Session, SessionInitPayload), CryptoError> {
        bundle.verify()?;

        let thread_id = uuid::Uuid::new_v4().to_string();
        let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral).to_bytes();

        let their_identity = ed25519_public_to_x25519(&bundle.identity_public)?;
        let their_prekey = X25519PublicKey::from(bundle.signed_prekey_public);
        let mut dh1 = contributory(ephemeral.diffie_hellman(&their_identity))?;
        let mut dh2 = contributory(ephemeral.diffie_hellman(&their_prekey))?;

        let t = transcript(
            &ours.public_key(),
            &bundle.identity_public,
            &ephemeral_public,
            &thread_id,
        );
        let mut master = derive_master_secret(&dh1, &dh2, &t);
        dh1.zeroize();
        dh2.zeroize();

        let ratchet = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ratchet_public = X25519PublicKey::from(&ratchet).to_bytes();

        let session = Session {
            thread_id: thread_id.clone(),
            peer_identity: bundle.identity_public,
            root_key: derive_labeled(&master, "root"),
            our_ratchet: ratchet,
            our_ratchet_public: ratchet_public,
            their_ratchet_public: bundle.signed_prekey_public,
            sending_chain_key: derive_labeled(&master, "ck_s"),
            receiving_chain_key: derive_labeled(&master, "ck_r"),
            send_counter: 0,
            recv_counter: 0,
            pending_rotation: false,
            max_skip,
            created_at: now,
        };
        master.zeroize();

        let init = SessionInitPayload {
            recipient: bundle.identity_public,
            thread_id,
            ephemeral_public,
            ratchet_public,
        };
        Ok((session, init))
    }

    /// Build the responder side from a received `SESSION_INIT`.
    pub fn respond(
        ours: &IdentityKeys,
        initiator_identity: &[u8; 32],
        init: &SessionInitPayload,
        max_skip: u32,
        now: u64,
    ) -> Result<Session, CryptoError> {
        if init.recipient != ours.public_key() {
            return Err(CryptoError::NotForUs);
        }
        if init.thread_id.is_empty() {
            return Err(CryptoError::InvalidHandshake("empty thread id".into()));
        }

        let ephemeral = X25519PublicKey::from(init.ephemeral_public);
        let identity_secret = ed25519_to_x25519_secret(&ours.signing_key);
        let mut dh1 = contributory(identity_secret.diffie_hellman(&ephemeral))?;
        let mut dh2 = contributory(ours.prekey_secret().diffie_hellman(&ephemeral))?;

        let t = transcript(
            initiator_identity,
            &ours.public_key(),
            &init.ephemeral_public,
            &init.thread_id,
        );
        let mut master = derive_master_secret(&dh1, &dh2, &t);
        dh1.zeroize();
        dh2.zeroize();

        let session = Session {
            thread_id: init.thread_id.clone(),
            peer_identity: *initiator_identity,
            root_key: derive_labeled(&master, "root"),
            our_ratchet: ours.prekey_secret().clone(),
            our_ratchet_public: ours.prekey_public(),
            their_ratchet_public: init.ratchet_public,
            sending_chain_key: derive_labeled(&master, "ck_r"),
            receiving_chain_key: derive_labeled(&master, "ck_s"),
            send_counter: 0,
            recv_counter: 0,
            pending_rotation: true,
            max_skip,
            created_at: now,
        };
        master.zeroize();
        Ok(session)
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn peer_identity(&self) -> &[u8; 32] {
        &self.peer_identity
    }

    pub fn our_ratchet_public(&self) -> [u8; 32] {
        self.our_ratchet_public
    }

    pub fn their_ratchet_public(&self) -> [u8; 32] {
        self.their_ratchet_public
    }

    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    pub fn recv_counter(&self) -> u32 {
        self.recv_counter
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    // Fresh local ratchet key mixed against their current one.
    fn rotate_sending(&mut self) -> Result<(), CryptoError> {
        let fresh = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let their = X25519PublicKey::from(self.their_ratchet_public);
        let mut dh = contributory(fresh.diffie_hellman(&their))?;
        let (root, chain) = kdf_root(&self.root_key, &dh);
        dh.zeroize();

        self.root_key = root;
        self.sending_chain_key = chain;
        self.our_ratchet_public = X25519PublicKey::from(&fresh).to_bytes();
        self.our_ratchet = fresh;
        self.send_counter = 0;
        self.pending_rotation = false;
        Ok(())
    }

    // Peer moved to a new ratchet key: new receiving chain, then rotate ours.
    fn dh_ratchet_step(&mut self, their_new: &[u8; 32]) -> Result<(), CryptoError> {
        let their = X25519PublicKey::from(*their_new);
        let mut dh = contributory(self.our_ratchet.diffie_hellman(&their))?;
        let (root, receiving) = kdf_root(&self.root_key, &dh);
        dh.zeroize();

        self.root_key = root;
        self.receiving_chain_key = receiving;
        self.their_ratchet_public = *their_new;
        self.recv_counter = 0;
        self.rotate_sending()
    }

    /// Encrypt the next message on the sending chain.
    pub fn ratchet_encrypt(&mut self, plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
        if self.pending_rotation {
            self.rotate_sending()?;
        }
        if self.send_counter == u32::MAX {
            return Err(CryptoError::ChainExhausted);
        }

        let counter = self.send_counter;
        let (mut message_key, next_chain) = kdf_chain(&self.sending_chain_key);
        let aad = message_aad(&self.thread_id, &self.our_ratchet_public, counter);
        let sealed = seal(&message_key, plaintext, &aad);
        message_key.zeroize();
        let (nonce, ciphertext) = sealed?;

        self.sending_chain_key = next_chain;
        self.send_counter += 1;

        Ok(SealedPayload {
            thread_id: self.thread_id.clone(),
            ratchet_public: self.our_ratchet_public,
            counter,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt a message for this thread. On any failure the session is
    /// left exactly as it was.
    pub fn ratchet_decrypt(&mut self, sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
        if sealed.thread_id != self.thread_id {
            return Err(CryptoError::ThreadMismatch);
        }
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(sealed)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(&mut self, sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
        if sealed.ratchet_public != self.their_ratchet_public {
            self.dh_ratchet_step(&sealed.ratchet_public)?;
        }

        if sealed.counter < self.recv_counter {
            return Err(CryptoError::CounterTooOld {
                counter: sealed.counter,
                expected: self.recv_counter,
            });
        }
        let skip = sealed.counter - self.recv_counter;
        if skip > self.max_skip {
            return Err(CryptoError::TooManySkipped {
                skip,
                max: self.max_skip,
            });
        }

        let mut chain = self.receiving_chain_key;
        for _ in 0..skip {
            chain = kdf_chain(&chain).1;
        }
        let (mut message_key, next_chain) = kdf_chain(&chain);
        chain.zeroize();

        let aad = message_aad(&self.thread_id, &sealed.ratchet_public, sealed.counter);
        let opened = open(&message_key, &sealed.nonce, &sealed.ciphertext, &aad);
        message_key.zeroize();
        let plaintext = opened?;

        self.receiving_chain_key = next_chain;
        self.recv_counter = sealed.counter + 1;
        Ok(plaintext)
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            thread_id: self.thread_id.clone(),
            peer_identity: self.peer_identity,
            root_key: self.root_key,
            our_ratchet_secret: self.our_ratchet.to_bytes(),
            their_ratchet_public: self.their_ratchet_public,
            sending_chain_key: self.sending_chain_key,
            receiving_chain_key: self.receiving_chain_key,
            send_counter: self.send_counter,
            recv_counter: self.recv_counter,
            pending_rotation: self.pending_rotation,
            created_at: self.created_at,
        }
    }

    pub fn from_record(record: &SessionRecord, max_skip: u32) -> Session {
        let our_ratchet = StaticSecret::from(record.our_ratchet_secret);
        Session {
            thread_id: record.thread_id.clone(),
            peer_identity: record.peer_identity,
            root_key: record.root_key,
            our_ratchet_public: X25519PublicKey::from(&our_ratchet).to_bytes(),
            our_ratchet,
            their_ratchet_public: record.their_ratchet_public,
            sending_chain_key: record.sending_chain_key,
            receiving_chain_key: record.receiving_chain_key,
            send_counter: record.send_counter,
            recv_counter: record.recv_counter,
            pending_rotation: record.pending_rotation,
            max_skip,
            created_at: record.created_at,
        }
    }
}

/// Persisted form of a session. Wiped from memory on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionRecord {
    pub thread_id: String,
    pub peer_identity: [u8; 32],
    pub root_key: [u8; 32],
    pub our_ratchet_secret: [u8; 32],
    pub their_ratchet_public: [u8; 32],
    pub sending_chain_key: [u8; 32],
    pub receiving_chain_key: [u8; 32],
    pub send_counter: u32,
    pub recv_counter: u32,
    pub pending_rotation: bool,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Session, Session) {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();
        let (a, init) = Session::initiate(&alice, &bob.prekey_bundle(), 32, 1).unwrap();
        let b = Session::respond(&bob, &alice.public_key(), &init, 32, 2).unwrap();
        (a, b)
    }

    #[test]
    fn test_handshake_derives_matching_chains() {
        let (a, b) = pair();
        assert_eq!(a.thread_id(), b.thread_id());
        assert_eq!(a.root_key, b.root_key);
        assert_eq!(a.sending_chain_key, b.receiving_chain_key);
        assert_eq!(a.receiving_chain_key, b.sending_chain_key);
        assert_ne!(a.sending_chain_key, a.receiving_chain_key);
    }

    #[test]
    fn test_respond_rejects_wrong_recipient() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();
        let mallory = IdentityKeys::generate();
        let (_, init) = Session::initiate(&alice, &bob.prekey_bundle(), 32, 1).unwrap();
        assert_eq!(
            Session::respond(&mallory, &alice.public_key(), &init, 32, 2).unwrap_err(),
            CryptoError::NotForUs
        );
    }

    #[test]
    fn test_initiate_rejects_forged_bundle() {
        let alice = IdentityKeys::generate();
        let mut bundle = IdentityKeys::generate().prekey_bundle();
        bundle.signature[0] ^= 1;
        assert_eq!(
            Session::initiate(&alice, &bundle, 32, 1).unwrap_err(),
            CryptoError::InvalidBundleSignature
        );
    }

    #[test]
    fn test_consecutive_message_keys_differ() {
        let (mut a, mut b) = pair();
        let ck0 = a.sending_chain_key;
        let m0 = a.ratchet_encrypt(b"one").unwrap();
        let ck1 = a.sending_chain_key;
        let m1 = a.ratchet_encrypt(b"two").unwrap();

        assert_ne!(kdf_chain(&ck0).0, kdf_chain(&ck1).0);
        assert_eq!((m0.counter, m1.counter), (0, 1));

        assert_eq!(b.ratchet_decrypt(&m0).unwrap(), b"one");
        assert_eq!(b.ratchet_decrypt(&m1).unwrap(), b"two");
    }

    #[test]
    fn test_old_message_rejected_after_chain_advances() {
        let (mut a, mut b) = pair();
        let m0 = a.ratchet_encrypt(b"one").unwrap();
        b.ratchet_decrypt(&m0).unwrap();

        let before = b.receiving_chain_key;
        assert!(matches!(
            b.ratchet_decrypt(&m0),
            Err(CryptoError::CounterTooOld { .. })
        ));
        assert_eq!(b.receiving_chain_key, before);
    }

    #[test]
    fn test_tampered_ciphertext_does_not_mutate() {
        let (mut a, mut b) = pair();
        let mut m0 = a.ratchet_encrypt(b"hello").unwrap();
        m0.ciphertext[0] ^= 0xFF;

        let before = (b.receiving_chain_key, b.recv_counter);
        assert_eq!(b.ratchet_decrypt(&m0), Err(CryptoError::DecryptionFailed));
        assert_eq!((b.receiving_chain_key, b.recv_counter), before);

        m0.ciphertext[0] ^= 0xFF;
        assert_eq!(b.ratchet_decrypt(&m0).unwrap(), b"hello");
    }

    #[test]
    fn test_skip_ahead_within_bound() {
        let (mut a, mut b) = pair();
        let _lost = a.ratchet_encrypt(b"lost").unwrap();
        let m1 = a.ratchet_encrypt(b"arrives").unwrap();
        assert_eq!(b.ratchet_decrypt(&m1).unwrap(), b"arrives");
        assert_eq!(b.recv_counter(), 2);
    }

    #[test]
    fn test_skip_beyond_bound_rejected() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();
        let (mut a, init) = Session::initiate(&alice, &bob.prekey_bundle(), 2, 1).unwrap();
        let mut b = Session::respond(&bob, &alice.public_key(), &init, 2, 2).unwrap();

        for _ in 0..3 {
            a.ratchet_encrypt(b"dropped").unwrap();
        }
        let late = a.ratchet_encrypt(b"late").unwrap();
        assert_eq!(
            b.ratchet_decrypt(&late),
            Err(CryptoError::TooManySkipped { skip: 3, max: 2 })
        );
    }

    #[test]
    fn test_reply_opens_dh_ratchet() {
        let (mut a, mut b) = pair();
        let m0 = a.ratchet_encrypt(b"help at the school").unwrap();
        b.ratchet_decrypt(&m0).unwrap();

        let bob_prekey = a.their_ratchet_public();
        let reply = b.ratchet_encrypt(b"on our way").unwrap();
        assert_ne!(reply.ratchet_public, bob_prekey);

        assert_eq!(a.ratchet_decrypt(&reply).unwrap(), b"on our way");
        assert_eq!(a.their_ratchet_public(), reply.ratchet_public);
        assert_eq!(a.send_counter(), 0);

        let m1 = a.ratchet_encrypt(b"thanks").unwrap();
        assert_eq!(b.ratchet_decrypt(&m1).unwrap(), b"thanks");
        assert_eq!(b.their_ratchet_public(), m1.ratchet_public);
        assert_eq!(b.recv_counter(), 1);
    }

    #[test]
    fn test_record_roundtrip() {
        let (mut a, b) = pair();
        let m0 = a.ratchet_encrypt(b"x").unwrap();

        let mut restored = Session::from_record(&b.to_record(), 32);
        assert_eq!(restored.our_ratchet_public(), b.our_ratchet_public());
        assert_eq!(restored.ratchet_decrypt(&m0).unwrap(), b"x");
    }
}
