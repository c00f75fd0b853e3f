// Key derivation and AEAD primitives shared by the handshake and ratchet
//
// - Ed25519 identity keys double as X25519 keys for the handshake
// - BLAKE3 in derive-key mode for every KDF step, one context per purpose
// - XChaCha20-Poly1305 for message encryption (24-byte random nonces)

use super::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Changing any of these breaks compatibility with existing sessions.
const HANDSHAKE_CONTEXT: &str = "reliefmesh 2024 x3dh-lite master secret";
const CHAIN_LABEL_CONTEXT: &str = "reliefmesh 2024 session chain labels";
const ROOT_CONTEXT: &str = "reliefmesh 2024 ratchet root step";

const MESSAGE_KEY_INPUT: &[u8] = &[0x01];
const CHAIN_KEY_INPUT: &[u8] = &[0x02];

/// Convert an Ed25519 signing key to an X25519 static secret for ECDH.
///
/// Ed25519 derives its scalar from SHA-512 of the secret key; taking the
/// same first half gives the matching X25519 secret (clamped by x25519-dalek).
pub fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Map an Ed25519 public key onto the Montgomery curve (u = (1 + y) / (1 - y)).
pub fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Result<X25519PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let edwards_point = CompressedEdwardsY(*public_key_bytes)
        .decompress()
        .ok_or(CryptoError::InvalidPublicKey)?;

    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

/// Master secret from the concatenated handshake DH outputs.
pub fn derive_master_secret(dh1: &[u8; 32], dh2: &[u8; 32], transcript: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(HANDSHAKE_CONTEXT);
    hasher.update(dh1);
    hasher.update(dh2);
    hasher.update(transcript);
    *hasher.finalize().as_bytes()
}

/// Sub-key of the master secret for one purpose ("root", "ck_s", "ck_r").
pub fn derive_labeled(master: &[u8; 32], label: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(CHAIN_LABEL_CONTEXT);
    hasher.update(master);
    hasher.update(label.as_bytes());
    *hasher.finalize().as_bytes()
}

/// DH ratchet step: mixes a fresh DH output into the root key.
/// Returns (new root key, new chain key).
pub fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut hasher = blake3::Hasher::new_derive_key(ROOT_CONTEXT);
    hasher.update(root_key);
    hasher.update(dh_output);

    let mut okm = [0u8; 64];
    hasher.finalize_xof().fill(&mut okm);

    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (root, chain)
}

/// Symmetric ratchet step. Returns (message key, next chain key); the old
/// chain key cannot be recovered from either.
pub fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let message_key = *blake3::keyed_hash(chain_key, MESSAGE_KEY_INPUT).as_bytes();
    let next_chain = *blake3::keyed_hash(chain_key, CHAIN_KEY_INPUT).as_bytes();
    (message_key, next_chain)
}

/// Encrypt with a one-time message key. Returns (nonce, ciphertext).
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<([u8; 24], Vec<u8>), CryptoError> {
    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt and authenticate; any mismatch is `DecryptionFailed`.
pub fn open(key: &[u8; 32], nonce: &[u8; 24], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[test]
    fn test_ed25519_x25519_conversion_agrees() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();

        let alice_secret = ed25519_to_x25519_secret(&alice.signing_key);
        let bob_secret = ed25519_to_x25519_secret(&bob.signing_key);
        let alice_public = ed25519_public_to_x25519(&alice.public_key()).unwrap();
        let bob_public = ed25519_public_to_x25519(&bob.public_key()).unwrap();

        assert_eq!(X25519PublicKey::from(&alice_secret), alice_public);
        assert_eq!(
            alice_secret.diffie_hellman(&bob_public).to_bytes(),
            bob_secret.diffie_hellman(&alice_public).to_bytes()
        );
    }

    #[test]
    fn test_chain_step_is_one_way_and_distinct() {
        let ck0 = [7u8; 32];
        let (mk0, ck1) = kdf_chain(&ck0);
        let (mk1, ck2) = kdf_chain(&ck1);
        assert_ne!(mk0, mk1);
        assert_ne!(ck0, ck1);
        assert_ne!(ck1, ck2);
        assert_ne!(mk0, ck1);
    }

    #[test]
    fn test_labels_are_domain_separated() {
        let master = [3u8; 32];
        assert_ne!(derive_labeled(&master, "ck_s"), derive_labeled(&master, "ck_r"));
        assert_ne!(derive_labeled(&master, "root"), derive_labeled(&master, "ck_s"));
    }

    #[test]
    fn test_kdf_root_deterministic() {
        let a = kdf_root(&[1u8; 32], &[2u8; 32]);
        let b = kdf_root(&[1u8; 32], &[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a.0, a.1);
    }

    #[test]
    fn test_seal_open() {
        let key = [9u8; 32];
        let (nonce, ct) = seal(&key, b"need water", b"aad").unwrap();
        assert_eq!(open(&key, &nonce, &ct, b"aad").unwrap(), b"need water");
        assert_eq!(open(&key, &nonce, &ct, b"other"), Err(CryptoError::DecryptionFailed));
        assert_eq!(open(&[8u8; 32], &nonce, &ct, b"aad"), Err(CryptoError::DecryptionFailed));
    }
}
