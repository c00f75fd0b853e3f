// Identity keys and pre-key bundles
//
// A node's long-term identity is an Ed25519 signing key. Alongside it lives
// an X25519 signed prekey, published in the pre-key bundle so peers can
// open a session while we are offline.

use crate::crypto::CryptoError;
use anyhow::Result;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Domain separation for the prekey signature.
const PREKEY_SIGNATURE_CONTEXT: &[u8] = b"reliefmesh signed prekey v1";

fn prekey_signing_bytes(prekey_public: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(PREKEY_SIGNATURE_CONTEXT.len() + 32);
    data.extend_from_slice(PREKEY_SIGNATURE_CONTEXT);
    data.extend_from_slice(prekey_public);
    data
}

/// Identity keys (signing + signed prekey)
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
    prekey: StaticSecret,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();

        Self {
            signing_key,
            prekey: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Get identity ID (Blake3 hash of public key)
    pub fn identity_id(&self) -> String {
        let hash = blake3::hash(&self.public_key());
        hex::encode(hash.as_bytes())
    }

    pub fn prekey_secret(&self) -> &StaticSecret {
        &self.prekey
    }

    pub fn prekey_public(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.prekey).to_bytes()
    }

    /// Sign data
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Verify signature
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8; 32]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        verifying_key
            .verify_strict(data, &Ed25519Signature::from_bytes(&sig_bytes))
            .is_ok()
    }

    /// The bundle a peer needs to start a session with us.
    pub fn prekey_bundle(&self) -> PreKeyBundle {
        let signed_prekey_public = self.prekey_public();
        PreKeyBundle {
            identity_public: self.public_key(),
            signed_prekey_public,
            signature: self.sign(&prekey_signing_bytes(&signed_prekey_public)),
        }
    }

    /// Serialize keys to bytes: signing key ‖ prekey secret.
    /// Returns a `Zeroizing<Vec<u8>>` that wipes secret key material on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(64));
        out.extend_from_slice(&self.signing_key.to_bytes());
        out.extend_from_slice(&self.prekey.to_bytes());
        out
    }

    /// Deserialize keys from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            anyhow::bail!("Invalid key bytes: expected 64, got {}", bytes.len());
        }
        let mut signing = [0u8; 32];
        let mut prekey = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        prekey.copy_from_slice(&bytes[32..]);

        let keys = Self {
            signing_key: SigningKey::from_bytes(&signing),
            prekey: StaticSecret::from(prekey),
        };
        signing.zeroize();
        prekey.zeroize();
        Ok(keys)
    }
}

/// Published keys that let a peer open a session with us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Ed25519 identity key
    pub identity_public: [u8; 32],
    /// X25519 signed prekey
    pub signed_prekey_public: [u8; 32],
    /// Identity signature over the prekey
    pub signature: Vec<u8>,
}

impl PreKeyBundle {
    /// Check the prekey is signed by the identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        if IdentityKeys::verify(
            &prekey_signing_bytes(&self.signed_prekey_public),
            &self.signature,
            &self.identity_public,
        ) {
            Ok(())
        } else {
            Err(CryptoError::InvalidBundleSignature)
        }
    }

    /// Compact text form for QR codes and copy/paste.
    pub fn to_base58(&self) -> Result<String, CryptoError> {
        let bytes =
            bincode::serialize(self).map_err(|e| CryptoError::InvalidBundle(e.to_string()))?;
        Ok(bs58::encode(bytes).into_string())
    }

    pub fn from_base58(text: &str) -> Result<Self, CryptoError> {
        let bytes = bs58::decode(text.trim())
            .into_vec()
            .map_err(|e| CryptoError::InvalidBundle(e.to_string()))?;
        let bundle: PreKeyBundle =
            bincode::deserialize(&bytes).map_err(|e| CryptoError::InvalidBundle(e.to_string()))?;
        bundle.verify()?;
        Ok(bundle)
    }

    pub fn identity_hex(&self) -> String {
        hex::encode(self.identity_public)
    }
}
