// Envelope signatures: Ed25519 over the canonical encoding

use super::CryptoError;
use crate::identity::IdentityKeys;
use crate::message::{canonical_signing_bytes, Envelope};

/// Stamp the sender key and sign. Any existing signature is replaced.
pub fn sign_envelope(keys: &IdentityKeys, envelope: &mut Envelope) -> Result<(), CryptoError> {
    envelope.sender = keys.public_key();
    envelope.sig = None;
    let bytes = canonical_signing_bytes(envelope)
        .map_err(|e| CryptoError::Serialization(e.to_string()))?;
    envelope.sig = Some(keys.sign(&bytes));
    Ok(())
}

/// Check the signature against the embedded sender key.
pub fn verify_envelope(envelope: &Envelope) -> Result<(), CryptoError> {
    let sig = envelope.sig.as_ref().ok_or(CryptoError::MissingSignature)?;
    let bytes = canonical_signing_bytes(envelope)
        .map_err(|e| CryptoError::Serialization(e.to_string()))?;
    if IdentityKeys::verify(&bytes, sig, &envelope.sender) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}
