//! Ed25519 signing and verification for mesh messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::IdentityError;

/// Signs outgoing mesh messages and verifies signatures from peers.
///
/// Signatures travel as lowercase hex; public keys as standard base64.
pub trait SignatureProvider: Send + Sync {
    /// Signs `message` with this beacon's key.
    fn sign(&self, message: &[u8]) -> String;

    /// Verifies `signature_hex` over `message` against a base64 public key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidPublicKey`] if the key cannot be
    /// decoded and [`IdentityError::InvalidSignature`] if the signature is
    /// malformed or does not verify.
    fn verify(&self, public_key: &str, message: &[u8], signature_hex: &str)
        -> Result<(), IdentityError>;
}

/// [`SignatureProvider`] backed by an in-memory Ed25519 signing key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Base64 encoding of the verifying key.
    pub fn public_key(&self) -> String {
        encode_public_key(&self.key.verifying_key())
    }
}

impl SignatureProvider for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.key.sign(message).to_bytes())
    }

    fn verify(
        &self,
        public_key: &str,
        message: &[u8],
        signature_hex: &str,
    ) -> Result<(), IdentityError> {
        verify_signature(public_key, message, signature_hex)
    }
}

/// Encodes a verifying key the way identities advertise it.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.to_bytes())
}

/// Decodes a base64 verifying key.
///
/// # Errors
///
/// Returns [`IdentityError::InvalidPublicKey`] on bad base64, wrong length,
/// or a point that is not a valid Ed25519 key.
pub fn decode_public_key(public_key: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes = STANDARD
        .decode(public_key)
        .map_err(|e| IdentityError::InvalidPublicKey(format!("invalid base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidPublicKey("invalid public key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
}

/// Verifies a hex Ed25519 signature without needing a local key.
///
/// # Errors
///
/// See [`SignatureProvider::verify`].
pub fn verify_signature(
    public_key: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), IdentityError> {
    let key = decode_public_key(public_key)?;
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| IdentityError::InvalidSignature(format!("invalid signature hex: {e}")))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature("invalid signature length".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(message, &signature)
        .map_err(|e| IdentityError::InvalidSignature(e.to_string()))
}

/// Compares two byte strings without short-circuiting on the first difference.
///
/// The length check leaks only the length, which for random tokens of a
/// fixed size is public anyway.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
