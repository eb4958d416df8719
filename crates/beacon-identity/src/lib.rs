//! Long-lived identity of a beacon.
//!
//! A beacon owns exactly one Ed25519 keypair for its whole life. Peers pin
//! the fingerprint derived from its public key, so the identity is created
//! once by [`IdentityManager::ensure_identity`] and never replaced.
//!
//! Formula: `fingerprint = hex(sha256(base64(public_key)))`

mod signing;

use std::sync::Arc;

use beacon_db::{KeyValueStore, KvError};
use beacon_types::{now_timestamp, BeaconIdentity, MESH_VERSION};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use signing::{
    constant_time_eq, decode_public_key, encode_public_key, verify_signature, Ed25519Signer,
    SignatureProvider,
};

/// Settings key holding the hex-encoded Ed25519 seed.
pub const SIGNING_KEY_SETTING: &str = "mesh.signing_key";

/// Settings key holding the JSON identity record.
pub const IDENTITY_SETTING: &str = "mesh.identity";

/// Errors produced by identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// `ensure_identity` has never run on this beacon.
    #[error("beacon identity is not configured")]
    NotConfigured,

    #[error("identity store error: {0}")]
    Store(#[from] KvError),

    /// Persisted identity material is unreadable or inconsistent.
    #[error("stored identity is corrupt: {0}")]
    Corrupt(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A presented fingerprint does not derive from the presented key.
    #[error("fingerprint {presented} does not match public key (expected {computed})")]
    FingerprintMismatch { presented: String, computed: String },
}

/// Derives the fingerprint of a base64-encoded public key.
pub fn fingerprint_for(public_key: &str) -> String {
    hex::encode(Sha256::digest(public_key.as_bytes()))
}

/// Checks that an identity's fingerprint was derived from its own key.
///
/// Every identity received from a remote party goes through this before it
/// is trusted; the fingerprint is never taken on the sender's word.
///
/// # Errors
///
/// Returns [`IdentityError::InvalidPublicKey`] if the key does not decode
/// and [`IdentityError::FingerprintMismatch`] if the fingerprint differs.
pub fn verify_identity_fingerprint(identity: &BeaconIdentity) -> Result<(), IdentityError> {
    decode_public_key(&identity.public_key)?;
    let computed = fingerprint_for(&identity.public_key);
    if !constant_time_eq(computed.as_bytes(), identity.fingerprint.as_bytes()) {
        return Err(IdentityError::FingerprintMismatch {
            presented: identity.fingerprint.clone(),
            computed,
        });
    }
    Ok(())
}

/// Owns the beacon's keypair and identity record.
#[derive(Clone)]
pub struct IdentityManager {
    store: Arc<dyn KeyValueStore>,
    domain: String,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn KeyValueStore>, domain: impl Into<String>) -> Self {
        Self {
            store,
            domain: domain.into(),
        }
    }

    /// Creates the identity if none exists, otherwise returns the stored one.
    ///
    /// Safe to call on every start-up. An existing identity is never
    /// rewritten, even when the configured domain has since changed.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Store`] on storage failure and
    /// [`IdentityError::Corrupt`] if stored material is inconsistent.
    pub fn ensure_identity(&self) -> Result<BeaconIdentity, IdentityError> {
        if let Some(existing) = self.load_identity()? {
            if existing.domain != self.domain {
                tracing::warn!(
                    stored = %existing.domain,
                    configured = %self.domain,
                    "configured domain differs from stored identity; keeping stored identity"
                );
            }
            let key = self.load_signing_key()?.ok_or_else(|| {
                IdentityError::Corrupt("identity present but signing key missing".to_string())
            })?;
            check_key_matches(&key, &existing)?;
            return Ok(existing);
        }

        let generated = SigningKey::generate(&mut rand::rngs::OsRng);
        // A concurrent bring-up may have won the race; its key is the one to use.
        if !self
            .store
            .set_if_absent(SIGNING_KEY_SETTING, &hex::encode(generated.to_bytes()))?
        {
            tracing::debug!("signing key already present, reusing it");
        }
        let key = self
            .load_signing_key()?
            .ok_or_else(|| IdentityError::Corrupt("signing key vanished after write".to_string()))?;

        let public_key = encode_public_key(&key.verifying_key());
        let identity = BeaconIdentity {
            beacon_id: uuid::Uuid::new_v4().to_string(),
            domain: self.domain.clone(),
            fingerprint: fingerprint_for(&public_key),
            public_key,
            created_at: now_timestamp(),
            version: MESH_VERSION.to_string(),
            mesh_url: None,
        };
        let json = serde_json::to_string(&identity)
            .map_err(|e| IdentityError::Corrupt(e.to_string()))?;

        if self.store.set_if_absent(IDENTITY_SETTING, &json)? {
            tracing::info!(
                beacon_id = %identity.beacon_id,
                fingerprint = %identity.short_fingerprint(),
                domain = %identity.domain,
                "created beacon identity"
            );
            return Ok(identity);
        }

        self.load_identity()?.ok_or(IdentityError::NotConfigured)
    }

    /// Returns the persisted identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotConfigured`] if no identity exists yet.
    pub fn get_identity(&self) -> Result<BeaconIdentity, IdentityError> {
        self.load_identity()?.ok_or(IdentityError::NotConfigured)
    }

    /// Returns the persisted fingerprint.
    ///
    /// # Errors
    ///
    /// See [`IdentityManager::get_identity`].
    pub fn get_fingerprint(&self) -> Result<String, IdentityError> {
        Ok(self.get_identity()?.fingerprint)
    }

    /// Returns the identity as sent to peers, carrying our mesh API URL.
    ///
    /// # Errors
    ///
    /// See [`IdentityManager::get_identity`].
    pub fn advertised(&self, mesh_url: &str) -> Result<BeaconIdentity, IdentityError> {
        let mut identity = self.get_identity()?;
        identity.mesh_url = Some(mesh_url.trim_end_matches('/').to_string());
        Ok(identity)
    }

    /// Returns a signer for the persisted key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotConfigured`] if no key exists yet.
    pub fn signer(&self) -> Result<Ed25519Signer, IdentityError> {
        let key = self.load_signing_key()?.ok_or(IdentityError::NotConfigured)?;
        Ok(Ed25519Signer::new(key))
    }

    fn load_identity(&self) -> Result<Option<BeaconIdentity>, IdentityError> {
        match self.store.get(IDENTITY_SETTING)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| IdentityError::Corrupt(format!("identity record: {e}"))),
            None => Ok(None),
        }
    }

    fn load_signing_key(&self) -> Result<Option<SigningKey>, IdentityError> {
        let Some(encoded) = self.store.get(SIGNING_KEY_SETTING)? else {
            return Ok(None);
        };
        let bytes = hex::decode(&encoded)
            .map_err(|e| IdentityError::Corrupt(format!("signing key: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::Corrupt("signing key length".to_string()))?;
        Ok(Some(SigningKey::from_bytes(&seed)))
    }
}

fn check_key_matches(key: &SigningKey, identity: &BeaconIdentity) -> Result<(), IdentityError> {
    if encode_public_key(&key.verifying_key()) != identity.public_key {
        return Err(IdentityError::Corrupt(
            "signing key does not match identity public key".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_db::MemoryKvStore;

    fn manager(store: Arc<dyn KeyValueStore>) -> IdentityManager {
        IdentityManager::new(store, "alpha.example.org")
    }

    #[test]
    fn get_identity_before_ensure_is_not_configured() {
        let mgr = manager(Arc::new(MemoryKvStore::new()));
        assert!(matches!(mgr.get_identity(), Err(IdentityError::NotConfigured)));
        assert!(matches!(mgr.signer(), Err(IdentityError::NotConfigured)));
    }

    #[test]
    fn ensure_identity_is_idempotent() {
        let mgr = manager(Arc::new(MemoryKvStore::new()));
        let first = mgr.ensure_identity().unwrap();
        let second = mgr.ensure_identity().unwrap();
        assert_eq!(first, second);
        assert_eq!(mgr.get_fingerprint().unwrap(), first.fingerprint);
    }

    #[test]
    fn fingerprint_is_derived_from_public_key() {
        let mgr = manager(Arc::new(MemoryKvStore::new()));
        let id = mgr.ensure_identity().unwrap();
        assert_eq!(id.fingerprint, fingerprint_for(&id.public_key));
        assert_eq!(id.fingerprint.len(), 64);
        assert_eq!(id.version, MESH_VERSION);
        verify_identity_fingerprint(&id).unwrap();
    }

    #[test]
    fn domain_change_keeps_stored_identity() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let original = manager(store.clone()).ensure_identity().unwrap();
        let moved = IdentityManager::new(store, "renamed.example.org")
            .ensure_identity()
            .unwrap();
        assert_eq!(moved, original);
        assert_eq!(moved.domain, "alpha.example.org");
    }

    #[test]
    fn signer_matches_identity_key() {
        let mgr = manager(Arc::new(MemoryKvStore::new()));
        let id = mgr.ensure_identity().unwrap();
        let signer = mgr.signer().unwrap();
        assert_eq!(signer.public_key(), id.public_key);
        let sig = signer.sign(b"hello");
        verify_signature(&id.public_key, b"hello", &sig).unwrap();
    }

    #[test]
    fn advertised_identity_carries_mesh_url_without_changing_fingerprint() {
        let mgr = manager(Arc::new(MemoryKvStore::new()));
        let id = mgr.ensure_identity().unwrap();
        let adv = mgr.advertised("http://127.0.0.1:8740/api/mesh/").unwrap();
        assert_eq!(adv.mesh_url.as_deref(), Some("http://127.0.0.1:8740/api/mesh"));
        assert_eq!(adv.fingerprint, id.fingerprint);
    }

    #[test]
    fn tampered_fingerprint_is_rejected() {
        let mgr = manager(Arc::new(MemoryKvStore::new()));
        let mut id = mgr.ensure_identity().unwrap();
        id.fingerprint = "00".repeat(32);
        assert!(matches!(
            verify_identity_fingerprint(&id),
            Err(IdentityError::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn swapped_key_is_reported_as_corrupt() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let mgr = manager(store.clone());
        mgr.ensure_identity().unwrap();
        store
            .set(SIGNING_KEY_SETTING, &hex::encode([9u8; 32]))
            .unwrap();
        assert!(matches!(mgr.ensure_identity(), Err(IdentityError::Corrupt(_))));
    }
}
