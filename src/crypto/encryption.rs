//! At-rest encryption for tokens and other secrets.
//!
//! # Construction
//!
//! Every encryption derives a fresh 256-bit key from the master secret and a
//! random 128-bit salt via PBKDF2-HMAC-SHA256, then seals the plaintext with
//! AES-256-GCM under a random 96-bit nonce. The output is a single
//! base64url blob: `salt || nonce || ciphertext+tag`.
//!
//! # Security properties
//!
//! - Decryption failures are reported as one opaque error; callers cannot
//!   distinguish a bad key from a truncated blob or a forged tag.
//! - The master key is zeroized on [`EncryptionManager::destroy`] and when
//!   the manager is dropped.
//! - Token-grade data uses a low iteration count (tokens are already signed);
//!   higher-value data should be configured with ≥100 000 iterations.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use parking_lot::RwLock;
use pbkdf2::pbkdf2_hmac;
use rand::RngExt;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Salt length prepended to every blob (128 bits).
const SALT_LEN: usize = 16;

/// AES-GCM nonce length (96 bits).
const NONCE_LEN: usize = 12;

/// Error variants for encryption operations.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// Any decryption failure: wrong key, malformed blob, forged tag.
    /// Deliberately opaque.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Encryption-side failure (should not occur with valid inputs).
    #[error("encryption failed")]
    EncryptionFailed,

    /// The supplied master key is not valid base64url or has a bad length.
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    /// The manager was destroyed and can no longer be used.
    #[error("encryption manager destroyed")]
    Destroyed,
}

impl From<EncryptionError> for crate::Error {
    fn from(e: EncryptionError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Authenticated symmetric encryption over opaque byte sequences.
pub struct EncryptionManager {
    /// Master secret; `None` after [`destroy`](Self::destroy).
    master_key: RwLock<Option<Zeroizing<Vec<u8>>>>,
    /// PBKDF2 iteration count for per-encryption key derivation.
    iterations: u32,
}

impl EncryptionManager {
    /// Create a manager from a base64url master key.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::InvalidKey`] when the key does not decode
    /// or is shorter than 256 bits.
    pub fn new(master_key_b64: &str, iterations: u32) -> Result<Self, EncryptionError> {
        let key = URL_SAFE_NO_PAD
            .decode(master_key_b64)
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        if key.len() < 32 {
            return Err(EncryptionError::InvalidKey(format!(
                "expected at least 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            master_key: RwLock::new(Some(Zeroizing::new(key))),
            iterations: iterations.max(1),
        })
    }

    /// Generate a fresh 256-bit master key, base64url-encoded.
    #[must_use]
    pub fn generate_master_key() -> String {
        let bytes: [u8; 32] = rand::rng().random();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Encrypt `plaintext` and return the base64url blob.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Destroyed`] after [`destroy`](Self::destroy).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        let guard = self.master_key.read();
        let master = guard.as_ref().ok_or(EncryptionError::Destroyed)?;

        let salt: [u8; SALT_LEN] = rand::rng().random();
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let key = self.derive_key(master, &salt);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| EncryptionError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns the single opaque [`EncryptionError::DecryptionFailed`] on any
    /// verification failure.
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, EncryptionError> {
        let guard = self.master_key.read();
        let master = guard.as_ref().ok_or(EncryptionError::Destroyed)?;

        let raw = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|_| EncryptionError::DecryptionFailed)?;
        if raw.len() < SALT_LEN + NONCE_LEN {
            return Err(EncryptionError::DecryptionFailed);
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let key = self.derive_key(master, salt);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EncryptionError::DecryptionFailed)
    }

    /// Encrypt a UTF-8 string.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, EncryptionError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt a blob into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Invalid UTF-8 in the plaintext is reported as the same opaque failure.
    pub fn decrypt_str(&self, blob: &str) -> Result<String, EncryptionError> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes).map_err(|_| EncryptionError::DecryptionFailed)
    }

    /// Whether `blob` decrypts successfully under the current key.
    #[must_use]
    pub fn verify(&self, blob: &str) -> bool {
        self.decrypt(blob).is_ok()
    }

    /// Overwrite the in-memory master key. Subsequent operations fail with
    /// [`EncryptionError::Destroyed`].
    pub fn destroy(&self) {
        // Zeroizing drops the old key with an explicit wipe
        *self.master_key.write() = None;
    }

    /// PBKDF2-HMAC-SHA256 key derivation for one encryption.
    fn derive_key(&self, master: &[u8], salt: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(master, salt, self.iterations, &mut *key);
        key
    }
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EncryptionManager {
        EncryptionManager::new(&EncryptionManager::generate_master_key(), 1_000).unwrap()
    }

    #[test]
    fn round_trip_restores_plaintext() {
        let mgr = manager();
        let blob = mgr.encrypt(b"refresh-token-material").unwrap();
        assert_eq!(mgr.decrypt(&blob).unwrap(), b"refresh-token-material");
    }

    #[test]
    fn string_round_trip() {
        let mgr = manager();
        let blob = mgr.encrypt_str("eyJhbGciOiJSUzI1NiJ9.payload.sig").unwrap();
        assert_eq!(mgr.decrypt_str(&blob).unwrap(), "eyJhbGciOiJSUzI1NiJ9.payload.sig");
    }

    #[test]
    fn every_encryption_is_unique() {
        // Fresh salt and nonce per call: identical plaintexts yield distinct blobs
        let mgr = manager();
        let a = mgr.encrypt(b"same").unwrap();
        let b = mgr.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_with_opaque_error() {
        let mgr1 = manager();
        let mgr2 = manager();
        let blob = mgr1.encrypt(b"secret").unwrap();

        let err = mgr2.decrypt(&blob).unwrap_err();
        assert_eq!(err.to_string(), "decryption failed");
    }

    #[test]
    fn tampered_blob_fails_with_opaque_error() {
        let mgr = manager();
        let mut blob = mgr.encrypt(b"secret").unwrap();
        // Flip a character near the end (inside the tag)
        let flipped = if blob.ends_with('A') { "B" } else { "A" };
        blob.replace_range(blob.len() - 1.., flipped);

        let err = mgr.decrypt(&blob).unwrap_err();
        assert_eq!(err.to_string(), "decryption failed");
    }

    #[test]
    fn truncated_blob_fails_with_opaque_error() {
        let mgr = manager();
        assert_eq!(
            mgr.decrypt("c2hvcnQ").unwrap_err().to_string(),
            "decryption failed"
        );
        assert_eq!(mgr.decrypt("!!!not-base64!!!").unwrap_err().to_string(), "decryption failed");
    }

    #[test]
    fn verify_reports_integrity_without_plaintext() {
        let mgr = manager();
        let blob = mgr.encrypt(b"secret").unwrap();
        assert!(mgr.verify(&blob));
        assert!(!mgr.verify("AAAA"));
    }

    #[test]
    fn destroy_disables_the_manager() {
        let mgr = manager();
        let blob = mgr.encrypt(b"secret").unwrap();
        mgr.destroy();
        assert!(matches!(
            mgr.encrypt(b"more").unwrap_err(),
            EncryptionError::Destroyed
        ));
        assert!(matches!(
            mgr.decrypt(&blob).unwrap_err(),
            EncryptionError::Destroyed
        ));
    }

    #[test]
    fn rejects_short_master_keys() {
        let short = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(matches!(
            EncryptionManager::new(&short, 1_000),
            Err(EncryptionError::InvalidKey(_))
        ));
    }

    #[test]
    fn generated_master_keys_are_unique_base64url() {
        let a = EncryptionManager::generate_master_key();
        let b = EncryptionManager::generate_master_key();
        assert_ne!(a, b);
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
        assert!(!a.contains('='));
    }
}
