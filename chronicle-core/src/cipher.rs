//! Optional authenticated-encryption stage of the mapper pipeline.
//!
//! Encryption is the outermost write-side transform: ciphertext is what the
//! recorder persists. Decryption failures (wrong key, tampered state,
//! truncated input) are fatal [`CipherError`]s; the pipeline never returns
//! partial plaintext.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;

/// Length in bytes of the nonce prepended to every ciphertext.
const NONCE_LEN: usize = 12;

/// Error raised when a payload cannot be decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// The ciphertext failed authentication: wrong key or tampered state.
    #[error("decryption failed: ciphertext authentication mismatch")]
    Authentication,
    /// The ciphertext is too short to contain a nonce.
    #[error("ciphertext is truncated: {len} bytes, expected at least {NONCE_LEN}")]
    Truncated { len: usize },
}

/// A byte-to-byte authenticated encryption capability with an inverse.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;

    /// Invert [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns a [`CipherError`] when the ciphertext does not authenticate
    /// under this cipher's key.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// AES-256-GCM with a fresh random 96-bit nonce per encryption.
///
/// The wire format is `nonce || ciphertext`, where the ciphertext includes
/// the GCM authentication tag.
#[derive(Clone)]
pub struct AesGcm {
    cipher: Aes256Gcm,
}

impl AesGcm {
    /// Construct a cipher from a 256-bit key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }
}

impl std::fmt::Debug for AesGcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("AesGcm").finish_non_exhaustive()
    }
}

impl Cipher for AesGcm {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .expect("AES-GCM encryption of an in-memory buffer cannot fail");

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        out
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CipherError::Truncated {
                len: ciphertext.len(),
            });
        }

        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CipherError::Authentication)
    }
}
