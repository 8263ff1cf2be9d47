//! Blob sealing with ChaCha20-Poly1305 under an HKDF-derived key.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::errors::StorageError;

pub const NONCE_LEN: usize = 12;
const KEY_SALT: &[u8] = b"bankfeed-secure-store";
const KEY_INFO: &[u8] = b"secure-blobs-v1";

/// Symmetric key for the blob table.
///
/// Each ciphertext is bound to its row name through the AEAD associated data,
/// so a blob copied under another name fails to open.
#[derive(Clone)]
pub struct BlobKey {
    key: [u8; 32],
}

impl BlobKey {
    /// Derives the key from a master secret with HKDF-SHA256.
    pub fn derive(master_secret: &[u8]) -> Result<Self, StorageError> {
        if master_secret.is_empty() {
            return Err(StorageError::crypto("master secret must not be empty"));
        }
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), master_secret);
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| StorageError::crypto(format!("key derivation failed: {}", e)))?;
        Ok(Self { key })
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn seal(&self, name: &str, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), StorageError> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| StorageError::crypto(format!("failed to seal {}", name)))?;
        Ok((nonce, ciphertext))
    }

    pub fn open(&self, name: &str, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, StorageError> {
        if nonce.len() != NONCE_LEN {
            return Err(StorageError::crypto(format!(
                "invalid nonce length {} for {}",
                nonce.len(),
                name
            )));
        }
        self.cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| StorageError::crypto(format!("failed to open {}", name)))
    }
}

impl std::fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlobKey(<redacted>)")
    }
}
