//! Encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Every ciphertext in dersync is produced under a *pair key*: the
//! X25519 shared secret of two identities expanded with HKDF-SHA256.
//! Self-addressed ciphertext uses the pair key of an identity with itself.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::SyncError;
use crate::identity::Did;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size appended by ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"dersync-pair-key-v1";

/// Derive the 32-byte pair key for two identities from their X25519 shared secret.
///
/// The salt is the two DIDs in sorted order, so both sides derive the same
/// key regardless of who is "sender" and who is "recipient".
pub fn derive_pair_key(shared_secret: &[u8], a: &Did, b: &Did) -> Result<[u8; 32], SyncError> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut salt = Vec::with_capacity(lo.as_str().len() + hi.as_str().len() + 1);
    salt.extend_from_slice(lo.as_str().as_bytes());
    salt.push(0);
    salt.extend_from_slice(hi.as_str().as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut output)
        .map_err(|e| SyncError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(output)
}

/// Symmetric cipher bound to one pair key.
///
/// # Wire Format
///
/// `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
///
/// # Example
///
/// ```
/// use dersync_core::crypto::Cipher;
///
/// let cipher = Cipher::new(&Cipher::generate_key());
/// let ciphertext = cipher.encrypt(b"Hello, World!").unwrap();
/// assert_eq!(cipher.decrypt(&ciphertext).unwrap(), b"Hello, World!");
/// ```
pub struct Cipher {
    cipher: ChaCha20Poly1305,
}

impl Cipher {
    /// Create a cipher from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt with a fresh random nonce, prepended to the output.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt `[nonce][ciphertext+tag]`.
    ///
    /// Fails on wrong key, tampered data or truncated input.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SyncError> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SyncError::Crypto(
                "Data too short to contain nonce and tag".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|e| SyncError::Crypto(format!("Decryption failed: {}", e)))
    }
}
