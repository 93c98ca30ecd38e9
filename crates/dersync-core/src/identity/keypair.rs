//! Local identity: Ed25519 signing key plus X25519 static agreement secret.

use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use super::{Did, IdentityProvider};
use crate::crypto::derive_pair_key;
use crate::error::{SyncError, SyncResult};

/// Serialized length: ed25519 seed (32) + x25519 secret (32).
const IDENTITY_BYTES: usize = 64;

/// Identity whose secrets live in this process.
///
/// The secrets never leave this type: callers obtain signatures and pair
/// keys through [`IdentityProvider`].
#[derive(Clone)]
pub struct LocalIdentity {
    signing: SigningKey,
    agreement: X25519StaticSecret,
}

impl LocalIdentity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);

        let mut x25519_seed = [0u8; 32];
        rand::rng().fill_bytes(&mut x25519_seed);
        let agreement = X25519StaticSecret::from(x25519_seed);

        Self { signing, agreement }
    }

    /// Deterministic identity from a 32-byte seed.
    ///
    /// The agreement secret is derived from the seed with BLAKE3 so the
    /// two keys are independent.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let agreement = X25519StaticSecret::from(blake3::derive_key("dersync-x25519-seed-v1", seed));
        Self { signing, agreement }
    }

    /// X25519 public key
    pub fn agreement_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.agreement)
    }

    /// Serialize for local persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(IDENTITY_BYTES);
        bytes.extend_from_slice(&self.signing.to_bytes());
        bytes.extend_from_slice(self.agreement.as_bytes());
        bytes
    }

    /// Deserialize from [`LocalIdentity::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != IDENTITY_BYTES {
            return Err(SyncError::Identity(format!(
                "identity data must be {} bytes, got {}",
                IDENTITY_BYTES,
                bytes.len()
            )));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&bytes[32..]);
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
            agreement: X25519StaticSecret::from(secret),
        })
    }
}

impl IdentityProvider for LocalIdentity {
    fn did(&self) -> Did {
        Did::from_keys(&self.signing.verifying_key(), &self.agreement_public())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    fn pair_key(&self, peer: &Did) -> SyncResult<[u8; 32]> {
        let peer_public = peer.agreement_key()?;
        let shared = self.agreement.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(SyncError::Crypto(format!(
                "non-contributory key agreement with {}",
                peer.short()
            )));
        }
        derive_pair_key(shared.as_bytes(), &self.did(), peer)
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("did", &self.did().as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip_preserves_did() {
        let identity = LocalIdentity::generate();
        let restored = LocalIdentity::from_bytes(&identity.to_bytes()).unwrap();
        assert_eq!(identity.did(), restored.did());
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        assert!(LocalIdentity::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_seeded_identity_is_deterministic() {
        let a = LocalIdentity::from_seed(&[9u8; 32]);
        let b = LocalIdentity::from_seed(&[9u8; 32]);
        assert_eq!(a.did(), b.did());
        assert_ne!(a.did(), LocalIdentity::from_seed(&[8u8; 32]).did());
    }

    #[test]
    fn test_pair_key_is_symmetric() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let ab = alice.pair_key(&bob.did()).unwrap();
        let ba = bob.pair_key(&alice.did()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_pair_key_differs_per_peer() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let carol = LocalIdentity::generate();
        assert_ne!(
            alice.pair_key(&bob.did()).unwrap(),
            alice.pair_key(&carol.did()).unwrap()
        );
    }

    #[test]
    fn test_self_pair_key() {
        let alice = LocalIdentity::generate();
        let me = alice.did();
        assert_eq!(alice.pair_key(&me).unwrap(), alice.pair_key(&me).unwrap());
    }
}
