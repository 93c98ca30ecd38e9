//! Decentralized Identifier (DID) implementation
//!
//! Format: `did:der:z{base58(ed25519_pk || x25519_pk)}`
//!
//! Unlike a hash-based identifier, the DID embeds both public keys so that
//! any peer holding only the identifier can verify signatures from it and
//! derive a pair key with it.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::error::{SyncError, SyncResult};

const DID_PREFIX: &str = "did:der:z";
const KEY_MATERIAL_LEN: usize = 64;

/// Public identity of an owner, delegate or agent.
///
/// Ordering is lexicographic on the string form so that delegate sets and
/// payload maps serialize deterministically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Did(String);

impl Did {
    /// Build a DID from the two public keys of an identity.
    pub fn from_keys(signing: &VerifyingKey, agreement: &X25519PublicKey) -> Self {
        let mut key_material = Vec::with_capacity(KEY_MATERIAL_LEN);
        key_material.extend_from_slice(signing.as_bytes());
        key_material.extend_from_slice(agreement.as_bytes());
        Did(format!(
            "{}{}",
            DID_PREFIX,
            bs58::encode(&key_material).into_string()
        ))
    }

    /// Get the DID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the identifier part (after "did:der:z")
    pub fn identifier(&self) -> &str {
        &self.0[DID_PREFIX.len()..]
    }

    /// Short form for logs and terminal output.
    pub fn short(&self) -> &str {
        let id = self.identifier();
        &id[..id.len().min(10)]
    }

    /// Parse a DID from a string
    pub fn parse(did_str: &str) -> SyncResult<Self> {
        Self::key_material(did_str)?;
        Ok(Did(did_str.to_string()))
    }

    fn key_material(did_str: &str) -> SyncResult<[u8; KEY_MATERIAL_LEN]> {
        let encoded = did_str
            .strip_prefix(DID_PREFIX)
            .ok_or_else(|| SyncError::InvalidDid(format!("missing '{}' prefix", DID_PREFIX)))?;
        if encoded.is_empty() {
            return Err(SyncError::InvalidDid("identifier cannot be empty".into()));
        }
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| SyncError::InvalidDid("invalid base58 in identifier".into()))?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            SyncError::InvalidDid(format!(
                "expected {} bytes of key material, got {}",
                KEY_MATERIAL_LEN,
                bytes.len()
            ))
        })
    }

    /// Ed25519 key used to verify signatures from this identity.
    pub fn signing_key(&self) -> SyncResult<VerifyingKey> {
        let material = Self::key_material(&self.0)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&material[..32]);
        VerifyingKey::from_bytes(&key)
            .map_err(|e| SyncError::InvalidDid(format!("bad signing key: {}", e)))
    }

    /// X25519 key used to derive pair keys with this identity.
    pub fn agreement_key(&self) -> SyncResult<X25519PublicKey> {
        let material = Self::key_material(&self.0)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&material[32..]);
        Ok(X25519PublicKey::from(key))
    }

    /// Verify an Ed25519 signature produced by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = self.signing_key() else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Did {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// DIDs travel as plain strings on the wire; validate on the way in.
impl Serialize for Did {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Did::parse(&s).map_err(serde::de::Error::custom)
    }
}
