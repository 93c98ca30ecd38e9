//! Multi-recipient sealing over pair keys.
//!
//! ## Model
//!
//! ```text
//! seal_to(plaintext, R)        = ChaCha20Poly1305(pair_key(me, R), plaintext)
//! seal_to_self(plaintext)      = seal_to(plaintext, me)
//! seal_for_delegates(p, [D..]) = { D_i -> seal_to(p, D_i) }
//! ```
//!
//! An envelope carries the owner copy in `encrypted_data`, the identity
//! that sealed it in `encrypted_from`, and one copy per delegate. A reader
//! tries the owner copy first and then its own delegate entry, using
//! `encrypted_from` as the sender both times. Pair keys are symmetric, so
//! the same derivation serves sealing and opening.
//!
//! Secret keys stay inside the [`IdentityProvider`]; this module only ever
//! sees derived pair keys.

use std::collections::BTreeMap;

use tracing::debug;

use crate::crypto::Cipher;
use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityProvider};

/// Which path opened a ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenedAs {
    /// `encrypted_data` was addressed to us
    Owner,
    /// Our entry in the delegate payloads
    Delegate,
}

/// Seal `plaintext` so that only `recipient` (and we) can open it.
pub fn seal_to(
    identity: &dyn IdentityProvider,
    plaintext: &[u8],
    recipient: &Did,
) -> SyncResult<Vec<u8>> {
    let key = identity.pair_key(recipient)?;
    Cipher::new(&key).encrypt(plaintext)
}

/// Open a ciphertext sealed to us by `sender`.
pub fn unseal_from(
    identity: &dyn IdentityProvider,
    ciphertext: &[u8],
    sender: &Did,
) -> SyncResult<Vec<u8>> {
    let key = identity.pair_key(sender)?;
    Cipher::new(&key)
        .decrypt(ciphertext)
        .map_err(|e| SyncError::Unseal(format!("from {}: {}", sender.short(), e)))
}

/// Seal for our own later use.
pub fn seal_to_self(identity: &dyn IdentityProvider, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
    seal_to(identity, plaintext, &identity.did())
}

/// Open a ciphertext we sealed for ourselves.
pub fn unseal_from_self(identity: &dyn IdentityProvider, ciphertext: &[u8]) -> SyncResult<Vec<u8>> {
    unseal_from(identity, ciphertext, &identity.did())
}

/// One independent ciphertext per delegate.
pub fn seal_for_delegates<'a>(
    identity: &dyn IdentityProvider,
    plaintext: &[u8],
    delegates: impl IntoIterator<Item = &'a Did>,
) -> SyncResult<BTreeMap<Did, Vec<u8>>> {
    let mut payloads = BTreeMap::new();
    for delegate in delegates {
        payloads.insert(delegate.clone(), seal_to(identity, plaintext, delegate)?);
    }
    Ok(payloads)
}

/// Open an envelope's ciphertext, trying the owner path then the delegate path.
///
/// Fails with [`SyncError::Unseal`] only when every path fails.
pub fn open(
    identity: &dyn IdentityProvider,
    encrypted_data: &[u8],
    encrypted_from: &Did,
    delegate_payloads: &BTreeMap<Did, Vec<u8>>,
) -> SyncResult<(Vec<u8>, OpenedAs)> {
    let me = identity.did();

    let owner_err = match unseal_from(identity, encrypted_data, encrypted_from) {
        Ok(plaintext) => return Ok((plaintext, OpenedAs::Owner)),
        Err(e) => e,
    };
    debug!(error = %owner_err, "Owner path failed, trying delegate payload");

    match delegate_payloads.get(&me) {
        Some(ciphertext) => unseal_from(identity, ciphertext, encrypted_from)
            .map(|plaintext| (plaintext, OpenedAs::Delegate)),
        None => Err(SyncError::Unseal(format!(
            "no payload for {} and owner copy did not open",
            me.short()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;

    #[test]
    fn test_self_roundtrip() {
        let alice = LocalIdentity::generate();
        let sealed = seal_to_self(&alice, b"notes to self").unwrap();
        assert_eq!(unseal_from_self(&alice, &sealed).unwrap(), b"notes to self");
    }

    #[test]
    fn test_other_identity_cannot_open_self_seal() {
        let alice = LocalIdentity::generate();
        let eve = LocalIdentity::generate();
        let sealed = seal_to_self(&alice, b"private").unwrap();

        let result = unseal_from(&eve, &sealed, &alice.did());
        assert!(matches!(result, Err(SyncError::Unseal(_))));
    }

    #[test]
    fn test_seal_to_recipient() {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let sealed = seal_to(&alice, b"for bob", &bob.did()).unwrap();
        assert_eq!(unseal_from(&bob, &sealed, &alice.did()).unwrap(), b"for bob");
    }

    #[test]
    fn test_seal_for_delegates_each_opens_own() {
        let owner = LocalIdentity::generate();
        let d1 = LocalIdentity::generate();
        let d2 = LocalIdentity::generate();
        let dids = [d1.did(), d2.did()];

        let payloads = seal_for_delegates(&owner, b"shared task", dids.iter()).unwrap();
        assert_eq!(payloads.len(), 2);

        let c1 = &payloads[&d1.did()];
        let c2 = &payloads[&d2.did()];
        assert_eq!(unseal_from(&d1, c1, &owner.did()).unwrap(), b"shared task");
        assert_eq!(unseal_from(&d2, c2, &owner.did()).unwrap(), b"shared task");
        // d1's copy is useless to d2
        assert!(unseal_from(&d2, c1, &owner.did()).is_err());
    }

    #[test]
    fn test_open_as_owner_and_delegate() {
        let owner = LocalIdentity::generate();
        let delegate = LocalIdentity::generate();
        let outsider = LocalIdentity::generate();

        let data = seal_to_self(&owner, b"payload").unwrap();
        let payloads = seal_for_delegates(&owner, b"payload", [delegate.did()].iter()).unwrap();

        let (p, how) = open(&owner, &data, &owner.did(), &payloads).unwrap();
        assert_eq!((p.as_slice(), how), (&b"payload"[..], OpenedAs::Owner));

        let (p, how) = open(&delegate, &data, &owner.did(), &payloads).unwrap();
        assert_eq!((p.as_slice(), how), (&b"payload"[..], OpenedAs::Delegate));

        assert!(matches!(
            open(&outsider, &data, &owner.did(), &payloads),
            Err(SyncError::Unseal(_))
        ));
    }

    #[test]
    fn test_owner_opens_copy_written_by_delegate() {
        let owner = LocalIdentity::generate();
        let writer = LocalIdentity::generate();

        // A write delegate seals the owner copy to the owner
        let data = seal_to(&writer, b"edited", &owner.did()).unwrap();
        let (p, how) = open(&owner, &data, &writer.did(), &BTreeMap::new()).unwrap();
        assert_eq!(p, b"edited");
        assert_eq!(how, OpenedAs::Owner);
    }
}
