//! Identity module for dersync
//!
//! The core consumes identity as a capability: a stable public identifier,
//! a signing function and pair-key agreement. Login flows, key acquisition
//! and key storage policy belong to the caller.
//!
//! ## Example
//!
//! ```rust
//! use dersync_core::identity::{IdentityProvider, LocalIdentity};
//!
//! let alice = LocalIdentity::generate();
//! let bob = LocalIdentity::generate();
//!
//! // Signatures verify against the DID alone
//! let sig = alice.sign(b"hello");
//! assert!(alice.did().verify(b"hello", &sig));
//!
//! // Both sides derive the same pair key
//! assert_eq!(
//!     alice.pair_key(&bob.did()).unwrap(),
//!     bob.pair_key(&alice.did()).unwrap()
//! );
//! ```

mod did;
mod keypair;

pub use did::Did;
pub use keypair::LocalIdentity;

use crate::error::SyncResult;

/// Identity capability supplied by the host application.
pub trait IdentityProvider: Send + Sync {
    /// Public identifier of the current user.
    fn did(&self) -> Did;

    /// Sign arbitrary bytes; the signature verifies via [`Did::verify`].
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Symmetric key shared with `peer` (or with ourselves when
    /// `peer == self.did()`). Must be symmetric: A→B equals B→A.
    fn pair_key(&self, peer: &Did) -> SyncResult<[u8; 32]>;
}
