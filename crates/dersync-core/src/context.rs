//! Execution context threaded through sealing, the engine and the notifier.

use std::sync::Arc;

use crate::identity::{Did, IdentityProvider};
use crate::types::DeviceId;

/// Who is acting, and from which installation.
///
/// There is no process-global "current identity"; every component that
/// needs one receives a context.
#[derive(Clone)]
pub struct SyncContext {
    pub identity: Arc<dyn IdentityProvider>,
    pub device_id: DeviceId,
}

impl SyncContext {
    pub fn new(identity: Arc<dyn IdentityProvider>, device_id: DeviceId) -> Self {
        Self {
            identity,
            device_id,
        }
    }

    /// Context with a fresh random device id (tests, one-shot tools)
    pub fn with_random_device(identity: Arc<dyn IdentityProvider>) -> Self {
        Self::new(identity, DeviceId::new())
    }

    /// Shorthand for `self.identity.did()`
    pub fn did(&self) -> Did {
        self.identity.did()
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("did", &self.identity.did().short().to_string())
            .field("device_id", &self.device_id.to_string())
            .finish()
    }
}
