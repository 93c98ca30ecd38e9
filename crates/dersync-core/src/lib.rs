//! dersync core library
//!
//! Delegated Encrypted Record synchronization: a personal task store whose
//! records replicate through an untrusted remote store and can be shared
//! with delegates, while the store only ever sees ciphertext.
//!
//! ## Layers
//!
//! - **crypto / seal**: pair keys and multi-recipient sealing
//! - **storage**: versioned local record store on redb
//! - **codec**: canonical plaintext, tolerant decoding
//! - **engine**: pull, remote-deletion detection, push
//! - **sync**: wire formats, remote stores, notices and manifests
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dersync_core::{
//!     Collection, MemoryRemoteServer, Storage, SyncContext, SyncEngine, TaskFields,
//! };
//!
//! let storage = Storage::open("~/.dersync/data/dersync.redb")?;
//! let identity = Arc::new(storage.load_or_create_identity()?);
//! let ctx = SyncContext::new(identity.clone(), storage.device_id()?);
//! let remote = Arc::new(MemoryRemoteServer::new().client(ctx.did()));
//!
//! let engine = SyncEngine::new(storage, remote, ctx, vec![Collection::tasks()]);
//! engine.create_record(Collection::tasks(), TaskFields::titled("Plant garden"))?;
//! engine.sync_once(&engine.did()).await?;
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logging;
pub mod seal;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::EngineConfig;
pub use context::SyncContext;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use identity::{Did, IdentityProvider, LocalIdentity};
pub use storage::Storage;
pub use sync::{
    GossipMedium, HttpRemoteStore, MemoryMedium, MemoryRemoteServer, MemoryRemoteStore, Notifier,
    RemoteStore, SyncEvent, SyncOutcome, SyncReport, SyncStatus,
};
pub use types::*;
