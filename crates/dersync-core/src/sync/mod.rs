//! Replication layer: wire envelopes, remote stores, notices and manifests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  envelope: RawEnvelope ──detect──▶ WireEnvelope ──open──▶ bytes │
//! │            (Legacy | Delegated | Versioned)                     │
//! │                                                                 │
//! │  remote:   RemoteStore (fetch / push / delegations)             │
//! │            ├── HttpRemoteStore   signed requests over HTTPS     │
//! │            ├── RelayRemoteStore  signed requests to an iroh peer│
//! │            └── MemoryRemoteStore in-process server model        │
//! │                                                                 │
//! │  medium:   BroadcastMedium (publish / subscribe)                │
//! │            ├── MemoryMedium      with recent-history replay     │
//! │            └── GossipMedium      iroh-gossip, one topic per kind│
//! │                                                                 │
//! │  notifier: signed Notices and sealed DelegationManifests        │
//! │  manifest: ManifestBook, the delegate's view of what it may see │
//! │  events:   SyncReport / SyncOutcome / SyncEvent                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod envelope;
pub mod events;
pub mod gossip;
pub mod manifest;
pub mod medium;
pub mod notifier;
pub mod remote;

pub use envelope::{
    detect, DelegationMetadata, OpenedEnvelope, RawEnvelope, SealedEnvelope, WireEnvelope,
    UNVERSIONED,
};
pub use events::{RecordFailure, SyncEvent, SyncOutcome, SyncPhase, SyncReport, SyncStatus};
pub use gossip::GossipMedium;
pub use manifest::{DelegationManifest, ManifestBook, ManifestDiff, ManifestEntry};
pub use medium::{BroadcastEvent, BroadcastMedium, EventFilter, MemoryMedium};
pub use notifier::{
    subject_tag, Notice, NoticeEvent, Notifier, PublishOutcome, SubscriptionHandle,
    TrackedSubjects,
};
pub use remote::{
    Accepted, Delegation, DelegationScope, HttpRemoteStore, MemoryRemoteServer, MemoryRemoteStore,
    PushOutcome, RejectReason, Rejected, RelayBackend, RelayNode, RelayRemoteStore, RemoteStore,
    RequestProof,
};
