//! Core types for dersync

use rand::RngCore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod record;

pub use record::{DelegateGrants, Permission, Priority, Record, Schedule, TaskFields, TaskState};

/// Current time as unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Unique identifier for a record
///
/// Opaque to the protocol. Locally created records use ULIDs so they sort
/// by creation time; records written by agents may carry any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new RecordId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an existing identifier
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace tag distinguishing record kinds that share one remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection(String);

impl Collection {
    /// Task records
    pub const TASKS: &'static str = "tasks";
    /// Periodic review records
    pub const REVIEWS: &'static str = "reviews";

    /// Create a collection tag
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The default task collection
    pub fn tasks() -> Self {
        Self::new(Self::TASKS)
    }

    /// Get the tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-installation identifier used to suppress self-echo notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 16]);

impl DeviceId {
    /// Create a new random DeviceId
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex form for display and logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev_{}", hex::encode(&self.0[..4]))
    }
}
