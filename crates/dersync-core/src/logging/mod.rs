//! Per-device JSONL audit logs.
//!
//! Several devices syncing the same owner each write their own file, so a
//! multi-device session can be reconstructed by merging them:
//!
//! ```text
//! <logs_dir>/
//! ├── 2026-10-16_dev_1a2b3c4d.jsonl
//! └── 2026-10-16_dev_9f8e7d6c.jsonl
//! ```
//!
//! ```ignore
//! use dersync_core::logging::JsonlLayer;
//! use tracing_subscriber::prelude::*;
//!
//! let jsonl = JsonlLayer::new("./logs", &device_id.to_string())?;
//! tracing_subscriber::registry()
//!     .with(jsonl)
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! ```bash
//! # Every pass summary, all devices, in order
//! cat logs/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.msg == "Sync pass complete")'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogEntry;
pub use layer::JsonlLayer;
pub use writer::{read_entries, DeviceLogWriter};
