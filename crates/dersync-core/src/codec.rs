//! Record codec: canonical plaintext for sealing, tolerant decoding.
//!
//! The plaintext blob is JSON. Encoding is canonical (struct field order,
//! sorted sets and maps, no whitespace) so equal records produce equal
//! bytes. Decoding accepts two shapes:
//!
//! ```text
//! {"schema_version":3,"task":{..},"delegates":{..}}   current payload
//! {"title":"..","state":"next",..}                     bare task fields
//! ```
//!
//! The bare shape is what legacy clients and careless agents write. Agents
//! also tend to emit raw newlines and tabs inside string literals; those
//! are escaped by [`sanitize`] and parsing is retried once. A blob that
//! still fails decodes to a hidden placeholder instead of an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::{DelegateGrants, TaskFields};

/// Payload schema written by this version
pub const SCHEMA_VERSION: u32 = 3;

/// Everything that travels inside a sealed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub schema_version: u32,
    pub task: TaskFields,
    /// The owner's current grants, so delegates can see who else is granted
    #[serde(default, skip_serializing_if = "DelegateGrants::is_empty")]
    pub delegates: DelegateGrants,
}

impl RecordPayload {
    /// Payload at the current schema version
    pub fn new(task: TaskFields, delegates: DelegateGrants) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            task,
            delegates,
        }
    }
}

/// Which decoding path produced a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Parsed as-is
    Clean,
    /// Parsed after escaping stray control characters
    Sanitized,
    /// Unparseable; safe defaults with the soft-delete flag set
    Placeholder,
}

/// Result of [`decode_tolerant`]
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub payload: RecordPayload,
    pub recovery: Recovery,
}

/// Canonical serialization of a payload.
pub fn encode(payload: &RecordPayload) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Strict decode: no sanitizing, no placeholder.
pub fn decode(blob: &[u8]) -> SyncResult<RecordPayload> {
    let value: Value =
        serde_json::from_slice(blob).map_err(|e| SyncError::Decode(e.to_string()))?;
    from_value(value)
}

fn from_value(value: Value) -> SyncResult<RecordPayload> {
    let is_wrapped = value
        .as_object()
        .map(|obj| obj.contains_key("schema_version") && obj.contains_key("task"))
        .unwrap_or(false);

    if is_wrapped {
        serde_json::from_value(value).map_err(|e| SyncError::Decode(e.to_string()))
    } else if value.is_object() {
        let task: TaskFields =
            serde_json::from_value(value).map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(RecordPayload {
            schema_version: 0,
            task,
            delegates: DelegateGrants::default(),
        })
    } else {
        Err(SyncError::Decode("payload is not a JSON object".into()))
    }
}

/// Decode, falling back to sanitize-and-retry, then to a placeholder.
pub fn decode_tolerant(blob: &[u8]) -> Decoded {
    let first_err = match decode(blob) {
        Ok(payload) => {
            return Decoded {
                payload,
                recovery: Recovery::Clean,
            }
        }
        Err(e) => e,
    };

    let cleaned = sanitize(&String::from_utf8_lossy(blob));
    match decode(cleaned.as_bytes()) {
        Ok(payload) => {
            debug!(error = %first_err, "Recovered payload after sanitizing");
            Decoded {
                payload,
                recovery: Recovery::Sanitized,
            }
        }
        Err(second_err) => {
            warn!(error = %second_err, len = blob.len(), "Unreadable payload, substituting placeholder");
            Decoded {
                payload: RecordPayload::new(TaskFields::unreadable(), DelegateGrants::default()),
                recovery: Recovery::Placeholder,
            }
        }
    }
}

/// Escape raw control characters that appear inside JSON string literals.
///
/// Characters outside strings are left alone (they are either valid
/// whitespace or the blob is broken in a way this cannot fix).
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }

        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }

        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }

    out
}
