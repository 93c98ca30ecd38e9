//! One JSONL log line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A self-contained log event.
///
/// Lines are appended whole, so a file stays parseable even if the process
/// dies mid-session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 with milliseconds, UTC
    pub ts: String,
    pub level: String,
    /// Device that wrote the line (`dev_xxxxxxxx`)
    pub device: String,
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, outermost first, joined with " > "
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: impl Into<String>,
        device: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            device: device.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Structured field by name, if present
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|f| f.get(name))
    }
}
