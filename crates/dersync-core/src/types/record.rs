//! Record types: the unit of replication and its task fields.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{now_millis, Collection, RecordId};
use crate::identity::Did;

/// Workflow state of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Captured, not yet triaged
    #[default]
    Inbox,
    /// Actionable now
    Next,
    /// Blocked on someone else
    Waiting,
    /// Has a start date in the future
    Scheduled,
    /// Parked
    Someday,
    /// Completed
    Done,
}

/// Task priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    None,
    Low,
    Medium,
    High,
    Urgent,
}

/// When a task is due or may start. Unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    /// Deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due: Option<i64>,
    /// Earliest start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Opaque recurrence rule (e.g. an RRULE string)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
}

impl Schedule {
    /// No dates set
    pub fn is_empty(&self) -> bool {
        self.due.is_none() && self.start.is_none() && self.recurrence.is_none()
    }
}

/// Domain fields of a task record.
///
/// Every field defaults, so blobs written by agents may omit anything.
/// Keys this version does not know are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFields {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notes: String,
    pub state: TaskState,
    pub priority: Priority,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Schedule::is_empty")]
    pub schedule: Schedule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Did>,
    /// Soft-delete flag
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TaskFields {
    /// New task with the given title, stamped now.
    pub fn titled(title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            title: title.into(),
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    /// Safe defaults for a blob that could not be parsed: hidden, not lost.
    pub fn unreadable() -> Self {
        Self {
            title: "Unreadable record".to_string(),
            deleted: true,
            ..Default::default()
        }
    }
}

/// Permission level granted to a delegate. Write implies read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    /// Whether this level allows pushing new versions
    pub fn allows_write(&self) -> bool {
        matches!(self, Permission::Write)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::Read => write!(f, "read"),
            Permission::Write => write!(f, "write"),
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            other => Err(format!("unknown permission '{}'", other)),
        }
    }
}

/// Delegates granted access to one record.
///
/// A delegate appears in at most one set; write delegates are not repeated
/// in `read`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateGrants {
    #[serde(rename = "read_delegates")]
    pub read: BTreeSet<Did>,
    #[serde(rename = "write_delegates")]
    pub write: BTreeSet<Did>,
}

impl DelegateGrants {
    /// Grant (or change) a delegate's permission
    pub fn grant(&mut self, delegate: Did, permission: Permission) {
        match permission {
            Permission::Read => {
                self.write.remove(&delegate);
                self.read.insert(delegate);
            }
            Permission::Write => {
                self.read.remove(&delegate);
                self.write.insert(delegate);
            }
        }
    }

    /// Remove a delegate entirely. Returns true if it was granted.
    pub fn revoke(&mut self, delegate: &Did) -> bool {
        let r = self.read.remove(delegate);
        let w = self.write.remove(delegate);
        r || w
    }

    /// Current permission of a delegate, if any
    pub fn permission_of(&self, delegate: &Did) -> Option<Permission> {
        if self.write.contains(delegate) {
            Some(Permission::Write)
        } else if self.read.contains(delegate) {
            Some(Permission::Read)
        } else {
            None
        }
    }

    /// Everyone who must receive a sealed copy
    pub fn recipients(&self) -> BTreeSet<Did> {
        self.read.union(&self.write).cloned().collect()
    }

    /// No delegates at all
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

/// One replicated record as held in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    pub owner: Did,
    pub collection: Collection,
    pub fields: TaskFields,
    #[serde(default)]
    pub grants: DelegateGrants,
    /// Server-assigned; 0 until the first accepted push
    pub version: u64,
    /// Local fields differ from the last reconciled version
    pub pending: bool,
}

impl Record {
    /// A freshly created local record: version 0, pending.
    pub fn new(owner: Did, collection: Collection, fields: TaskFields) -> Self {
        Self {
            record_id: RecordId::new(),
            owner,
            collection,
            fields,
            grants: DelegateGrants::default(),
            version: 0,
            pending: true,
        }
    }

    /// Whether the record has been accepted by the remote store at least once
    pub fn was_synced(&self) -> bool {
        self.version > 0
    }

    /// Soft-deleted records are hidden from listings
    pub fn is_visible(&self) -> bool {
        !self.fields.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityProvider, LocalIdentity};

    #[test]
    fn test_new_record_is_pending_at_version_zero() {
        let owner = LocalIdentity::generate().did();
        let record = Record::new(owner, Collection::tasks(), TaskFields::titled("Plant garden"));
        assert_eq!(record.version, 0);
        assert!(record.pending);
        assert!(!record.was_synced());
        assert_eq!(record.fields.created_at, record.fields.updated_at);
    }

    #[test]
    fn test_write_grant_implies_read() {
        let d = LocalIdentity::generate().did();
        let mut grants = DelegateGrants::default();
        grants.grant(d.clone(), Permission::Write);
        assert_eq!(grants.permission_of(&d), Some(Permission::Write));
        assert!(grants.recipients().contains(&d));
        assert!(!grants.read.contains(&d));
    }

    #[test]
    fn test_downgrade_and_revoke() {
        let d = LocalIdentity::generate().did();
        let mut grants = DelegateGrants::default();
        grants.grant(d.clone(), Permission::Write);
        grants.grant(d.clone(), Permission::Read);
        assert_eq!(grants.permission_of(&d), Some(Permission::Read));
        assert!(grants.revoke(&d));
        assert!(!grants.revoke(&d));
        assert!(grants.is_empty());
    }

    #[test]
    fn test_unreadable_defaults_are_hidden() {
        let fields = TaskFields::unreadable();
        assert!(fields.deleted);
        assert_eq!(fields.state, TaskState::Inbox);
    }

    #[test]
    fn test_permission_parse() {
        assert_eq!("write".parse::<Permission>().unwrap(), Permission::Write);
        assert!("admin".parse::<Permission>().is_err());
    }
}
