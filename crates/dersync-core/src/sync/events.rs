//! Sync pass reports, outcomes and events
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncReport: counters for one pass                              │
//! │  ├── pulled / updated / removed       (phases 1 and 2)          │
//! │  ├── pushed / hard_deleted / resealed (phase 3)                 │
//! │  └── failures: per-record problems that did not stop the pass   │
//! │                                                                 │
//! │  SyncOutcome: what a trigger did                                │
//! │  ├── Completed(report)                                          │
//! │  ├── Coalesced: a pass was running and will run again           │
//! │  └── Deferred: transient failure, retried by the next pass      │
//! │                                                                 │
//! │  SyncEvent: broadcast to UI / CLI listeners                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::identity::Did;
use crate::types::RecordId;

/// Which phase a per-record failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Pull,
    RemoteDeletion,
    Push,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Pull => write!(f, "pull"),
            SyncPhase::RemoteDeletion => write!(f, "remote-deletion"),
            SyncPhase::Push => write!(f, "push"),
        }
    }
}

/// A record the pass could not process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub record_id: Option<RecordId>,
    pub phase: SyncPhase,
    pub reason: String,
}

/// Counters for one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// New records imported from the remote store
    pub pulled: usize,
    /// Local records replaced by a newer remote version
    pub updated: usize,
    /// Local records removed because the remote copy is gone or a tombstone
    pub removed: usize,
    /// Records accepted by the remote store
    pub pushed: usize,
    /// Soft-deleted records dropped after their push was acknowledged
    pub hard_deleted: usize,
    /// Records marked pending because a granted delegate lacked a payload
    pub resealed: usize,
    /// Pulled records that needed sanitizing or became placeholders
    pub recovered: usize,
    /// Push rejections for lack of write permission
    pub permission_denied: Vec<RecordId>,
    pub failures: Vec<RecordFailure>,
}

impl SyncReport {
    /// Whether the pass touched the local store at all
    pub fn changed_local(&self) -> bool {
        self.pulled + self.updated + self.removed + self.hard_deleted + self.resealed > 0
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.permission_denied.is_empty()
    }

    pub(crate) fn fail(&mut self, record_id: Option<RecordId>, phase: SyncPhase, reason: impl fmt::Display) {
        self.failures.push(RecordFailure {
            record_id,
            phase,
            reason: reason.to_string(),
        });
    }

    /// Fold another report into this one (coalesced reruns)
    pub fn absorb(&mut self, other: SyncReport) {
        self.pulled += other.pulled;
        self.updated += other.updated;
        self.removed += other.removed;
        self.pushed += other.pushed;
        self.hard_deleted += other.hard_deleted;
        self.resealed += other.resealed;
        self.recovered += other.recovered;
        self.permission_denied.extend(other.permission_denied);
        self.failures.extend(other.failures);
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pulled {}, updated {}, removed {}, pushed {}, hard-deleted {}, resealed {}",
            self.pulled, self.updated, self.removed, self.pushed, self.hard_deleted, self.resealed
        )?;
        if !self.failures.is_empty() {
            write!(f, ", {} failures", self.failures.len())?;
        }
        Ok(())
    }
}

/// Result of asking the engine to sync an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pass (and any coalesced reruns) finished
    Completed(SyncReport),
    /// Another pass for this owner was running; it will run once more
    Coalesced,
    /// A background pass hit a transient error and left local state as it was
    Deferred(String),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Coalesced | SyncOutcome::Deferred(_) => None,
        }
    }
}

/// Status of synchronization for one owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Error(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass finished for an owner
    PassCompleted { owner: Did, report: SyncReport },
    /// A pass failed before completing
    PassFailed { owner: Did, error: String },
    /// The status of an owner changed
    StatusChanged { owner: Did, status: SyncStatus },
}

impl SyncEvent {
    pub fn owner(&self) -> &Did {
        match self {
            SyncEvent::PassCompleted { owner, .. }
            | SyncEvent::PassFailed { owner, .. }
            | SyncEvent::StatusChanged { owner, .. } => owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_absorb_and_display() {
        let mut a = SyncReport {
            pulled: 2,
            pushed: 1,
            ..Default::default()
        };
        let mut b = SyncReport {
            removed: 1,
            ..Default::default()
        };
        b.fail(Some(RecordId::from_string("r1")), SyncPhase::Pull, "unseal failed");
        a.absorb(b);

        assert_eq!(a.pulled, 2);
        assert_eq!(a.removed, 1);
        assert!(a.changed_local());
        assert!(!a.is_clean());
        assert!(a.to_string().contains("1 failures"));
        assert_eq!(a.failures[0].phase.to_string(), "pull");
    }

    #[test]
    fn test_push_only_does_not_change_local() {
        let report = SyncReport {
            pushed: 3,
            ..Default::default()
        };
        assert!(!report.changed_local());
        assert!(report.is_clean());
    }

    #[test]
    fn test_outcome_report() {
        assert!(SyncOutcome::Coalesced.report().is_none());
        let done = SyncOutcome::Completed(SyncReport::default());
        assert_eq!(done.report(), Some(&SyncReport::default()));
    }
}
