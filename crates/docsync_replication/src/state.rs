//! Pass state machine and cumulative statistics.

use crate::report::{LogKind, ReplicationReport};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Phase of the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// No pass has run yet.
    Idle,
    /// Listing candidate ids.
    Enumerating,
    /// Reading current state of both sides.
    Diffing,
    /// Executing decisions.
    Dispatching,
    /// Folding document outcomes and reconciling attachments.
    Settling,
    /// The last pass converged.
    Completed,
    /// The last pass failed or was incomplete.
    Failed,
}

impl ReplicationState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ReplicationState::Enumerating
                | ReplicationState::Diffing
                | ReplicationState::Dispatching
                | ReplicationState::Settling
        )
    }

    /// Returns true if a new pass can start.
    pub fn can_start_pass(&self) -> bool {
        matches!(
            self,
            ReplicationState::Idle | ReplicationState::Completed | ReplicationState::Failed
        )
    }
}

/// Statistics accumulated over the lifetime of a replicator.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    /// Passes that converged.
    pub passes_completed: u64,
    /// Passes that failed, were incomplete or were cancelled.
    pub passes_failed: u64,
    /// Documents written to remote.
    pub documents_pushed: u64,
    /// Documents written to local.
    pub documents_pulled: u64,
    /// Documents removed from either side.
    pub documents_deleted: u64,
    /// Attachments written or removed on either side.
    pub attachments_transferred: u64,
    /// Conflicts met, resolved or not.
    pub conflicts: u64,
    /// Ids left unsettled.
    pub failures: u64,
    /// Start of the last pass.
    pub last_pass_at: Option<DateTime<Utc>>,
    /// Duration of the last pass.
    pub last_duration: Option<Duration>,
    /// Error of the last failed pass.
    pub last_error: Option<String>,
}

impl ReplicationStats {
    pub(crate) fn absorb(&mut self, report: &ReplicationReport) {
        for entry in report.entries() {
            let attachment = entry.attachment.is_some();
            match entry.kind {
                LogKind::PutRemote | LogKind::PostRemote | LogKind::ForcePutRemote if !attachment => {
                    self.documents_pushed += 1;
                }
                LogKind::PutLocal | LogKind::ForcePutLocal if !attachment => {
                    self.documents_pulled += 1;
                }
                LogKind::DeleteLocal | LogKind::DeleteRemote if !attachment => {
                    self.documents_deleted += 1;
                }
                kind if attachment && kind.is_mutation() => self.attachments_transferred += 1,
                _ => {}
            }
            if matches!(
                entry.kind,
                LogKind::Conflict | LogKind::SkipConflict | LogKind::ForcePutLocal | LogKind::ForcePutRemote
            ) {
                self.conflicts += 1;
            }
        }
        self.failures += report.failures().len() as u64;
        self.last_pass_at = Some(report.started_at);
        self.last_duration = Some(report.duration);
    }
}
