//! Pass reports.

use crate::config::ReportLevel;
use crate::resolver::{ChangeKind, Decision, Side};
use chrono::{DateTime, Utc};
use docsync_store::StoreError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Whether a pass mutates stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// Execute decisions and settle signatures.
    Repair,
    /// Report decisions only.
    Check,
}

impl fmt::Display for PassMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassMode::Repair => f.write_str("repair"),
            PassMode::Check => f.write_str("check"),
        }
    }
}

/// What happened (or, in check mode, would happen) to one id or attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    /// Both sides match the signature.
    NoChange,
    /// Remote content copied to local.
    PutLocal,
    /// Local content copied to remote.
    PutRemote,
    /// Local creation pushed under a remote-generated id.
    PostRemote,
    /// Local copy removed after a remote deletion.
    DeleteLocal,
    /// Remote copy removed after a local deletion.
    DeleteRemote,
    /// Conflict resolved by overwriting local.
    ForcePutLocal,
    /// Conflict resolved by overwriting remote.
    ForcePutRemote,
    /// Both sides changed to the same content.
    FalseConflict,
    /// Gone on both sides; signature purged.
    PurgeSignature,
    /// Conflict left untouched by policy.
    SkipConflict,
    /// Unresolved conflict.
    Conflict,
    /// Local creation ignored.
    SkipLocalCreation,
    /// Local modification ignored.
    SkipLocalModification,
    /// Local deletion ignored.
    SkipLocalDeletion,
    /// Remote creation ignored.
    SkipRemoteCreation,
    /// Remote modification ignored.
    SkipRemoteModification,
    /// Remote deletion ignored.
    SkipRemoteDeletion,
}

impl LogKind {
    /// Returns the least verbose report level that includes this kind.
    #[must_use]
    pub fn level(self) -> ReportLevel {
        match self {
            LogKind::Conflict => ReportLevel::Errors,
            LogKind::NoChange => ReportLevel::All,
            _ => ReportLevel::Changes,
        }
    }

    /// Returns true if the kind changes a store.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            LogKind::PutLocal
                | LogKind::PutRemote
                | LogKind::PostRemote
                | LogKind::DeleteLocal
                | LogKind::DeleteRemote
                | LogKind::ForcePutLocal
                | LogKind::ForcePutRemote
        )
    }

    fn skipped(side: Side, kind: ChangeKind) -> Self {
        match (side, kind) {
            (Side::Local, ChangeKind::Creation) => LogKind::SkipLocalCreation,
            (Side::Local, ChangeKind::Modification) => LogKind::SkipLocalModification,
            (Side::Local, ChangeKind::Deletion) => LogKind::SkipLocalDeletion,
            (Side::Remote, ChangeKind::Creation) => LogKind::SkipRemoteCreation,
            (Side::Remote, ChangeKind::Modification) => LogKind::SkipRemoteModification,
            (Side::Remote, ChangeKind::Deletion) => LogKind::SkipRemoteDeletion,
        }
    }
}

impl From<&Decision> for LogKind {
    fn from(decision: &Decision) -> Self {
        match *decision {
            Decision::NoOp => LogKind::NoChange,
            Decision::Record => LogKind::FalseConflict,
            Decision::Forget => LogKind::PurgeSignature,
            Decision::Push { forced: false, .. } => LogKind::PutRemote,
            Decision::Push { forced: true, .. } => LogKind::ForcePutRemote,
            Decision::Pull { forced: false, .. } => LogKind::PutLocal,
            Decision::Pull { forced: true, .. } => LogKind::ForcePutLocal,
            Decision::DeleteLocal => LogKind::DeleteLocal,
            Decision::DeleteRemote => LogKind::DeleteRemote,
            Decision::Conflict => LogKind::Conflict,
            Decision::Deferred => LogKind::SkipConflict,
            Decision::Skip(skipped) => LogKind::skipped(skipped.side, skipped.kind),
        }
    }
}

/// One reported decision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ReportEntry {
    /// Document id.
    pub id: String,
    /// Attachment name, for attachment-level entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    /// What happened.
    pub kind: LogKind,
}

/// Why an id failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Both sides changed and the policy is to fail.
    Conflict,
    /// A store operation failed.
    Store {
        /// Store error message.
        message: String,
        /// Whether the store reported the error as transient.
        retryable: bool,
    },
}

impl FailureReason {
    /// Returns true if the failure may clear up on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Store { retryable: true, .. })
    }
}

impl From<&StoreError> for FailureReason {
    fn from(err: &StoreError) -> Self {
        FailureReason::Store {
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Conflict => f.write_str("unresolved conflict"),
            FailureReason::Store { message, .. } => f.write_str(message),
        }
    }
}

/// An id (or attachment) left unsettled by a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedId {
    /// Document id.
    pub id: String,
    /// Attachment name, when the failure is attachment-level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    /// Cause.
    pub reason: FailureReason,
}

impl fmt::Display for FailedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attachment {
            Some(name) => write!(f, "{}/{}: {}", self.id, name, self.reason),
            None => write!(f, "{}: {}", self.id, self.reason),
        }
    }
}

/// Outcome of one `repair()` or `check()` pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationReport {
    /// Pass mode.
    pub mode: PassMode,
    /// Number of candidate ids considered.
    pub candidates: usize,
    /// Reported decisions, sorted by id.
    pub entries: Vec<ReportEntry>,
    /// Ids that did not settle.
    pub failures: Vec<FailedId>,
    /// When the pass started.
    pub started_at: DateTime<Utc>,
    /// How long the pass took.
    pub duration: Duration,
}

impl ReplicationReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new(mode: PassMode) -> Self {
        Self {
            mode,
            candidates: 0,
            entries: Vec::new(),
            failures: Vec::new(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Returns the reported decisions.
    #[must_use]
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Returns the failed ids.
    #[must_use]
    pub fn failures(&self) -> &[FailedId] {
        &self.failures
    }

    /// Returns true if every id settled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Counts entries of a kind.
    #[must_use]
    pub fn count(&self, kind: LogKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// Returns the document-level entries as `(kind, id)` pairs.
    #[must_use]
    pub fn document_log(&self) -> Vec<(LogKind, &str)> {
        self.entries
            .iter()
            .filter(|e| e.attachment.is_none())
            .map(|e| (e.kind, e.id.as_str()))
            .collect()
    }

    /// Returns the ids whose state differs between the sides.
    ///
    /// In check mode this is the set a `repair()` would act on.
    #[must_use]
    pub fn divergent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| e.kind.is_mutation() || e.kind == LogKind::Conflict)
            .map(|e| e.id.as_str())
            .collect();
        ids.dedup();
        ids
    }

    pub(crate) fn finish(&mut self, level: ReportLevel) {
        self.entries.retain(|e| e.kind.level() <= level);
        self.entries.sort();
        self.failures
            .sort_by(|a, b| (&a.id, &a.attachment).cmp(&(&b.id, &b.attachment)));
    }
}
