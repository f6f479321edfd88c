//! # docsync Replication
//!
//! Bidirectional replication between a local and a remote document store.
//!
//! This crate provides:
//! - Per-id signatures recording the last agreed state of both sides
//! - A decision table turning current hashes and a signature into an action
//! - Configurable conflict handling and per-side change checks
//! - Attachment replication layered on settled documents
//! - Bounded concurrency, single-flight passes and cancellation
//! - Retry with exponential backoff for transient store failures
//!
//! ## Architecture
//!
//! A pass runs **enumerate → diff → dispatch → settle**:
//! 1. List candidate ids from both stores and the signature store
//! 2. Hash each candidate on each side
//! 3. Decide and execute per id, then reconcile attachments of settled ids
//! 4. Collect outcomes into a [`ReplicationReport`]
//!
//! ## Key Invariants
//!
//! - A signature is written only after its store mutation succeeded
//! - A failed id never blocks the others; the next pass retries it
//! - Repeating a converged pass performs no writes
//! - Signatures kept in the local store are never replicated
//! - At most one pass per replicator runs at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod hash;
mod replicator;
mod report;
mod resolver;
mod signature;
mod state;

pub use config::{ConflictHandling, ReplicationConfig, ReportLevel, RetryConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use hash::{content_hash, DocumentHasher, MISSING_FIELD};
pub use replicator::Replicator;
pub use report::{FailedId, FailureReason, LogKind, PassMode, ReplicationReport, ReportEntry};
pub use resolver::{
    decide, Baseline, ChangeChecks, ChangeKind, Decision, DecisionPolicy, Side, SkippedChange,
};
pub use signature::{signature_namespace, SignatureRecord, SignatureStore, SIGNATURE_PREFIX};
pub use state::{ReplicationState, ReplicationStats};
