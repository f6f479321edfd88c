//! Configuration for replication.

use crate::error::{ReplicationError, ReplicationResult};
use crate::resolver::{ChangeChecks, DecisionPolicy};
use docsync_store::{QueryOptions, StoreSpec};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How to resolve a document changed differently on both sides.
///
/// Serialized as its numeric code; names are accepted on input.
///
/// | Code | Name | Effect |
/// |------|------|--------|
/// | 0 | `fail` | report a conflict, touch nothing |
/// | 1 | `keep_local` | overwrite remote with local |
/// | 2 | `keep_remote` | overwrite local with remote |
/// | 3 | `continue` | leave both sides and the signature as they are |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ConflictHandlingRepr", into = "u8")]
pub enum ConflictHandling {
    /// Surface an unresolved conflict.
    #[default]
    Fail,
    /// Local wins.
    KeepLocal,
    /// Remote wins.
    KeepRemote,
    /// Skip the id for this pass.
    Continue,
}

impl ConflictHandling {
    /// Returns the numeric code.
    #[must_use]
    pub fn to_code(self) -> u8 {
        match self {
            ConflictHandling::Fail => 0,
            ConflictHandling::KeepLocal => 1,
            ConflictHandling::KeepRemote => 2,
            ConflictHandling::Continue => 3,
        }
    }

    /// Parses a numeric code.
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ConflictHandling::Fail),
            1 => Some(ConflictHandling::KeepLocal),
            2 => Some(ConflictHandling::KeepRemote),
            3 => Some(ConflictHandling::Continue),
            _ => None,
        }
    }

    /// Parses a policy name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fail" => Some(ConflictHandling::Fail),
            "keep_local" => Some(ConflictHandling::KeepLocal),
            "keep_remote" => Some(ConflictHandling::KeepRemote),
            "continue" => Some(ConflictHandling::Continue),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictHandling::Fail => "fail",
            ConflictHandling::KeepLocal => "keep_local",
            ConflictHandling::KeepRemote => "keep_remote",
            ConflictHandling::Continue => "continue",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConflictHandlingRepr {
    Code(i64),
    Name(String),
}

impl TryFrom<ConflictHandlingRepr> for ConflictHandling {
    type Error = String;

    fn try_from(repr: ConflictHandlingRepr) -> Result<Self, Self::Error> {
        match repr {
            ConflictHandlingRepr::Code(code) => ConflictHandling::from_code(code)
                .ok_or_else(|| format!("Unsupported conflict handling: {code}")),
            ConflictHandlingRepr::Name(name) => ConflictHandling::from_name(&name)
                .ok_or_else(|| format!("Unsupported conflict handling: {name}")),
        }
    }
}

impl From<ConflictHandling> for u8 {
    fn from(handling: ConflictHandling) -> Self {
        handling.to_code()
    }
}

/// Which decisions appear in a pass report.
///
/// Failures are always reported regardless of level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    /// Conflicts only.
    Errors,
    /// Mutations, skips and conflicts.
    #[default]
    Changes,
    /// Everything, including unchanged ids.
    All,
}

/// Options of a replication.
///
/// Deserializes from the JSON options object; every field is optional.
///
/// ```rust
/// use docsync_replication::{ConflictHandling, ReplicationConfig};
/// use serde_json::json;
///
/// let config = ReplicationConfig::from_json(json!({
///     "conflict_handling": 1,
///     "signature_hash_key": "modified",
///     "parallel_operation_amount": 4,
/// }))
/// .unwrap();
/// assert_eq!(config.conflict_handling, ConflictHandling::KeepLocal);
/// assert!(config.check_local_creation);
/// assert!(!config.check_local_attachment_creation);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Filter, sort and limit applied when enumerating candidates.
    pub query: QueryOptions,
    /// Field used as the document hash instead of a content hash.
    pub signature_hash_key: Option<String>,
    /// Push new local documents with `post` and adopt the remote id.
    pub use_remote_post: bool,
    /// Conflict resolution policy.
    pub conflict_handling: ConflictHandling,

    /// React to documents created locally.
    pub check_local_creation: bool,
    /// React to documents modified locally.
    pub check_local_modification: bool,
    /// React to documents deleted locally.
    pub check_local_deletion: bool,
    /// React to documents created remotely.
    pub check_remote_creation: bool,
    /// React to documents modified remotely.
    pub check_remote_modification: bool,
    /// React to documents deleted remotely.
    pub check_remote_deletion: bool,

    /// React to attachments created locally.
    pub check_local_attachment_creation: bool,
    /// React to attachments modified locally.
    pub check_local_attachment_modification: bool,
    /// React to attachments deleted locally.
    pub check_local_attachment_deletion: bool,
    /// React to attachments created remotely.
    pub check_remote_attachment_creation: bool,
    /// React to attachments modified remotely.
    pub check_remote_attachment_modification: bool,
    /// React to attachments deleted remotely.
    pub check_remote_attachment_deletion: bool,

    /// Maximum concurrent document tasks.
    pub parallel_operation_amount: usize,
    /// Maximum concurrent attachment tasks.
    pub parallel_operation_attachment_amount: usize,

    /// Local store, resolved through a registry.
    pub local_sub_storage: Option<StoreSpec>,
    /// Remote store, resolved through a registry.
    pub remote_sub_storage: Option<StoreSpec>,
    /// Signature store. Defaults to a reserved keyspace of the local store.
    pub signature_sub_storage: Option<StoreSpec>,
    /// Name separating this replication's signatures from others kept in
    /// the same local store.
    pub signature_namespace: Option<String>,

    /// Report verbosity.
    pub report_level: ReportLevel,
    /// Retry policy for transient store errors.
    #[serde(skip)]
    pub retry: RetryConfig,
}

impl ReplicationConfig {
    /// Creates a configuration with default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            query: QueryOptions::default(),
            signature_hash_key: None,
            use_remote_post: false,
            conflict_handling: ConflictHandling::Fail,
            check_local_creation: true,
            check_local_modification: true,
            check_local_deletion: true,
            check_remote_creation: true,
            check_remote_modification: true,
            check_remote_deletion: true,
            check_local_attachment_creation: false,
            check_local_attachment_modification: false,
            check_local_attachment_deletion: false,
            check_remote_attachment_creation: false,
            check_remote_attachment_modification: false,
            check_remote_attachment_deletion: false,
            parallel_operation_amount: 1,
            parallel_operation_attachment_amount: 1,
            local_sub_storage: None,
            remote_sub_storage: None,
            signature_sub_storage: None,
            signature_namespace: None,
            report_level: ReportLevel::Changes,
            retry: RetryConfig::default(),
        }
    }

    /// Parses and validates a JSON options object.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for unknown policy codes, mistyped options or
    /// values rejected by [`ReplicationConfig::validate`].
    pub fn from_json(options: serde_json::Value) -> ReplicationResult<Self> {
        let config: Self = serde_json::from_value(options)
            .map_err(|e| ReplicationError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks option values.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first invalid option.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.parallel_operation_amount == 0 {
            return Err(ReplicationError::configuration(
                "parallel_operation_amount must be at least 1",
            ));
        }
        if self.parallel_operation_attachment_amount == 0 {
            return Err(ReplicationError::configuration(
                "parallel_operation_attachment_amount must be at least 1",
            ));
        }
        if matches!(self.signature_hash_key.as_deref(), Some("")) {
            return Err(ReplicationError::configuration(
                "signature_hash_key must not be empty",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ReplicationError::configuration(
                "retry.max_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Sets the enumeration query.
    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }

    /// Hashes documents by a single field.
    pub fn with_signature_hash_key(mut self, key: impl Into<String>) -> Self {
        self.signature_hash_key = Some(key.into());
        self
    }

    /// Enables or disables remote post for new local documents.
    pub fn with_remote_post(mut self, enabled: bool) -> Self {
        self.use_remote_post = enabled;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_handling(mut self, handling: ConflictHandling) -> Self {
        self.conflict_handling = handling;
        self
    }

    /// Sets the document-level change switches.
    pub fn with_document_checks(mut self, local: ChangeChecks, remote: ChangeChecks) -> Self {
        self.check_local_creation = local.creation;
        self.check_local_modification = local.modification;
        self.check_local_deletion = local.deletion;
        self.check_remote_creation = remote.creation;
        self.check_remote_modification = remote.modification;
        self.check_remote_deletion = remote.deletion;
        self
    }

    /// Sets the attachment-level change switches.
    pub fn with_attachment_checks(mut self, local: ChangeChecks, remote: ChangeChecks) -> Self {
        self.check_local_attachment_creation = local.creation;
        self.check_local_attachment_modification = local.modification;
        self.check_local_attachment_deletion = local.deletion;
        self.check_remote_attachment_creation = remote.creation;
        self.check_remote_attachment_modification = remote.modification;
        self.check_remote_attachment_deletion = remote.deletion;
        self
    }

    /// Sets both concurrency caps.
    pub fn with_parallelism(mut self, documents: usize, attachments: usize) -> Self {
        self.parallel_operation_amount = documents;
        self.parallel_operation_attachment_amount = attachments;
        self
    }

    /// Sets the store specs.
    pub fn with_stores(mut self, local: StoreSpec, remote: StoreSpec) -> Self {
        self.local_sub_storage = Some(local);
        self.remote_sub_storage = Some(remote);
        self
    }

    /// Sets the signature store spec.
    pub fn with_signature_storage(mut self, spec: StoreSpec) -> Self {
        self.signature_sub_storage = Some(spec);
        self
    }

    /// Names the keyspace holding this replication's signatures.
    ///
    /// Needed when stores are passed directly and signatures must survive
    /// the process, since without a remote spec the keyspace is otherwise
    /// tied to the remote store instance.
    pub fn with_signature_namespace(mut self, name: impl Into<String>) -> Self {
        self.signature_namespace = Some(name.into());
        self
    }

    /// Sets the report verbosity.
    pub fn with_report_level(mut self, level: ReportLevel) -> Self {
        self.report_level = level;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the decision policy for documents.
    #[must_use]
    pub fn document_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            local: ChangeChecks {
                creation: self.check_local_creation,
                modification: self.check_local_modification,
                deletion: self.check_local_deletion,
            },
            remote: ChangeChecks {
                creation: self.check_remote_creation,
                modification: self.check_remote_modification,
                deletion: self.check_remote_deletion,
            },
            conflict: self.conflict_handling,
        }
    }

    /// Returns the decision policy for attachments.
    #[must_use]
    pub fn attachment_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            local: ChangeChecks {
                creation: self.check_local_attachment_creation,
                modification: self.check_local_attachment_modification,
                deletion: self.check_local_attachment_deletion,
            },
            remote: ChangeChecks {
                creation: self.check_remote_attachment_creation,
                modification: self.check_remote_attachment_modification,
                deletion: self.check_remote_attachment_deletion,
            },
            conflict: self.conflict_handling,
        }
    }

    /// Returns true if any attachment switch is on.
    #[must_use]
    pub fn syncs_attachments(&self) -> bool {
        let policy = self.attachment_policy();
        policy.local.any() || policy.remote.any()
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff for store calls that fail with a retryable error.
///
/// Delays grow geometrically from `initial_delay` up to `max_delay`, plus up
/// to a quarter of random jitter unless disabled.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts per store call, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive retries.
    pub backoff_multiplier: f64,
    /// Whether to randomize delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Allows `max_attempts` attempts per store call with default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the growth factor between consecutive retries.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Makes delays exact.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Returns the delay before retry number `retry`, counting from 1.
    /// Attempt 0 is the first call and is never delayed.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let Some(exponent) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let capped = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        let jitter = if self.add_jitter {
            capped * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
