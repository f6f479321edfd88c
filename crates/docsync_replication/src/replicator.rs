//! The replication driver.
//!
//! A pass runs `ENUMERATE → DIFF → DISPATCH → SETTLE`:
//!
//! 1. list candidate ids from both stores and the signature store
//! 2. read the current hash of each candidate on each side
//! 3. decide and execute per id, at most `parallel_operation_amount` at a
//!    time
//! 4. fold document outcomes into a report, then reconcile attachments of
//!    settled ids, at most `parallel_operation_attachment_amount` at a time
//!
//! Every task writes its own signature right after its store mutation
//! succeeded, so a failed or abandoned task leaves its id exactly as
//! unprocessed and the next pass retries it.

mod attachments;

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::hash::DocumentHasher;
use crate::report::{FailedId, FailureReason, LogKind, PassMode, ReplicationReport, ReportEntry};
use crate::resolver::{decide, ChangeKind, Decision, DecisionPolicy, SkippedChange, Side};
use crate::signature::{
    namespace_scope, signature_namespace, SignatureRecord, SignatureStore, SIGNATURE_PREFIX,
};
use crate::state::{ReplicationState, ReplicationStats};
use docsync_store::{
    run_query, AttachmentMeta, Capability, Document, KeyspaceStore, QueryOptions, QueryRow,
    SharedStore, StoreError, StoreRegistry, StoreResult, StoreSpec,
};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Why a per-id task stopped early.
pub(crate) enum TaskError {
    Cancelled,
    Store(StoreError),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        TaskError::Store(err)
    }
}

type TaskResult<T> = Result<T, TaskError>;

/// Candidate ids and what enumeration and prefetching learned about them.
struct Snapshot {
    candidates: BTreeSet<String>,
    local: SideSnapshot,
    remote: SideSnapshot,
}

struct SideSnapshot {
    rows: HashMap<String, QueryRow>,
    /// Bodies fetched in bulk. When set, a listed id missing here vanished
    /// after enumeration.
    docs: Option<HashMap<String, Document>>,
    /// Ids whose entry in the bulk response was an error. They are read one
    /// by one so the failure stays with the id.
    unread: HashSet<String>,
}

/// Current state of one side for one id.
struct Present {
    hash: String,
    doc: Option<Document>,
}

#[derive(Default)]
struct DocumentOutcome {
    entries: Vec<ReportEntry>,
    failure: Option<FailedId>,
    /// Id whose attachments should be reconciled after the document phase.
    attachment_target: Option<String>,
    abandoned: bool,
}

impl DocumentOutcome {
    fn log(&mut self, id: &str, kind: LogKind) {
        self.entries.push(ReportEntry {
            id: id.to_string(),
            attachment: None,
            kind,
        });
    }
}

/// Replicates documents and attachments between a local and a remote store.
///
/// # Example
///
/// ```rust
/// use docsync_replication::{ReplicationConfig, Replicator};
/// use docsync_store::{DocumentStore, MemoryStore, SharedStore};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let local: SharedStore = Arc::new(MemoryStore::new());
/// let remote: SharedStore = Arc::new(MemoryStore::new());
/// let doc = json!({"title": "foo"}).as_object().cloned().unwrap();
/// remote.put("a", doc.clone()).await.unwrap();
///
/// let replicator = Replicator::new(ReplicationConfig::new(), local.clone(), remote).unwrap();
/// replicator.repair().await.unwrap();
/// assert_eq!(local.get("a").await.unwrap(), doc);
/// # });
/// ```
pub struct Replicator {
    config: ReplicationConfig,
    local: SharedStore,
    remote: SharedStore,
    signatures: SignatureStore,
    reserved_prefix: Option<String>,
    hasher: DocumentHasher,
    document_policy: DecisionPolicy,
    attachment_policy: DecisionPolicy,
    state: RwLock<ReplicationState>,
    stats: RwLock<ReplicationStats>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl Replicator {
    /// Creates a replicator keeping signatures in a reserved keyspace of the
    /// local store.
    ///
    /// The keyspace is derived from the store specs, the query and
    /// `signature_namespace`. Without a remote spec or a namespace it is tied
    /// to the `remote` instance, so replicators sharing a local store never
    /// read each other's signatures, but a new process starts unsynced.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the options are invalid.
    pub fn new(
        config: ReplicationConfig,
        local: SharedStore,
        remote: SharedStore,
    ) -> ReplicationResult<Self> {
        let instance = format!("{:x}", Arc::as_ptr(&remote) as *const () as usize);
        let namespace = signature_namespace(&namespace_scope(&config, &instance));
        let signatures: SharedStore = Arc::new(KeyspaceStore::new(local.clone(), namespace.clone()));
        Self::build(config, local, remote, signatures, Some(namespace))
    }

    /// Creates a replicator with a dedicated signature store.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the options are invalid.
    pub fn with_signature_store(
        config: ReplicationConfig,
        local: SharedStore,
        remote: SharedStore,
        signatures: SharedStore,
    ) -> ReplicationResult<Self> {
        Self::build(config, local, remote, signatures, None)
    }

    /// Creates a replicator whose stores are described by the
    /// `*_sub_storage` options.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a required spec is missing, names an
    /// unknown store type, or the options are otherwise invalid.
    pub fn from_config(config: ReplicationConfig, registry: &StoreRegistry) -> ReplicationResult<Self> {
        config.validate()?;
        let create = |spec: Option<&StoreSpec>, option: &str| -> ReplicationResult<SharedStore> {
            let spec = spec
                .ok_or_else(|| ReplicationError::configuration(format!("{option} is required")))?;
            registry
                .create(spec)
                .map_err(|e| ReplicationError::configuration(format!("{option}: {e}")))
        };
        let local = create(config.local_sub_storage.as_ref(), "local_sub_storage")?;
        let remote = create(config.remote_sub_storage.as_ref(), "remote_sub_storage")?;
        let signature_spec = config.signature_sub_storage.clone();
        match signature_spec {
            Some(spec) => {
                let signatures = create(Some(&spec), "signature_sub_storage")?;
                Self::with_signature_store(config, local, remote, signatures)
            }
            None => Self::new(config, local, remote),
        }
    }

    fn build(
        config: ReplicationConfig,
        local: SharedStore,
        remote: SharedStore,
        signatures: SharedStore,
        reserved_prefix: Option<String>,
    ) -> ReplicationResult<Self> {
        config.validate()?;
        Ok(Self {
            hasher: DocumentHasher::new(config.signature_hash_key.clone()),
            document_policy: config.document_policy(),
            attachment_policy: config.attachment_policy(),
            config,
            local,
            remote,
            signatures: SignatureStore::new(signatures),
            reserved_prefix,
            state: RwLock::new(ReplicationState::Idle),
            stats: RwLock::new(ReplicationStats::default()),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Gets the configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Gets the current state.
    pub fn state(&self) -> ReplicationState {
        *self.state.read()
    }

    /// Gets the cumulative stats.
    pub fn stats(&self) -> ReplicationStats {
        self.stats.read().clone()
    }

    /// Gets the local store.
    pub fn local(&self) -> &SharedStore {
        &self.local
    }

    /// Gets the remote store.
    pub fn remote(&self) -> &SharedStore {
        &self.remote
    }

    /// Gets the signature store.
    pub fn signatures(&self) -> &SignatureStore {
        &self.signatures
    }

    /// Gets the local id prefix holding signatures, when they live in the
    /// local store.
    pub fn signature_namespace(&self) -> Option<&str> {
        self.reserved_prefix.as_deref()
    }

    /// Cancels the running pass.
    ///
    /// Tasks that have not settled yet stop before their next store call and
    /// leave their signature untouched. The pass returns `Cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> TaskResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn ensure_not_cancelled(&self) -> ReplicationResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(ReplicationError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: ReplicationState) {
        *self.state.write() = state;
    }

    fn store(&self, side: Side) -> &SharedStore {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    /// Runs one pass, executing decisions and settling signatures.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if another pass of this replicator is in flight
    /// - `Store` if enumeration fails
    /// - `Cancelled` if [`Replicator::cancel`] was called during the pass
    /// - `Incomplete` if some ids failed; all other ids are settled
    pub async fn repair(&self) -> ReplicationResult<ReplicationReport> {
        self.run(PassMode::Repair).await
    }

    /// Runs one read-only pass and reports what `repair()` would do.
    ///
    /// # Errors
    ///
    /// Same as [`Replicator::repair`]; unresolved conflicts make the pass
    /// `Incomplete`.
    pub async fn check(&self) -> ReplicationResult<ReplicationReport> {
        self.run(PassMode::Check).await
    }

    #[instrument(name = "replication_pass", skip(self))]
    async fn run(&self, mode: PassMode) -> ReplicationResult<ReplicationReport> {
        let _guard = PassGuard::acquire(self)?;
        self.reset_cancel();

        let started = Instant::now();
        let mut report = ReplicationReport::new(mode);
        let result = self.run_pass(mode, &mut report).await;
        report.duration = started.elapsed();

        if let Err(e) = result {
            warn!(error = %e, "replication pass aborted");
            self.set_state(ReplicationState::Failed);
            let mut stats = self.stats.write();
            stats.passes_failed += 1;
            stats.last_error = Some(e.to_string());
            return Err(e);
        }

        self.stats.write().absorb(&report);
        report.finish(self.config.report_level);

        if report.is_complete() {
            info!(
                candidates = report.candidates,
                entries = report.entries.len(),
                duration_ms = report.duration.as_millis() as u64,
                "replication pass converged"
            );
            self.set_state(ReplicationState::Completed);
            let mut stats = self.stats.write();
            stats.passes_completed += 1;
            stats.last_error = None;
            Ok(report)
        } else {
            let err = ReplicationError::Incomplete {
                report: Box::new(report),
            };
            warn!(error = %err, "replication pass incomplete");
            self.set_state(ReplicationState::Failed);
            let mut stats = self.stats.write();
            stats.passes_failed += 1;
            stats.last_error = Some(err.to_string());
            Err(err)
        }
    }

    async fn run_pass(&self, mode: PassMode, report: &mut ReplicationReport) -> ReplicationResult<()> {
        self.set_state(ReplicationState::Enumerating);
        let (candidates, local_rows, remote_rows) = self.enumerate().await?;
        report.candidates = candidates.len();
        self.ensure_not_cancelled()?;

        self.set_state(ReplicationState::Diffing);
        let snapshot = Snapshot {
            candidates,
            local: self.prefetch(Side::Local, local_rows).await?,
            remote: self.prefetch(Side::Remote, remote_rows).await?,
        };
        self.ensure_not_cancelled()?;

        self.set_state(ReplicationState::Dispatching);
        let outcomes: Vec<DocumentOutcome> = stream::iter(snapshot.candidates.iter().cloned())
            .map(|id| self.reconcile_document(id, mode, &snapshot))
            .buffer_unordered(self.config.parallel_operation_amount)
            .collect()
            .await;

        self.set_state(ReplicationState::Settling);
        let mut attachment_targets = Vec::new();
        let mut abandoned = false;
        for outcome in outcomes {
            abandoned |= outcome.abandoned;
            report.entries.extend(outcome.entries);
            report.failures.extend(outcome.failure);
            attachment_targets.extend(outcome.attachment_target);
        }
        if abandoned {
            return Err(ReplicationError::Cancelled);
        }
        self.ensure_not_cancelled()?;

        if self.config.syncs_attachments() && !attachment_targets.is_empty() {
            let outcomes: Vec<_> = stream::iter(attachment_targets)
                .map(|id| self.reconcile_attachments(id, mode))
                .buffer_unordered(self.config.parallel_operation_attachment_amount)
                .collect()
                .await;
            let mut abandoned = false;
            for outcome in outcomes {
                abandoned |= outcome.abandoned;
                report.entries.extend(outcome.entries);
                report.failures.extend(outcome.failures);
            }
            if abandoned {
                return Err(ReplicationError::Cancelled);
            }
            self.ensure_not_cancelled()?;
        }
        Ok(())
    }

    fn enumeration_query(&self) -> QueryOptions {
        let query = self.config.query.clone();
        match self.hasher.key() {
            Some(key) => query.with_select(key),
            None => query,
        }
    }

    /// Signature keyspaces of any replication are never replicated.
    fn is_reserved(id: &str) -> bool {
        id.starts_with(SIGNATURE_PREFIX)
    }

    async fn enumerate(
        &self,
    ) -> ReplicationResult<(BTreeSet<String>, HashMap<String, QueryRow>, HashMap<String, QueryRow>)>
    {
        self.local.repair().await?;
        self.remote.repair().await?;
        self.signatures.store().repair().await?;

        let options = self.enumeration_query();
        let (local_rows, remote_rows, signed) = futures::try_join!(
            self.retrying("build_query", || run_query(self.local.as_ref(), &options)),
            self.retrying("build_query", || run_query(self.remote.as_ref(), &options)),
            self.signatures.ids(),
        )?;

        let index = |rows: Vec<QueryRow>| -> HashMap<String, QueryRow> {
            rows.into_iter()
                .filter(|row| !Self::is_reserved(&row.id))
                .map(|row| (row.id.clone(), row))
                .collect()
        };
        let local = index(local_rows);
        let remote = index(remote_rows);

        let candidates: BTreeSet<String> = local
            .keys()
            .chain(remote.keys())
            .cloned()
            .chain(signed)
            .collect();
        debug!(
            local = local.len(),
            remote = remote.len(),
            candidates = candidates.len(),
            "enumerated candidates"
        );
        Ok((candidates, local, remote))
    }

    /// Fetches every listed body in one call when hashing needs content and
    /// the store supports bulk reads.
    async fn prefetch(
        &self,
        side: Side,
        rows: HashMap<String, QueryRow>,
    ) -> ReplicationResult<SideSnapshot> {
        let store = self.store(side);
        let needs_bodies = self.hasher.key().is_none() && rows.values().any(|row| row.doc.is_none());
        if !needs_bodies || !store.capabilities().contains(Capability::BulkGet) {
            return Ok(SideSnapshot {
                rows,
                docs: None,
                unread: HashSet::new(),
            });
        }

        let ids: Vec<String> = rows.keys().cloned().collect();
        let fetched = self.retrying("bulk_get", || store.bulk_get(&ids)).await?;
        let mut docs = HashMap::with_capacity(ids.len());
        let mut unread = HashSet::new();
        for (id, result) in ids.into_iter().zip(fetched) {
            match result {
                Ok(doc) => {
                    docs.insert(id, doc);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    debug!(?side, id = %id, error = %e, "bulk entry failed");
                    unread.insert(id);
                }
            }
        }
        debug!(
            ?side,
            fetched = docs.len(),
            unread = unread.len(),
            "prefetched documents"
        );
        Ok(SideSnapshot {
            rows,
            docs: Some(docs),
            unread,
        })
    }

    /// Reads the hash of one id on one side.
    ///
    /// Ids missing from the listing are only read when the signature says
    /// the side had them, so a document that left the query is not mistaken
    /// for a deletion.
    async fn observe(
        &self,
        side: Side,
        id: &str,
        snapshot: &SideSnapshot,
        seen_before: bool,
    ) -> TaskResult<Option<Present>> {
        match snapshot.rows.get(id) {
            Some(row) => {
                if let Some(hash) = self.hasher.hash_row(row) {
                    return Ok(Some(Present {
                        hash,
                        doc: row.doc.clone(),
                    }));
                }
                match &snapshot.docs {
                    Some(_) if snapshot.unread.contains(id) => {}
                    Some(docs) => {
                        return Ok(docs.get(id).map(|doc| Present {
                            hash: self.hasher.hash_document(doc),
                            doc: Some(doc.clone()),
                        }));
                    }
                    None => {}
                }
            }
            None if !seen_before => return Ok(None),
            None => {}
        }

        let store = self.store(side);
        match self.retrying("get", || store.get(id)).await {
            Ok(doc) => Ok(Some(Present {
                hash: self.hasher.hash_document(&doc),
                doc: Some(doc),
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile_document(&self, id: String, mode: PassMode, snapshot: &Snapshot) -> DocumentOutcome {
        let mut outcome = DocumentOutcome::default();
        if let Err(err) = self
            .reconcile_document_inner(&id, mode, snapshot, &mut outcome)
            .await
        {
            outcome.attachment_target = None;
            match err {
                TaskError::Cancelled => {
                    debug!(id = %id, "document task abandoned");
                    outcome.abandoned = true;
                }
                TaskError::Store(e) => {
                    warn!(id = %id, error = %e, "document replication failed");
                    outcome.failure = Some(FailedId {
                        id,
                        attachment: None,
                        reason: FailureReason::from(&e),
                    });
                }
            }
        }
        outcome
    }

    async fn reconcile_document_inner(
        &self,
        id: &str,
        mode: PassMode,
        snapshot: &Snapshot,
        outcome: &mut DocumentOutcome,
    ) -> TaskResult<()> {
        self.check_cancelled()?;
        let record = self.signatures.load(id).await?;
        let baseline = record.as_ref().map(SignatureRecord::baseline);

        let local = self
            .observe(
                Side::Local,
                id,
                &snapshot.local,
                baseline.is_some_and(|b| b.local.is_some()),
            )
            .await?;
        let remote = self
            .observe(
                Side::Remote,
                id,
                &snapshot.remote,
                baseline.is_some_and(|b| b.remote.is_some()),
            )
            .await?;

        let decision = decide(
            local.as_ref().map(|p| p.hash.as_str()),
            remote.as_ref().map(|p| p.hash.as_str()),
            baseline,
            &self.document_policy,
        );
        debug!(id, ?decision, "document decision");

        let kind = self.log_kind(decision);
        outcome.log(id, kind);
        if decision == Decision::Conflict {
            outcome.failure = Some(FailedId {
                id: id.to_string(),
                attachment: None,
                reason: FailureReason::Conflict,
            });
            return Ok(());
        }

        if mode == PassMode::Check {
            let both_present = local.is_some() && remote.is_some();
            let deferred = decision == Decision::Deferred && record.is_none();
            if both_present && !deferred {
                outcome.attachment_target = Some(id.to_string());
            }
            return Ok(());
        }

        self.execute_document(id, decision, local, remote, record, outcome)
            .await
    }

    fn log_kind(&self, decision: Decision) -> LogKind {
        match decision {
            Decision::Push {
                create: true,
                forced: false,
            } if self.config.use_remote_post => LogKind::PostRemote,
            other => LogKind::from(&other),
        }
    }

    async fn execute_document(
        &self,
        id: &str,
        decision: Decision,
        local: Option<Present>,
        remote: Option<Present>,
        record: Option<SignatureRecord>,
        outcome: &mut DocumentOutcome,
    ) -> TaskResult<()> {
        // A created copy has none of the attachments the old record lists.
        let record = match decision {
            Decision::Push { create: true, .. } | Decision::Pull { create: true, .. } => None,
            _ => record,
        };
        match decision {
            Decision::NoOp => {
                if local.is_some() && remote.is_some() {
                    outcome.attachment_target = Some(id.to_string());
                }
            }
            Decision::Record => {
                let source = expect_present(Side::Local, id, local)?;
                self.settle(id, record, &source.hash).await?;
                outcome.attachment_target = Some(id.to_string());
            }
            Decision::Forget => {
                self.check_cancelled()?;
                self.signatures.remove(id).await?;
            }
            Decision::Push { create, forced } => {
                let source = expect_present(Side::Local, id, local)?;
                let doc = self.fetch_body(Side::Local, id, source.doc).await?;
                self.check_cancelled()?;
                if create && !forced && self.config.use_remote_post {
                    let new_id = self.post_remote(id, doc, &source.hash).await?;
                    outcome.attachment_target = Some(new_id);
                } else {
                    self.retrying("put", || self.remote.put(id, doc.clone()))
                        .await?;
                    self.settle(id, record, &source.hash).await?;
                    outcome.attachment_target = Some(id.to_string());
                }
            }
            Decision::Pull { .. } => {
                let source = expect_present(Side::Remote, id, remote)?;
                let doc = self.fetch_body(Side::Remote, id, source.doc).await?;
                self.check_cancelled()?;
                self.retrying("put", || self.local.put(id, doc.clone()))
                    .await?;
                self.settle(id, record, &source.hash).await?;
                outcome.attachment_target = Some(id.to_string());
            }
            Decision::DeleteLocal | Decision::DeleteRemote => {
                let (side, deleted_on) = if decision == Decision::DeleteLocal {
                    (Side::Local, Side::Remote)
                } else {
                    (Side::Remote, Side::Local)
                };
                self.check_cancelled()?;
                if !self.list_attachments(side, id).await?.is_empty() {
                    // Attachments go first; the document follows once none remain.
                    debug!(id, ?side, "deletion held back by attachments");
                    outcome.entries.pop();
                    outcome.log(
                        id,
                        LogKind::from(&Decision::Skip(SkippedChange {
                            side: deleted_on,
                            kind: ChangeKind::Deletion,
                        })),
                    );
                    outcome.attachment_target = Some(id.to_string());
                    return Ok(());
                }
                self.remove_document(side, id).await?;
                self.check_cancelled()?;
                self.signatures.remove(id).await?;
            }
            Decision::Deferred | Decision::Skip(_) => {
                if local.is_some() && remote.is_some() && record.is_some() {
                    outcome.attachment_target = Some(id.to_string());
                }
            }
            Decision::Conflict => {}
        }
        Ok(())
    }

    async fn fetch_body(&self, side: Side, id: &str, cached: Option<Document>) -> TaskResult<Document> {
        match cached {
            Some(doc) => Ok(doc),
            None => {
                let store = self.store(side);
                Ok(self.retrying("get", || store.get(id)).await?)
            }
        }
    }

    async fn settle(&self, id: &str, record: Option<SignatureRecord>, hash: &str) -> TaskResult<()> {
        self.check_cancelled()?;
        let mut record = record.unwrap_or_else(|| SignatureRecord::new(id));
        record.set_document(hash);
        self.signatures.save(&record).await?;
        Ok(())
    }

    /// Creates the document remotely under a generated id and moves the
    /// local copy, its attachments and its signature to that id.
    async fn post_remote(&self, id: &str, doc: Document, hash: &str) -> TaskResult<String> {
        let new_id = self.retrying("post", || self.remote.post(doc.clone())).await?;
        debug!(id, new_id = %new_id, "remote assigned id");

        self.retrying("put", || self.local.put(&new_id, doc.clone()))
            .await?;
        let attachments = self.list_attachments(Side::Local, id).await?;
        for name in attachments.keys() {
            let blob = self
                .retrying("get_attachment", || self.local.get_attachment(id, name))
                .await?;
            self.retrying("put_attachment", || {
                self.local.put_attachment(&new_id, name, blob.clone())
            })
            .await?;
        }
        self.remove_document(Side::Local, id).await?;
        self.signatures.remove(id).await?;
        self.signatures
            .save(&SignatureRecord::agreed(new_id.clone(), hash))
            .await?;
        Ok(new_id)
    }

    async fn remove_document(&self, side: Side, id: &str) -> StoreResult<()> {
        let store = self.store(side);
        match self.retrying("remove", || store.remove(id)).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn list_attachments(
        &self,
        side: Side,
        id: &str,
    ) -> StoreResult<BTreeMap<String, AttachmentMeta>> {
        let store = self.store(side);
        match self.retrying("all_attachments", || store.all_attachments(id)).await {
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            other => other,
        }
    }

    /// Calls a store operation, retrying transient failures with backoff.
    async fn retrying<T, F, Fut>(&self, operation: &'static str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(operation, attempt, error = %e, ?delay, "retrying store operation");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

fn expect_present(side: Side, id: &str, present: Option<Present>) -> TaskResult<Present> {
    present.ok_or_else(|| {
        TaskError::Store(StoreError::Internal(format!(
            "{side:?} copy of {id} vanished during reconciliation"
        )))
    })
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("state", &self.state())
            .field("reserved_prefix", &self.reserved_prefix)
            .finish_non_exhaustive()
    }
}

/// Marks a pass as running for as long as it is alive.
///
/// Dropping the pass future mid-way releases the replicator and marks the
/// pass failed.
struct PassGuard<'a> {
    replicator: &'a Replicator,
}

impl<'a> PassGuard<'a> {
    fn acquire(replicator: &'a Replicator) -> ReplicationResult<Self> {
        replicator
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ReplicationError::AlreadyRunning)?;
        Ok(Self { replicator })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.replicator.state.write();
            if state.is_active() {
                *state = ReplicationState::Failed;
            }
        }
        self.replicator.running.store(false, Ordering::SeqCst);
    }
}
