//! A store wrapper that records calls and injects failures.
//!
//! Wrap any [`SharedStore`] to count calls per operation, simulate latency,
//! measure how many calls overlap, and make chosen calls fail.

use async_trait::async_trait;
use docsync_store::{
    AttachmentMeta, Blob, Capabilities, Document, DocumentStore, QueryOptions, QueryRow,
    SharedStore, StoreError, StoreResult,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `get`
    Get,
    /// `put`
    Put,
    /// `post`
    Post,
    /// `remove`
    Remove,
    /// `get_attachment`
    GetAttachment,
    /// `put_attachment`
    PutAttachment,
    /// `remove_attachment`
    RemoveAttachment,
    /// `all_attachments`
    AllAttachments,
    /// `build_query`
    BuildQuery,
    /// `bulk_get`
    BulkGet,
    /// `repair`
    Repair,
}

impl Op {
    /// Operations that write to the store.
    pub const WRITES: [Op; 5] = [
        Op::Put,
        Op::Post,
        Op::Remove,
        Op::PutAttachment,
        Op::RemoveAttachment,
    ];
}

/// The error an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// `Unavailable` with `retryable = true`.
    Transient,
    /// `Unavailable` with `retryable = false`.
    Fatal,
    /// `Conflict`.
    Conflict,
}

impl FaultKind {
    fn error(self, op: Op, id: &str) -> StoreError {
        match self {
            FaultKind::Transient => {
                StoreError::unavailable_retryable(format!("injected transient {op:?} failure"))
            }
            FaultKind::Fatal => {
                StoreError::unavailable_fatal(format!("injected {op:?} failure"))
            }
            FaultKind::Conflict => StoreError::Conflict { id: id.to_string() },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    kind: FaultKind,
    /// Remaining failures; `None` fails forever.
    remaining: Option<usize>,
}

/// Records every call made to the wrapped store.
pub struct InstrumentedStore {
    inner: SharedStore,
    capabilities: Option<Capabilities>,
    latency: Duration,
    calls: Mutex<Vec<(Op, Option<String>)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    faults: Mutex<HashMap<(Op, Option<String>), Fault>>,
}

impl InstrumentedStore {
    /// Wraps a store.
    pub fn new(inner: SharedStore) -> Self {
        Self {
            inner,
            capabilities: None,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Advertises different capabilities than the wrapped store.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Delays every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Wraps the store into an `Arc`.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &SharedStore {
        &self.inner
    }

    /// Counts calls of an operation.
    pub fn count(&self, op: Op) -> usize {
        self.calls.lock().iter().filter(|(o, _)| *o == op).count()
    }

    /// Counts calls of an operation on one id.
    pub fn count_for(&self, op: Op, id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(o, i)| *o == op && i.as_deref() == Some(id))
            .count()
    }

    /// Counts calls of every write operation.
    pub fn writes(&self) -> usize {
        Op::WRITES.iter().map(|op| self.count(*op)).sum()
    }

    /// Returns every recorded call in order.
    pub fn calls(&self) -> Vec<(Op, Option<String>)> {
        self.calls.lock().clone()
    }

    /// Forgets recorded calls and the in-flight peak.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    /// Returns the highest number of overlapping calls seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Makes every call of `op` fail. With an id, only calls on that id fail;
    /// for [`Op::BulkGet`] that is the id's entry in the response.
    pub fn fail(&self, op: Op, id: Option<&str>, kind: FaultKind) {
        self.faults.lock().insert(
            (op, id.map(str::to_string)),
            Fault {
                kind,
                remaining: None,
            },
        );
    }

    /// Makes the next `times` calls of `op` fail.
    pub fn fail_times(&self, op: Op, id: Option<&str>, kind: FaultKind, times: usize) {
        self.faults.lock().insert(
            (op, id.map(str::to_string)),
            Fault {
                kind,
                remaining: Some(times),
            },
        );
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn take_fault(&self, op: Op, id: Option<&str>) -> StoreResult<()> {
        let keys = [(op, id.map(str::to_string)), (op, None)];
        for key in keys {
            if let Some(kind) = self.take_key(&key) {
                return Err(kind.error(op, id.unwrap_or_default()));
            }
        }
        Ok(())
    }

    fn take_key(&self, key: &(Op, Option<String>)) -> Option<FaultKind> {
        let mut faults = self.faults.lock();
        let fault = faults.get_mut(key)?;
        if fault.remaining == Some(0) {
            faults.remove(key);
            return None;
        }
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.kind)
    }

    async fn enter(&self, op: Op, id: Option<&str>) -> StoreResult<InFlight<'_>> {
        self.calls.lock().push((op, id.map(str::to_string)));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight { store: self };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.take_fault(op, id)?;
        Ok(guard)
    }
}

struct InFlight<'a> {
    store: &'a InstrumentedStore,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for InstrumentedStore {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
            .unwrap_or_else(|| self.inner.capabilities())
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        let _call = self.enter(Op::Get, Some(id)).await?;
        self.inner.get(id).await
    }

    async fn put(&self, id: &str, doc: Document) -> StoreResult<()> {
        let _call = self.enter(Op::Put, Some(id)).await?;
        self.inner.put(id, doc).await
    }

    async fn post(&self, doc: Document) -> StoreResult<String> {
        let _call = self.enter(Op::Post, None).await?;
        self.inner.post(doc).await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        let _call = self.enter(Op::Remove, Some(id)).await?;
        self.inner.remove(id).await
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Blob> {
        let _call = self.enter(Op::GetAttachment, Some(id)).await?;
        self.inner.get_attachment(id, name).await
    }

    async fn put_attachment(&self, id: &str, name: &str, blob: Blob) -> StoreResult<()> {
        let _call = self.enter(Op::PutAttachment, Some(id)).await?;
        self.inner.put_attachment(id, name, blob).await
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StoreResult<()> {
        let _call = self.enter(Op::RemoveAttachment, Some(id)).await?;
        self.inner.remove_attachment(id, name).await
    }

    async fn all_attachments(&self, id: &str) -> StoreResult<BTreeMap<String, AttachmentMeta>> {
        let _call = self.enter(Op::AllAttachments, Some(id)).await?;
        self.inner.all_attachments(id).await
    }

    async fn build_query(&self, options: &QueryOptions) -> StoreResult<Vec<QueryRow>> {
        let _call = self.enter(Op::BuildQuery, None).await?;
        self.inner.build_query(options).await
    }

    /// A fault on `(Op::BulkGet, Some(id))` fails only that entry of the
    /// response; the call itself succeeds.
    async fn bulk_get(&self, ids: &[String]) -> StoreResult<Vec<StoreResult<Document>>> {
        let _call = self.enter(Op::BulkGet, None).await?;
        let results = self.inner.bulk_get(ids).await?;
        Ok(ids
            .iter()
            .zip(results)
            .map(|(id, result)| match self.take_key(&(Op::BulkGet, Some(id.clone()))) {
                Some(kind) => Err(kind.error(Op::BulkGet, id)),
                None => result,
            })
            .collect())
    }

    async fn repair(&self) -> StoreResult<()> {
        let _call = self.enter(Op::Repair, None).await?;
        self.inner.repair().await
    }
}

impl std::fmt::Debug for InstrumentedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedStore")
            .field("capabilities", &self.capabilities())
            .field("latency", &self.latency)
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}
