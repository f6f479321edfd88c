//! In-memory document store.

use crate::document::{AttachmentMeta, Blob, Document};
use crate::error::{StoreError, StoreResult};
use crate::query::{apply, QueryOptions, QueryRow};
use crate::store::{Capabilities, DocumentStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Entry {
    doc: Document,
    attachments: BTreeMap<String, Blob>,
}

/// An in-memory document store.
///
/// Implements every [`Capability`](crate::Capability) natively, including
/// attachment digests. Suitable for tests and as the reference store for
/// replication.
///
/// # Thread Safety
///
/// The store is thread-safe and can be shared across tasks behind an `Arc`.
///
/// # Example
///
/// ```rust
/// use docsync_store::{DocumentStore, MemoryStore};
/// use serde_json::json;
///
/// # tokio_test_block(async {
/// let store = MemoryStore::new();
/// let doc = json!({"title": "foo"}).as_object().cloned().unwrap();
/// store.put("a", doc.clone()).await.unwrap();
/// assert_eq!(store.get("a").await.unwrap(), doc);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store preloaded with documents.
    pub fn with_documents<I, S>(docs: I) -> Self
    where
        I: IntoIterator<Item = (S, Document)>,
        S: Into<String>,
    {
        let entries = docs
            .into_iter()
            .map(|(id, doc)| {
                (
                    id.into(),
                    Entry {
                        doc,
                        attachments: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Returns the number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns every document id in order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Returns a copy of every document, keyed by id.
    ///
    /// Useful for comparing both sides after a pass.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Document> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.doc.clone()))
            .collect()
    }

    /// Returns a copy of every attachment of a document.
    #[must_use]
    pub fn attachments_of(&self, id: &str) -> BTreeMap<String, Blob> {
        self.entries
            .read()
            .get(id)
            .map(|entry| entry.attachments.clone())
            .unwrap_or_default()
    }

    /// Removes every document.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        self.entries
            .read()
            .get(id)
            .map(|entry| entry.doc.clone())
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn put(&self, id: &str, doc: Document) -> StoreResult<()> {
        if id.is_empty() {
            return Err(StoreError::InvalidInput("document id is empty".into()));
        }
        self.entries.write().entry(id.to_string()).or_default().doc = doc;
        Ok(())
    }

    async fn post(&self, doc: Document) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        self.entries.write().insert(
            id.clone(),
            Entry {
                doc,
                attachments: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.entries
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Blob> {
        let entries = self.entries.read();
        let entry = entries.get(id).ok_or_else(|| StoreError::not_found(id))?;
        entry
            .attachments
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::attachment_not_found(id, name))
    }

    async fn put_attachment(&self, id: &str, name: &str, blob: Blob) -> StoreResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id))?;
        entry.attachments.insert(name.to_string(), blob);
        Ok(())
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StoreResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id))?;
        entry
            .attachments
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::attachment_not_found(id, name))
    }

    async fn all_attachments(&self, id: &str) -> StoreResult<BTreeMap<String, AttachmentMeta>> {
        let entries = self.entries.read();
        let entry = entries.get(id).ok_or_else(|| StoreError::not_found(id))?;
        Ok(entry
            .attachments
            .iter()
            .map(|(name, blob)| (name.clone(), AttachmentMeta::describe(blob)))
            .collect())
    }

    async fn build_query(&self, options: &QueryOptions) -> StoreResult<Vec<QueryRow>> {
        let entries: Vec<(String, Document)> = self
            .entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.doc.clone()))
            .collect();
        Ok(apply(entries, options))
    }

    async fn bulk_get(&self, ids: &[String]) -> StoreResult<Vec<StoreResult<Document>>> {
        let entries = self.entries.read();
        Ok(ids
            .iter()
            .map(|id| {
                entries
                    .get(id)
                    .map(|entry| entry.doc.clone())
                    .ok_or_else(|| StoreError::not_found(id.as_str()))
            })
            .collect())
    }
}
