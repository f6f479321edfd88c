//! A store view over an id-prefixed range of another store.

use crate::document::{AttachmentMeta, Blob, Document};
use crate::error::{StoreError, StoreResult};
use crate::query::{apply, run_query, QueryOptions, QueryRow};
use crate::store::{Capabilities, Capability, DocumentStore, SharedStore};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Presents the ids `prefix + id` of an inner store as a standalone store.
///
/// Ids outside the prefix are invisible through this view. Queries list the
/// inner store and strip the prefix, so the view only advertises `List` and
/// lets [`run_query`] evaluate anything richer.
pub struct KeyspaceStore {
    inner: SharedStore,
    prefix: String,
}

impl KeyspaceStore {
    /// Creates a view over `inner` restricted to ids starting with `prefix`.
    pub fn new(inner: SharedStore, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    /// Returns the id prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn rewrap(&self, err: StoreError) -> StoreError {
        match err {
            StoreError::NotFound { id, attachment } => StoreError::NotFound {
                id: id.strip_prefix(&self.prefix).unwrap_or(&id).to_string(),
                attachment,
            },
            other => other,
        }
    }
}

impl std::fmt::Debug for KeyspaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyspaceStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DocumentStore for KeyspaceStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty().with(Capability::List)
    }

    async fn get(&self, id: &str) -> StoreResult<Document> {
        self.inner.get(&self.key(id)).await.map_err(|e| self.rewrap(e))
    }

    async fn put(&self, id: &str, doc: Document) -> StoreResult<()> {
        self.inner.put(&self.key(id), doc).await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.inner
            .remove(&self.key(id))
            .await
            .map_err(|e| self.rewrap(e))
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Blob> {
        self.inner
            .get_attachment(&self.key(id), name)
            .await
            .map_err(|e| self.rewrap(e))
    }

    async fn put_attachment(&self, id: &str, name: &str, blob: Blob) -> StoreResult<()> {
        self.inner
            .put_attachment(&self.key(id), name, blob)
            .await
            .map_err(|e| self.rewrap(e))
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StoreResult<()> {
        self.inner
            .remove_attachment(&self.key(id), name)
            .await
            .map_err(|e| self.rewrap(e))
    }

    async fn all_attachments(&self, id: &str) -> StoreResult<BTreeMap<String, AttachmentMeta>> {
        self.inner
            .all_attachments(&self.key(id))
            .await
            .map_err(|e| self.rewrap(e))
    }

    async fn build_query(&self, options: &QueryOptions) -> StoreResult<Vec<QueryRow>> {
        let rows = run_query(self.inner.as_ref(), &QueryOptions::default()).await?;
        let ids = rows
            .into_iter()
            .filter_map(|row| row.id.strip_prefix(&self.prefix).map(str::to_string));
        Ok(apply(ids.map(|id| (id, Document::new())), options))
    }
}
