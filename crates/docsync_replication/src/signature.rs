//! Signature records: the last agreed state of each synchronized id.

use crate::resolver::Baseline;
use chrono::{DateTime, Utc};
use docsync_store::{
    canonical_json, digest, run_query, Document, QueryOptions, SharedStore, StoreError, StoreResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Id prefix reserved for signatures kept inside the local store.
pub const SIGNATURE_PREFIX: &str = "_replicate_";

/// Returns the reserved keyspace for signatures of a replication scope.
///
/// Two replications over different stores or queries get different
/// keyspaces, so they can share a local store.
#[must_use]
pub fn signature_namespace(scope: &Value) -> String {
    let hash = digest(canonical_json(scope).as_bytes());
    format!("{SIGNATURE_PREFIX}{}/", &hash[..16])
}

/// Builds the scope value hashed by [`signature_namespace`].
///
/// `remote_instance` stands in for the remote spec when neither a spec nor
/// an explicit namespace tells remotes apart.
pub(crate) fn namespace_scope(config: &crate::ReplicationConfig, remote_instance: &str) -> Value {
    let remote_identified =
        config.remote_sub_storage.is_some() || config.signature_namespace.is_some();
    json!({
        "local_sub_storage": config.local_sub_storage,
        "remote_sub_storage": config.remote_sub_storage,
        "remote_instance": (!remote_identified).then_some(remote_instance),
        "namespace": config.signature_namespace,
        "query": config.query,
    })
}

/// Last agreed state of one id.
///
/// A record exists only while at least one document hash is known; a record
/// with neither is purged on save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Reconciliation id.
    pub id: String,
    /// Local document hash at the last sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<String>,
    /// Remote document hash at the last sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_hash: Option<String>,
    /// Local attachment hashes at the last sync.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub local_attachment_hashes: BTreeMap<String, String>,
    /// Remote attachment hashes at the last sync.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote_attachment_hashes: BTreeMap<String, String>,
    /// When the record was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl SignatureRecord {
    /// Creates an empty record.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            local_hash: None,
            remote_hash: None,
            local_attachment_hashes: BTreeMap::new(),
            remote_attachment_hashes: BTreeMap::new(),
            synced_at: None,
        }
    }

    /// Creates a record where both sides hold the same hash.
    pub fn agreed(id: impl Into<String>, hash: impl Into<String>) -> Self {
        let mut record = Self::new(id);
        record.set_document(hash);
        record
    }

    /// Returns true if neither document hash is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.local_hash.is_none() && self.remote_hash.is_none()
    }

    /// Records the same document hash for both sides.
    pub fn set_document(&mut self, hash: impl Into<String>) {
        let hash = hash.into();
        self.local_hash = Some(hash.clone());
        self.remote_hash = Some(hash);
    }

    /// Returns the document-level baseline.
    #[must_use]
    pub fn baseline(&self) -> Baseline<'_> {
        Baseline {
            local: self.local_hash.as_deref(),
            remote: self.remote_hash.as_deref(),
        }
    }

    /// Returns the baseline of one attachment, if it was ever synced.
    #[must_use]
    pub fn attachment_baseline(&self, name: &str) -> Option<Baseline<'_>> {
        let local = self.local_attachment_hashes.get(name).map(String::as_str);
        let remote = self.remote_attachment_hashes.get(name).map(String::as_str);
        (local.is_some() || remote.is_some()).then_some(Baseline { local, remote })
    }

    /// Returns every attachment name the record knows.
    #[must_use]
    pub fn attachment_names(&self) -> BTreeSet<String> {
        self.local_attachment_hashes
            .keys()
            .chain(self.remote_attachment_hashes.keys())
            .cloned()
            .collect()
    }

    /// Records the same attachment hash for both sides.
    pub fn set_attachment(&mut self, name: &str, hash: &str) {
        self.local_attachment_hashes
            .insert(name.to_string(), hash.to_string());
        self.remote_attachment_hashes
            .insert(name.to_string(), hash.to_string());
    }

    /// Drops an attachment from the record.
    pub fn forget_attachment(&mut self, name: &str) {
        self.local_attachment_hashes.remove(name);
        self.remote_attachment_hashes.remove(name);
    }

    fn to_document(&self) -> StoreResult<Document> {
        match serde_json::to_value(self)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(StoreError::Internal("signature did not encode as an object".into())),
        }
    }

    fn from_document(id: &str, doc: Document) -> StoreResult<Self> {
        let mut record: Self = serde_json::from_value(Value::Object(doc))?;
        record.id = id.to_string();
        Ok(record)
    }
}

/// Typed access to the store holding signature records.
#[derive(Clone)]
pub struct SignatureStore {
    store: SharedStore,
}

impl SignatureStore {
    /// Wraps a store.
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Lists every id with a record.
    pub async fn ids(&self) -> StoreResult<BTreeSet<String>> {
        let rows = run_query(self.store.as_ref(), &QueryOptions::default()).await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// Loads the record of an id.
    pub async fn load(&self, id: &str) -> StoreResult<Option<SignatureRecord>> {
        match self.store.get(id).await {
            Ok(doc) => SignatureRecord::from_document(id, doc).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes a record, stamping `synced_at`. Empty records are removed.
    pub async fn save(&self, record: &SignatureRecord) -> StoreResult<()> {
        if record.is_empty() {
            return self.remove(&record.id).await;
        }
        let mut record = record.clone();
        record.synced_at = Some(Utc::now());
        trace!(id = %record.id, "saving signature");
        self.store.put(&record.id, record.to_document()?).await
    }

    /// Removes the record of an id. Missing records are ignored.
    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        match self.store.remove(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for SignatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn save_then_load() {
        let signatures = SignatureStore::new(Arc::new(MemoryStore::new()));
        let mut record = SignatureRecord::agreed("doc", "h1");
        record.set_attachment("a", "ah");
        signatures.save(&record).await.unwrap();

        let loaded = signatures.load("doc").await.unwrap().unwrap();
        assert_eq!(loaded.local_hash.as_deref(), Some("h1"));
        assert_eq!(loaded.remote_attachment_hashes["a"], "ah");
        assert!(loaded.synced_at.is_some());
        assert_eq!(signatures.ids().await.unwrap().into_iter().collect::<Vec<_>>(), ["doc"]);
    }

    #[tokio::test]
    async fn empty_record_is_purged() {
        let store = Arc::new(MemoryStore::new());
        let signatures = SignatureStore::new(store.clone());
        signatures.save(&SignatureRecord::agreed("doc", "h")).await.unwrap();

        signatures.save(&SignatureRecord::new("doc")).await.unwrap();
        assert!(store.is_empty());
        assert!(signatures.load("doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removing_missing_record_is_ok() {
        let signatures = SignatureStore::new(Arc::new(MemoryStore::new()));
        signatures.remove("nothing").await.unwrap();
    }

    #[test]
    fn attachment_baseline_only_for_known_names() {
        let mut record = SignatureRecord::agreed("doc", "h");
        assert!(record.attachment_baseline("a").is_none());
        record.set_attachment("a", "x");
        let baseline = record.attachment_baseline("a").unwrap();
        assert_eq!(baseline.local, Some("x"));
        record.forget_attachment("a");
        assert!(record.attachment_names().is_empty());
    }

    #[test]
    fn namespace_depends_on_scope() {
        let a = signature_namespace(&json!({"query": {}}));
        let b = signature_namespace(&json!({"query": {"limit": [0, 1]}}));
        assert_ne!(a, b);
        assert!(a.starts_with(SIGNATURE_PREFIX));
        assert!(a.ends_with('/'));
    }

    #[test]
    fn record_encodes_without_empty_fields() {
        let record = SignatureRecord::agreed("doc", "h");
        let doc = record.to_document().unwrap();
        assert_eq!(doc.get("local_hash"), Some(&json!("h")));
        assert!(!doc.contains_key("local_attachment_hashes"));
    }
}
