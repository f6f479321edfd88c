//! Test fixtures and store helpers.
//!
//! Provides convenience functions for building documents, blobs and pairs
//! of instrumented stores.

use crate::instrumented::InstrumentedStore;
use bytes::Bytes;
use docsync_store::{Blob, Document, MemoryStore, SharedStore};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Converts a JSON object literal into a document.
///
/// # Panics
///
/// Panics if `value` is not an object.
///
/// # Example
///
/// ```rust
/// use docsync_testkit::doc;
/// use serde_json::json;
///
/// let d = doc(json!({"title": "foo"}));
/// assert_eq!(d["title"], "foo");
/// ```
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Creates a `text/plain` blob.
pub fn text_blob(text: &str) -> Blob {
    Blob::new("text/plain", Bytes::copy_from_slice(text.as_bytes()))
}

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A local and a remote memory store, each behind an [`InstrumentedStore`].
pub struct StorePair {
    /// Backing local store.
    pub local_data: Arc<MemoryStore>,
    /// Backing remote store.
    pub remote_data: Arc<MemoryStore>,
    /// Instrumented view of the local store.
    pub local: Arc<InstrumentedStore>,
    /// Instrumented view of the remote store.
    pub remote: Arc<InstrumentedStore>,
}

impl StorePair {
    /// Creates two empty stores.
    pub fn new() -> Self {
        Self::wrap(|store| store)
    }

    /// Creates two empty stores, letting `configure` adjust each wrapper.
    pub fn wrap(configure: impl Fn(InstrumentedStore) -> InstrumentedStore) -> Self {
        let local_data = Arc::new(MemoryStore::new());
        let remote_data = Arc::new(MemoryStore::new());
        let local = Arc::new(configure(InstrumentedStore::new(local_data.clone())));
        let remote = Arc::new(configure(InstrumentedStore::new(remote_data.clone())));
        Self {
            local_data,
            remote_data,
            local,
            remote,
        }
    }

    /// Returns the local store as a shared store.
    pub fn local_store(&self) -> SharedStore {
        self.local.clone()
    }

    /// Returns the remote store as a shared store.
    pub fn remote_store(&self) -> SharedStore {
        self.remote.clone()
    }

    /// Forgets recorded calls on both sides.
    pub fn reset_counts(&self) {
        self.local.reset();
        self.remote.reset();
    }
}

impl Default for StorePair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_store::DocumentStore;
    use serde_json::json;

    #[test]
    fn doc_from_object() {
        let d = doc(json!({"a": 1}));
        assert_eq!(d.len(), 1);
    }

    #[test]
    #[should_panic(expected = "expected a JSON object")]
    fn doc_rejects_non_objects() {
        doc(json!([1, 2]));
    }

    #[tokio::test]
    async fn pair_wraps_backing_stores() {
        let pair = StorePair::new();
        pair.local_store().put("a", doc(json!({}))).await.unwrap();
        assert_eq!(pair.local_data.ids(), ["a"]);
        assert!(pair.remote_data.is_empty());
    }
}
