//! Property-based test generators using proptest.
//!
//! Provides strategies for documents and for edits applied to one side of a
//! replicated pair.

use docsync_store::{Document, DocumentStore, StoreResult};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for document ids drawn from a small pool, so edits collide.
pub fn id_strategy() -> impl Strategy<Value = String> {
    (0u8..6).prop_map(|n| format!("doc-{n}"))
}

/// Strategy for scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

/// Strategy for small flat documents.
pub fn document_strategy() -> impl Strategy<Value = Document> {
    prop::collection::btree_map("[a-z]{1,6}", scalar_strategy(), 0..5)
        .prop_map(|fields| fields.into_iter().collect())
}

/// One change made to a store between passes.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Create or overwrite a document.
    Put(String, Document),
    /// Remove a document if present.
    Remove(String),
}

impl Edit {
    /// Applies the edit. Removing a missing document is not an error.
    pub async fn apply(&self, store: &dyn DocumentStore) -> StoreResult<()> {
        match self {
            Edit::Put(id, doc) => store.put(id, doc.clone()).await,
            Edit::Remove(id) => match store.remove(id).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
        }
    }
}

/// Strategy for a single edit.
pub fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (id_strategy(), document_strategy()).prop_map(|(id, doc)| Edit::Put(id, doc)),
        1 => id_strategy().prop_map(Edit::Remove),
    ]
}

/// Strategy for a batch of edits.
pub fn edits_strategy(max: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(edit_strategy(), 0..=max)
}
