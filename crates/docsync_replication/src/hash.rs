//! Change detection hashes.

use docsync_store::{canonical_json, digest, field_string, Document, QueryRow};
use serde_json::Value;

/// Computes the hash compared against signatures.
///
/// With a hash key the hash is the deterministic string form of that one
/// field, so `"1"` and `1` compare equal. A missing field hashes to
/// [`MISSING_FIELD`], which no present value produces. Without a key it is
/// the sha256 of the canonical JSON of the document, ignoring top-level
/// fields whose name starts with `_`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentHasher {
    key: Option<String>,
}

impl DocumentHasher {
    /// Creates a hasher, keyed by a field when `key` is set.
    #[must_use]
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }

    /// Returns the hash key, if any.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Hashes a full document.
    #[must_use]
    pub fn hash_document(&self, doc: &Document) -> String {
        match &self.key {
            Some(key) => field_hash(doc.get(key)),
            None => content_hash(doc),
        }
    }

    /// Hashes a query row, when the row carries enough to do so.
    ///
    /// Keyed hashers read the projected value; content hashers need the
    /// full document in the row.
    #[must_use]
    pub fn hash_row(&self, row: &QueryRow) -> Option<String> {
        match &self.key {
            Some(key) => Some(field_hash(row.value.get(key))),
            None => row.doc.as_ref().map(content_hash),
        }
    }
}

/// Keyed hash of a document lacking the hash field.
pub const MISSING_FIELD: &str = "\u{0}";

fn field_hash(value: Option<&Value>) -> String {
    let Some(value) = value else {
        return MISSING_FIELD.to_string();
    };
    let hash = field_string(value);
    if hash.starts_with(MISSING_FIELD) {
        // Escaped so a value can never read as missing.
        format!("{MISSING_FIELD}{hash}")
    } else {
        hash
    }
}

/// Hashes document content, skipping internal `_`-prefixed fields.
#[must_use]
pub fn content_hash(doc: &Document) -> String {
    let visible: Document = doc
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    digest(canonical_json(&Value::Object(visible)).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn content_hash_ignores_key_order_and_internal_fields() {
        let a = doc(json!({"title": "foo", "n": [1, 2], "_rev": "1-abc"}));
        let b = doc(json!({"n": [1, 2], "title": "foo", "_rev": "2-def"}));
        assert_eq!(content_hash(&a), content_hash(&b));

        let c = doc(json!({"title": "bar", "n": [1, 2]}));
        assert_ne!(content_hash(&a), content_hash(&c));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn keyed_hash_uses_string_form() {
        let hasher = DocumentHasher::new(Some("modified".into()));
        assert_eq!(hasher.hash_document(&doc(json!({"modified": 5}))), "5");
        assert_eq!(
            hasher.hash_document(&doc(json!({"modified": "5"}))),
            hasher.hash_document(&doc(json!({"modified": 5})))
        );
    }

    #[test]
    fn missing_key_differs_from_every_value() {
        let hasher = DocumentHasher::new(Some("modified".into()));
        let missing = hasher.hash_document(&doc(json!({"title": "x"})));
        assert_eq!(missing, MISSING_FIELD);
        for value in [json!("null"), json!(null), json!(""), json!("\u{0}")] {
            let present = hasher.hash_document(&doc(json!({ "modified": value })));
            assert_ne!(present, missing, "{value}");
        }
    }

    #[test]
    fn row_hash_needs_value_or_doc() {
        let keyed = DocumentHasher::new(Some("etag".into()));
        let mut row = QueryRow::bare("a");
        row.value.insert("etag".into(), json!("e1"));
        assert_eq!(keyed.hash_row(&row).as_deref(), Some("e1"));

        let content = DocumentHasher::default();
        assert!(content.hash_row(&row).is_none());
        row.doc = Some(doc(json!({"title": "foo"})));
        assert_eq!(
            content.hash_row(&row),
            Some(content_hash(&doc(json!({"title": "foo"}))))
        );
    }
}
