//! Documents, attachments and their canonical forms.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// Binary attachment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// MIME type of the content.
    pub content_type: String,
    /// Raw bytes.
    pub data: Bytes,
}

impl Blob {
    /// Creates a blob with the given content type.
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Creates an untyped binary blob.
    pub fn octets(data: impl Into<Bytes>) -> Self {
        Self::new("application/octet-stream", data)
    }

    /// Returns the number of bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the blob holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the sha256 hex digest of the bytes.
    #[must_use]
    pub fn digest(&self) -> String {
        digest(&self.data)
    }
}

/// Metadata returned by attachment listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// MIME type of the content.
    pub content_type: String,
    /// Size in bytes.
    pub length: usize,
    /// Sha256 hex digest, when the store computes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl AttachmentMeta {
    /// Builds metadata describing a blob, including its digest.
    #[must_use]
    pub fn describe(blob: &Blob) -> Self {
        Self {
            content_type: blob.content_type.clone(),
            length: blob.len(),
            digest: Some(blob.digest()),
        }
    }
}

/// Returns the sha256 hex digest of `bytes`.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Returns the canonical JSON encoding of a value.
///
/// Object keys are sorted recursively so that two equal documents always
/// encode to the same bytes regardless of insertion order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Returns a deterministic string form of a field value.
///
/// Strings map to themselves, numbers and booleans to their JSON text,
/// null to `"null"`, and composite values to their canonical JSON.
#[must_use]
pub fn field_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        composite => canonical_json(composite),
    }
}
