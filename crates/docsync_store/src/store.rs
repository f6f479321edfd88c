//! Document store trait definition.

use crate::document::{AttachmentMeta, Blob, Document};
use crate::error::{StoreError, StoreResult};
use crate::query::{QueryOptions, QueryRow};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A shared, dynamically dispatched store handle.
pub type SharedStore = Arc<dyn DocumentStore>;

/// An optional feature a store may implement natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Listing every document id.
    List,
    /// Filtering with a selector.
    Query,
    /// Projecting fields into row values.
    Select,
    /// Sorting rows.
    Sort,
    /// Offset/count windows.
    Limit,
    /// Returning full documents alongside rows.
    IncludeDocs,
    /// Fetching many documents in one call.
    BulkGet,
    /// Creating documents with store-generated ids.
    Post,
    /// Reporting content digests in attachment metadata.
    AttachmentDigest,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 9] = [
        Capability::List,
        Capability::Query,
        Capability::Select,
        Capability::Sort,
        Capability::Limit,
        Capability::IncludeDocs,
        Capability::BulkGet,
        Capability::Post,
        Capability::AttachmentDigest,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Returns the capability's name as used in error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Capability::List => "list",
            Capability::Query => "query",
            Capability::Select => "select",
            Capability::Sort => "sort",
            Capability::Limit => "limit",
            Capability::IncludeDocs => "include",
            Capability::BulkGet => "bulk_get",
            Capability::Post => "post",
            Capability::AttachmentDigest => "attachment_digest",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u16);

impl Capabilities {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every capability.
    #[must_use]
    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    /// Returns the set with `capability` added.
    #[must_use]
    pub fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    /// Returns the set with `capability` removed.
    #[must_use]
    pub fn without(self, capability: Capability) -> Self {
        Self(self.0 & !capability.bit())
    }

    /// Returns true if `capability` is in the set.
    #[must_use]
    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Returns true if the store can answer `options` natively.
    #[must_use]
    pub fn covers(self, options: &QueryOptions) -> bool {
        options
            .required_capabilities()
            .into_iter()
            .all(|capability| self.contains(capability))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// A store of id-keyed documents with named attachments.
///
/// Every replicated side (local, remote) and the signature store satisfy
/// this contract. Stores are external systems: the replication engine only
/// relies on the operations below and on the advertised [`Capabilities`].
///
/// # Invariants
///
/// - `get` after a successful `put` returns the written document
/// - `put_attachment` on a missing document fails with `NotFound`
/// - `remove` drops the document together with its attachments
/// - Stores must be `Send + Sync`; the engine issues concurrent calls
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the capabilities this store implements natively.
    ///
    /// Query options outside this set are emulated by [`crate::run_query`].
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty().with(Capability::List)
    }

    /// Fetches a document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the id does not exist.
    async fn get(&self, id: &str) -> StoreResult<Document>;

    /// Creates or replaces a document.
    async fn put(&self, id: &str, doc: Document) -> StoreResult<()>;

    /// Creates a document under a store-generated id and returns the id.
    async fn post(&self, _doc: Document) -> StoreResult<String> {
        Err(StoreError::Unsupported(Capability::Post))
    }

    /// Removes a document and all of its attachments.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the id does not exist.
    async fn remove(&self, id: &str) -> StoreResult<()>;

    /// Fetches an attachment.
    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Blob>;

    /// Creates or replaces an attachment of an existing document.
    async fn put_attachment(&self, id: &str, name: &str, blob: Blob) -> StoreResult<()>;

    /// Removes an attachment.
    async fn remove_attachment(&self, id: &str, name: &str) -> StoreResult<()>;

    /// Lists the attachments of a document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    async fn all_attachments(&self, id: &str) -> StoreResult<BTreeMap<String, AttachmentMeta>>;

    /// Runs a query natively.
    ///
    /// Callers should go through [`crate::run_query`], which only calls this
    /// with options covered by [`DocumentStore::capabilities`].
    async fn build_query(&self, options: &QueryOptions) -> StoreResult<Vec<QueryRow>>;

    /// Fetches several documents, one result per requested id.
    async fn bulk_get(&self, ids: &[String]) -> StoreResult<Vec<StoreResult<Document>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get(id).await);
        }
        Ok(out)
    }

    /// Brings the store into a consistent state before a replication pass.
    async fn repair(&self) -> StoreResult<()> {
        Ok(())
    }
}
