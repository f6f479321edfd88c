//! # docsync Store
//!
//! Document store abstraction for docsync.
//!
//! A store holds id-keyed JSON documents, each with any number of named
//! binary attachments. Replication treats every store as an external system
//! and only uses the operations of [`DocumentStore`].
//!
//! ## Design Principles
//!
//! - Stores advertise native features through [`Capabilities`]
//! - [`run_query`] emulates whatever query features a store lacks
//! - Must be `Send + Sync`; replication issues concurrent calls
//! - Absence is reported as [`StoreError::NotFound`], never as an empty value
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - Reference implementation with every capability
//! - [`KeyspaceStore`] - An id-prefixed view over another store
//!
//! [`StoreRegistry`] builds stores from declarative [`StoreSpec`]s.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod keyspace;
mod memory;
mod query;
mod registry;
mod store;

pub use document::{canonical_json, digest, field_string, AttachmentMeta, Blob, Document};
pub use error::{StoreError, StoreResult};
pub use keyspace::KeyspaceStore;
pub use memory::MemoryStore;
pub use query::{apply, run_query, QueryOptions, QueryRow, Selector, SortOrder};
pub use registry::{StoreFactory, StoreRegistry, StoreSpec};
pub use store::{Capabilities, Capability, DocumentStore, SharedStore};
