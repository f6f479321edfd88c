//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - An instrumented store wrapper counting calls, simulating latency,
//!   measuring overlapping calls and injecting faults
//! - Document, blob and store-pair fixtures
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn counts_remote_reads() {
//!     let pair = StorePair::new();
//!     // ... replicate between pair.local_store() and pair.remote_store()
//!     assert_eq!(pair.remote.count(Op::Get), 0);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod instrumented;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::instrumented::*;
}

pub use fixtures::*;
pub use generators::*;
pub use instrumented::*;
