//! Query model and the in-memory query fallback.
//!
//! Stores advertise which query features they implement through
//! [`Capabilities`](crate::Capabilities). [`run_query`] calls the native
//! implementation when it covers the request and otherwise lists ids,
//! fetches documents and evaluates the options locally.

use crate::document::{field_string, Document};
use crate::error::{StoreError, StoreResult};
use crate::store::{Capability, DocumentStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::debug;

/// A filter over document fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Field equals value (compared by canonical string form).
    Eq {
        /// Field name.
        key: String,
        /// Expected value.
        value: Value,
    },
    /// Every inner selector matches.
    All(Vec<Selector>),
    /// At least one inner selector matches.
    Any(Vec<Selector>),
    /// The inner selector does not match.
    Not(Box<Selector>),
}

impl Selector {
    /// Creates a field-equality selector.
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns true if the document satisfies the selector.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Selector::Eq { key, value } => doc
                .get(key)
                .is_some_and(|actual| field_string(actual) == field_string(value)),
            Selector::All(inner) => inner.iter().all(|s| s.matches(doc)),
            Selector::Any(inner) => inner.iter().any(|s| s.matches(doc)),
            Selector::Not(inner) => !inner.matches(doc),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Options for [`DocumentStore::build_query`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Row filter. `None` selects every document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Selector>,
    /// Sort keys, applied in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort_on: Vec<(String, SortOrder)>,
    /// `(offset, count)` window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<(usize, usize)>,
    /// Fields projected into [`QueryRow::value`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub select_list: Vec<String>,
    /// Whether rows carry the full document.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_docs: bool,
}

impl QueryOptions {
    /// Sets the filter.
    #[must_use]
    pub fn with_query(mut self, selector: Selector) -> Self {
        self.query = Some(selector);
        self
    }

    /// Appends a sort key.
    #[must_use]
    pub fn with_sort(mut self, key: impl Into<String>, order: SortOrder) -> Self {
        self.sort_on.push((key.into(), order));
        self
    }

    /// Sets the `(offset, count)` window.
    #[must_use]
    pub fn with_limit(mut self, offset: usize, count: usize) -> Self {
        self.limit = Some((offset, count));
        self
    }

    /// Adds a projected field, ignoring duplicates.
    #[must_use]
    pub fn with_select(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.select_list.contains(&key) {
            self.select_list.push(key);
        }
        self
    }

    /// Requests full documents in the rows.
    #[must_use]
    pub fn with_include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    /// Returns the capabilities a store needs to answer these options.
    #[must_use]
    pub fn required_capabilities(&self) -> Vec<Capability> {
        let mut required = vec![Capability::List];
        if self.query.is_some() {
            required.push(Capability::Query);
        }
        if !self.sort_on.is_empty() {
            required.push(Capability::Sort);
        }
        if self.limit.is_some() {
            required.push(Capability::Limit);
        }
        if !self.select_list.is_empty() {
            required.push(Capability::Select);
        }
        if self.include_docs {
            required.push(Capability::IncludeDocs);
        }
        required
    }

    /// Returns true if evaluating the options requires document bodies.
    #[must_use]
    pub fn needs_documents(&self) -> bool {
        self.query.is_some()
            || !self.sort_on.is_empty()
            || !self.select_list.is_empty()
            || self.include_docs
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    /// Document id.
    pub id: String,
    /// Projected fields from `select_list`.
    pub value: Document,
    /// Full document, when `include_docs` was requested.
    pub doc: Option<Document>,
}

impl QueryRow {
    /// Creates a row carrying only an id.
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: Document::new(),
            doc: None,
        }
    }
}

/// Evaluates `options` over `(id, document)` entries.
///
/// Entries are expected in id order; sorting is stable so ties keep it.
pub fn apply<I>(entries: I, options: &QueryOptions) -> Vec<QueryRow>
where
    I: IntoIterator<Item = (String, Document)>,
{
    let mut matched: Vec<(String, Document)> = entries
        .into_iter()
        .filter(|(_, doc)| options.query.as_ref().map_or(true, |q| q.matches(doc)))
        .collect();

    if !options.sort_on.is_empty() {
        matched.sort_by(|(_, a), (_, b)| {
            for (key, order) in &options.sort_on {
                let ordering = compare_fields(a.get(key), b.get(key));
                let ordering = match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let (offset, count) = options.limit.unwrap_or((0, usize::MAX));
    matched
        .into_iter()
        .skip(offset)
        .take(count)
        .map(|(id, doc)| {
            let value = options
                .select_list
                .iter()
                .filter_map(|key| doc.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            QueryRow {
                id,
                value,
                doc: options.include_docs.then_some(doc),
            }
        })
        .collect()
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(x), Some(y)) => field_string(x).cmp(&field_string(y)),
    }
}

/// Runs a query, emulating features the store lacks.
///
/// # Errors
///
/// Returns `Unsupported(List)` if the store cannot even list its ids, or
/// any error raised by the store while listing or fetching.
pub async fn run_query(
    store: &dyn DocumentStore,
    options: &QueryOptions,
) -> StoreResult<Vec<QueryRow>> {
    let capabilities = store.capabilities();
    if capabilities.covers(options) {
        return store.build_query(options).await;
    }
    if !capabilities.contains(Capability::List) {
        return Err(StoreError::Unsupported(Capability::List));
    }

    let listing = store.build_query(&QueryOptions::default()).await?;
    let ids: Vec<String> = listing.into_iter().map(|row| row.id).collect();
    debug!(rows = ids.len(), "evaluating query options in memory");

    if !options.needs_documents() {
        return Ok(apply(ids.into_iter().map(|id| (id, Document::new())), options));
    }

    let fetched = if capabilities.contains(Capability::BulkGet) {
        store.bulk_get(&ids).await?
    } else {
        let mut fetched = Vec::with_capacity(ids.len());
        for id in &ids {
            fetched.push(store.get(id).await);
        }
        fetched
    };

    let mut entries = Vec::with_capacity(ids.len());
    for (id, result) in ids.into_iter().zip(fetched) {
        match result {
            Ok(doc) => entries.push((id, doc)),
            // Removed between listing and fetching.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(apply(entries, options))
}
