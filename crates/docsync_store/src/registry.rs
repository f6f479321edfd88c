//! Store construction from declarative specs.

use crate::document::Document;
use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryStore;
use crate::store::SharedStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Declarative description of a store: a type name plus parameters.
///
/// ```json
/// {"type": "memory", "database": "replica"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSpec {
    /// Registered store type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific parameters.
    #[serde(flatten)]
    pub params: Document,
}

impl StoreSpec {
    /// Creates a spec without parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Document::new(),
        }
    }

    /// Creates a spec for a named shared in-memory database.
    pub fn memory(database: impl Into<String>) -> Self {
        Self::new("memory").with_param("database", database.into())
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns a string parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Returns a nested store spec parameter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the parameter exists but is not a spec.
    pub fn nested(&self, key: &str) -> StoreResult<Option<StoreSpec>> {
        self.params
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    StoreError::InvalidInput(format!("invalid {key} for {}: {e}", self.kind))
                })
            })
            .transpose()
    }
}

/// Builds a store from its spec. Receives the registry to resolve nested specs.
pub type StoreFactory =
    Arc<dyn Fn(&StoreSpec, &StoreRegistry) -> StoreResult<SharedStore> + Send + Sync>;

/// Maps store type names to factories.
///
/// The `memory` type is registered by default. A `database` parameter makes
/// every spec naming the same database resolve to one shared instance within
/// this registry.
pub struct StoreRegistry {
    factories: RwLock<HashMap<String, StoreFactory>>,
    memory_databases: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl StoreRegistry {
    /// Creates a registry with the built-in store types.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
            memory_databases: Mutex::new(HashMap::new()),
        };
        registry.factories.write().insert(
            "memory".to_string(),
            Arc::new(|spec: &StoreSpec, registry: &StoreRegistry| -> StoreResult<SharedStore> {
                let store: SharedStore = match spec.param_str("database") {
                    Some(name) => registry.memory_database(name),
                    None => Arc::new(MemoryStore::new()),
                };
                Ok(store)
            }),
        );
        registry
    }

    /// Registers a store type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the type name is already registered.
    pub fn register(&self, kind: impl Into<String>, factory: StoreFactory) -> StoreResult<()> {
        let kind = kind.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&kind) {
            return Err(StoreError::InvalidInput(format!(
                "Storage type already exists: {kind}"
            )));
        }
        factories.insert(kind, factory);
        Ok(())
    }

    /// Builds a store from its spec.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unknown type, or the factory's error.
    pub fn create(&self, spec: &StoreSpec) -> StoreResult<SharedStore> {
        let factory = self
            .factories
            .read()
            .get(&spec.kind)
            .cloned()
            .ok_or_else(|| {
                StoreError::InvalidInput(format!("Storage type not found: {}", spec.kind))
            })?;
        factory(spec, self)
    }

    /// Returns the shared in-memory database with the given name, creating it.
    pub fn memory_database(&self, name: &str) -> Arc<MemoryStore> {
        self.memory_databases
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }

    /// Returns the registered type names, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("kinds", &self.kinds())
            .finish_non_exhaustive()
    }
}
