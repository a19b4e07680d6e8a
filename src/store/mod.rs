//! Typed gateway over the document store.
//!
//! Every persistent write in the system goes through [`DocumentStore`]: an
//! object-safe trait over JSON documents with per-document atomicity and
//! guarded conditional updates. The Postgres backend is the production store;
//! the in-memory backend mirrors its semantics for tests and local runs.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Maximum keys per underlying existence query; callers pass arbitrary sizes
/// and [`batch_exists`] fans in.
pub const BATCH_EXISTS_CHUNK: usize = 10;

/// Well-known collection names.
pub mod collections {
    pub const QUEUE: &str = "job-queue";
    pub const MATCHES: &str = "job-matches";
    pub const COMPANIES: &str = "companies";
    pub const SOURCES: &str = "job-sources";
    pub const CONFIG: &str = "job-finder-config";
}

/// Storage failures, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Retryable: connection loss, timeouts, serialization conflicts.
    #[error("transient storage failure: {0}")]
    Transient(String),
    /// A guarded write's condition did not hold. Not retryable as-is.
    #[error("precondition failed for {collection}/{key}")]
    Precondition { collection: String, key: String },
    #[error("document not found: {collection}/{key}")]
    NotFound { collection: String, key: String },
    /// A stored document no longer matches its schema.
    #[error("document decode failed for {collection}/{key}: {message}")]
    Decode {
        collection: String,
        key: String,
        message: String,
    },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Field predicates for queries.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    /// Field (as string) is one of the given values.
    In(String, Vec<String>),
    /// Numeric less-than.
    Lt(String, Value),
    /// Numeric greater-or-equal.
    Gte(String, Value),
}

/// How an order field compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Numeric,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub kind: OrderKind,
    pub direction: Direction,
}

/// A filtered, ordered, limited scan of one collection.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_asc(mut self, field: &str, kind: OrderKind) -> Self {
        self.order.push(OrderBy {
            field: field.to_string(),
            kind,
            direction: Direction::Asc,
        });
        self
    }

    pub fn order_desc(mut self, field: &str, kind: OrderKind) -> Self {
        self.order.push(OrderBy {
            field: field.to_string(),
            kind,
            direction: Direction::Desc,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Guard for conditional updates. All conditions must hold for the write to
/// take effect; a missing field never satisfies `Eq` or `Lt`.
#[derive(Debug, Clone)]
pub enum Cond {
    Eq(String, Value),
    /// Numeric: existing field strictly less than the given value.
    Lt(String, Value),
    Missing(String),
}

/// A raw document returned by a query.
#[derive(Debug, Clone)]
pub struct Document {
    pub key: String,
    pub data: Value,
}

/// Object-safe CRUD surface over one logical document store.
///
/// All writes are idempotent on `(collection, key)`; `update_if` is the only
/// primitive with read-modify-write semantics and it is atomic per document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditional upsert.
    async fn put(&self, collection: &str, key: &str, data: Value) -> Result<(), StoreError>;

    /// Create-only write; `Precondition` if the key already exists.
    async fn insert(&self, collection: &str, key: &str, data: Value) -> Result<(), StoreError>;

    /// Guarded replace. `NotFound` if the document is absent, `Precondition`
    /// if any condition fails.
    async fn update_if(
        &self,
        collection: &str,
        key: &str,
        conds: &[Cond],
        data: Value,
    ) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError>;

    /// Which of the given keys exist. Callers must keep `keys` within
    /// [`BATCH_EXISTS_CHUNK`]; use [`batch_exists`] for arbitrary sizes.
    async fn exists_chunk(
        &self,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<String>, StoreError>;
}

/// Existence check for arbitrarily many keys, fanned into chunked queries.
pub async fn batch_exists(
    store: &dyn DocumentStore,
    collection: &str,
    keys: &[String],
) -> Result<HashSet<String>, StoreError> {
    let mut found = HashSet::new();
    for chunk in keys.chunks(BATCH_EXISTS_CHUNK) {
        found.extend(store.exists_chunk(collection, chunk).await?);
    }
    Ok(found)
}

/// Typed view of one collection.
pub struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
    pub fn new(store: Arc<dyn DocumentStore>, name: &'static str) -> Self {
        Self {
            store,
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn decode(&self, key: &str, data: Value) -> Result<T, StoreError> {
        serde_json::from_value(data).map_err(|e| StoreError::Decode {
            collection: self.name.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn encode(&self, key: &str, value: &T) -> Result<Value, StoreError> {
        serde_json::to_value(value).map_err(|e| StoreError::Decode {
            collection: self.name.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(self.name, key).await? {
            Some(data) => Ok(Some(self.decode(key, data)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let data = self.encode(key, value)?;
        self.store.put(self.name, key, data).await
    }

    pub async fn insert(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let data = self.encode(key, value)?;
        self.store.insert(self.name, key, data).await
    }

    pub async fn update_if(&self, key: &str, conds: &[Cond], value: &T) -> Result<(), StoreError> {
        let data = self.encode(key, value)?;
        self.store.update_if(self.name, key, conds, data).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(self.name, key).await
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<T>, StoreError> {
        let docs = self.store.query(self.name, query).await?;
        docs.into_iter()
            .map(|doc| self.decode(&doc.key, doc.data))
            .collect()
    }

    pub async fn count(&self, filters: &[Filter]) -> Result<u64, StoreError> {
        self.store.count(self.name, filters).await
    }
}
