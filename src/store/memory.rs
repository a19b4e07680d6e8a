//! In-memory store backend mirroring the Postgres semantics.
//!
//! Backs integration tests and local runs without a database. Conditional
//! updates lock the document's map entry, so the check-and-swap is atomic
//! with respect to concurrent callers.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{Cond, Direction, Document, DocumentStore, Filter, OrderKind, Query, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn field<'a>(data: &'a Value, name: &str) -> Option<&'a Value> {
    data.get(name)
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn filter_matches(data: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(name, expected) => field(data, name) == Some(expected),
        Filter::In(name, values) => field(data, name)
            .and_then(Value::as_str)
            .map(|s| values.iter().any(|v| v == s))
            .unwrap_or(false),
        Filter::Lt(name, bound) => match (field(data, name).and_then(as_f64), as_f64(bound)) {
            (Some(actual), Some(bound)) => actual < bound,
            _ => false,
        },
        Filter::Gte(name, bound) => match (field(data, name).and_then(as_f64), as_f64(bound)) {
            (Some(actual), Some(bound)) => actual >= bound,
            _ => false,
        },
    }
}

fn cond_holds(data: &Value, cond: &Cond) -> bool {
    match cond {
        Cond::Eq(name, expected) => field(data, name) == Some(expected),
        Cond::Lt(name, bound) => match (field(data, name).and_then(as_f64), as_f64(bound)) {
            (Some(actual), Some(bound)) => actual < bound,
            _ => false,
        },
        Cond::Missing(name) => field(data, name).is_none(),
    }
}

fn compare_order(a: &Value, b: &Value, query: &Query) -> Ordering {
    for order in &query.order {
        let ord = match order.kind {
            OrderKind::Numeric => {
                let left = field(a, &order.field).and_then(as_f64);
                let right = field(b, &order.field).and_then(as_f64);
                match (left, right) {
                    (Some(l), Some(r)) => l.total_cmp(&r),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
            OrderKind::Text => {
                let left = field(a, &order.field).and_then(Value::as_str).unwrap_or("");
                let right = field(b, &order.field).and_then(Value::as_str).unwrap_or("");
                left.cmp(right)
            }
        };
        let ord = match order.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key).cloned()))
    }

    async fn put(&self, collection: &str, key: &str, data: Value) -> Result<(), StoreError> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn insert(&self, collection: &str, key: &str, data: Value) -> Result<(), StoreError> {
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        if docs.contains_key(key) {
            return Err(StoreError::Precondition {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        docs.insert(key.to_string(), data);
        Ok(())
    }

    async fn update_if(
        &self,
        collection: &str,
        key: &str,
        conds: &[Cond],
        data: Value,
    ) -> Result<(), StoreError> {
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        match docs.get_mut(key) {
            None => Err(StoreError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            }),
            Some(existing) => {
                if conds.iter().all(|c| cond_holds(existing, c)) {
                    *existing = data;
                    Ok(())
                } else {
                    Err(StoreError::Precondition {
                        collection: collection.to_string(),
                        key: key.to_string(),
                    })
                }
            }
        }
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        if let Some(mut docs) = self.collections.get_mut(collection) {
            docs.remove(key);
        }
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut matched: Vec<Document> = match self.collections.get(collection) {
            None => Vec::new(),
            Some(docs) => docs
                .iter()
                .filter(|(_, data)| query.filters.iter().all(|f| filter_matches(data, f)))
                .map(|(key, data)| Document {
                    key: key.clone(),
                    data: data.clone(),
                })
                .collect(),
        };

        if !query.order.is_empty() {
            matched.sort_by(|a, b| compare_order(&a.data, &b.data, query));
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        Ok(match self.collections.get(collection) {
            None => 0,
            Some(docs) => docs
                .values()
                .filter(|data| filters.iter().all(|f| filter_matches(data, f)))
                .count() as u64,
        })
    }

    async fn exists_chunk(
        &self,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<String>, StoreError> {
        Ok(match self.collections.get(collection) {
            None => Vec::new(),
            Some(docs) => keys
                .iter()
                .filter(|k| docs.contains_key(*k))
                .cloned()
                .collect(),
        })
    }
}
