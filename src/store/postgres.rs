//! Postgres-backed document store.
//!
//! One `documents` table holds every collection as JSONB rows keyed by
//! `(collection, key)`. Conditional updates compile to single guarded
//! `UPDATE` statements, which is the only atomicity the core relies on.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::{Cond, Direction, Document, DocumentStore, Filter, OrderKind, Query, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    StoreError::Transient(e.to_string())
}

/// JSONB accessor for an internal field name. Field names come from this
/// crate only; anything unexpected is rejected rather than interpolated.
fn field_expr(field: &str) -> Result<String, StoreError> {
    if field
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !field.is_empty()
    {
        Ok(format!("data->'{field}'"))
    } else {
        Err(StoreError::Transient(format!(
            "invalid field name: {field}"
        )))
    }
}

fn text_expr(field: &str) -> Result<String, StoreError> {
    field_expr(field).map(|_| format!("data->>'{field}'"))
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    filters: &[Filter],
) -> Result<(), StoreError> {
    for filter in filters {
        match filter {
            Filter::Eq(field, value) => {
                builder.push(format!(" AND {} = ", field_expr(field)?));
                builder.push_bind(value.clone());
            }
            Filter::In(field, values) => {
                builder.push(format!(" AND {} = ANY(", text_expr(field)?));
                builder.push_bind(values.clone());
                builder.push(")");
            }
            Filter::Lt(field, value) => {
                builder.push(format!(" AND {} < ", field_expr(field)?));
                builder.push_bind(value.clone());
            }
            Filter::Gte(field, value) => {
                builder.push(format!(" AND {} >= ", field_expr(field)?));
                builder.push_bind(value.clone());
            }
        }
    }
    Ok(())
}

fn push_conds(builder: &mut QueryBuilder<'_, Postgres>, conds: &[Cond]) -> Result<(), StoreError> {
    for cond in conds {
        match cond {
            Cond::Eq(field, value) => {
                builder.push(format!(" AND {} = ", field_expr(field)?));
                builder.push_bind(value.clone());
            }
            Cond::Lt(field, value) => {
                builder.push(format!(" AND {} < ", field_expr(field)?));
                builder.push_bind(value.clone());
            }
            Cond::Missing(field) => {
                field_expr(field)?;
                builder.push(format!(" AND NOT jsonb_exists(data, '{field}')"));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        sqlx::query_scalar::<_, Value>(
            "SELECT data FROM documents WHERE collection = $1 AND key = $2",
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn put(&self, collection: &str, key: &str, data: Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents (collection, key, data) VALUES ($1, $2, $3) \
             ON CONFLICT (collection, key) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()",
        )
        .bind(collection)
        .bind(key)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert(&self, collection: &str, key: &str, data: Value) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO documents (collection, key, data) VALUES ($1, $2, $3) \
             ON CONFLICT (collection, key) DO NOTHING",
        )
        .bind(collection)
        .bind(key)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Precondition {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn update_if(
        &self,
        collection: &str,
        key: &str,
        conds: &[Cond],
        data: Value,
    ) -> Result<(), StoreError> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("UPDATE documents SET data = ");
        builder.push_bind(data);
        builder.push(", updated_at = NOW() WHERE collection = ");
        builder.push_bind(collection.to_string());
        builder.push(" AND key = ");
        builder.push_bind(key.to_string());
        push_conds(&mut builder, conds)?;

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Distinguish a failed guard from a missing document.
        match self.get(collection, key).await? {
            Some(_) => Err(StoreError::Precondition {
                collection: collection.to_string(),
                key: key.to_string(),
            }),
            None => Err(StoreError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM documents WHERE collection = $1 AND key = $2")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT key, data FROM documents WHERE collection = ");
        builder.push_bind(collection.to_string());
        push_filters(&mut builder, &query.filters)?;

        if !query.order.is_empty() {
            builder.push(" ORDER BY ");
            for (i, order) in query.order.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                let expr = match order.kind {
                    OrderKind::Numeric => format!("(({})::numeric)", text_expr(&order.field)?),
                    OrderKind::Text => text_expr(&order.field)?,
                };
                let dir = match order.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                builder.push(format!("{expr} {dir}"));
            }
        }

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows: Vec<(String, Value)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|(key, data)| Document { key, data })
            .collect())
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM documents WHERE collection = ");
        builder.push_bind(collection.to_string());
        push_filters(&mut builder, filters)?;

        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(count as u64)
    }

    async fn exists_chunk(
        &self,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT key FROM documents WHERE collection = $1 AND key = ANY($2)",
        )
        .bind(collection)
        .bind(keys)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)
    }
}
