//! `PostgreSQL` read model store.
//!
//! # Overview
//!
//! Stores every read model class in one table, one row per
//! `(read model name, id, sequence value)`:
//! - The read model document (metadata block included) as `JSONB`
//! - Its version in a dedicated column, so conditional writes are a plain `WHERE`
//! - An empty `sequence_value` for classes without a sequence key
//!
//! # Architecture
//!
//! ```text
//! Write Side (Event Store)          Read Side (Read Models)
//! ┌─────────────────────┐          ┌─────────────────────┐
//! │  PostgreSQL DB #1   │          │  PostgreSQL DB #2   │
//! │                     │          │                     │
//! │  events             │   →→→    │  read_models        │
//! │  snapshots          │ Snapshots│                     │
//! └─────────────────────┘          └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use readside_projections::postgres::PostgresReadModelStore;
//!
//! let store = PostgresReadModelStore::new_with_separate_db(
//!     "postgres://localhost/read_models",
//!     "read_models".to_string(),
//! ).await?;
//! store.migrate().await?;
//! ```

use readside_core::read_model::{ReadModel, ReadModelFilter, ReadModelId, SequenceKey, Version};
use readside_core::store::{ReadModelStore, ReadModelStoreError, Result};
use readside_core::BoxFuture;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

/// PostgreSQL-backed [`ReadModelStore`].
///
/// # Schema
///
/// ```sql
/// CREATE TABLE read_models (
///     read_model_name TEXT NOT NULL,
///     id TEXT NOT NULL,
///     sequence_value TEXT NOT NULL DEFAULT '',
///     version BIGINT NOT NULL,
///     data JSONB NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
///     PRIMARY KEY (read_model_name, id, sequence_value)
/// );
/// ```
///
/// # Concurrency
///
/// - Expected version 0: `INSERT ... ON CONFLICT DO NOTHING`
/// - Expected version N: `UPDATE ... WHERE version = N`
///
/// Zero affected rows means another writer got there first and is reported as
/// [`ReadModelStoreError::OptimisticConcurrencyUnexpectedVersion`].
#[derive(Clone, Debug)]
pub struct PostgresReadModelStore {
    pool: PgPool,
    table_name: String,
}

impl PostgresReadModelStore {
    /// Create a store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool, table_name: String) -> Self {
        Self { pool, table_name }
    }

    /// Create a store with its own connection pool.
    ///
    /// Keeps the read side on a different database than the event store.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelStoreError::Storage`] if connection fails.
    pub async fn new_with_separate_db(database_url: &str, table_name: String) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ReadModelStoreError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool, table_name))
    }

    /// Create the read model table and its search index if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelStoreError::Storage`] if the DDL fails.
    pub async fn migrate(&self) -> Result<()> {
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                read_model_name TEXT NOT NULL,
                id TEXT NOT NULL,
                sequence_value TEXT NOT NULL DEFAULT '',
                version BIGINT NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (read_model_name, id, sequence_value)
            )",
            table = self.table_name
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_data_idx ON {table} USING GIN (data)",
            table = self.table_name
        );

        for statement in [create_table, create_index] {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ReadModelStoreError::Storage(format!("Migration failed: {e}")))?;
        }
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn insert_new(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_value: &str,
        version: i64,
        data: Value,
    ) -> Result<u64> {
        let query = format!(
            "INSERT INTO {} (read_model_name, id, sequence_value, version, data, updated_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (read_model_name, id, sequence_value) DO NOTHING",
            self.table_name
        );

        let result = sqlx::query(&query)
            .bind(read_model_name)
            .bind(id.as_str())
            .bind(sequence_value)
            .bind(version)
            .bind(Json(data))
            .execute(&self.pool)
            .await
            .map_err(|e| ReadModelStoreError::Storage(format!("Failed to insert: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn update_expected(
        &self,
        read_model_name: &str,
        id: &ReadModelId,
        sequence_value: &str,
        version: i64,
        expected: i64,
        data: Value,
    ) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET version = $4, data = $5, updated_at = now()
             WHERE read_model_name = $1 AND id = $2 AND sequence_value = $3 AND version = $6",
            self.table_name
        );

        let result = sqlx::query(&query)
            .bind(read_model_name)
            .bind(id.as_str())
            .bind(sequence_value)
            .bind(version)
            .bind(Json(data))
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(|e| ReadModelStoreError::Storage(format!("Failed to update: {e}")))?;

        Ok(result.rows_affected())
    }
}

fn sequence_value(sequence_key: Option<&SequenceKey>) -> &str {
    sequence_key.map_or("", |key| key.value.as_str())
}

fn to_column(version: Version) -> Result<i64> {
    i64::try_from(version.value())
        .map_err(|_| ReadModelStoreError::Storage(format!("Version {version} out of range")))
}

fn require_id(read_model_name: &str, read_model: &ReadModel) -> Result<ReadModelId> {
    read_model.id().ok_or_else(|| ReadModelStoreError::MissingId {
        read_model_name: read_model_name.to_string(),
    })
}

impl ReadModelStore for PostgresReadModelStore {
    fn fetch<'a>(
        &'a self,
        read_model_name: &'a str,
        id: &'a ReadModelId,
        sequence_key: Option<&'a SequenceKey>,
    ) -> BoxFuture<'a, Result<Option<ReadModel>>> {
        Box::pin(async move {
            let rows: Vec<(Json<Value>,)> = match sequence_key {
                Some(key) => {
                    let query = format!(
                        "SELECT data FROM {}
                         WHERE read_model_name = $1 AND id = $2 AND sequence_value = $3",
                        self.table_name
                    );
                    sqlx::query_as(&query)
                        .bind(read_model_name)
                        .bind(id.as_str())
                        .bind(key.value.as_str())
                        .fetch_all(&self.pool)
                        .await
                },
                None => {
                    let query = format!(
                        "SELECT data FROM {} WHERE read_model_name = $1 AND id = $2",
                        self.table_name
                    );
                    sqlx::query_as(&query)
                        .bind(read_model_name)
                        .bind(id.as_str())
                        .fetch_all(&self.pool)
                        .await
                },
            }
            .map_err(|e| ReadModelStoreError::Storage(format!("Failed to fetch: {e}")))?;

            if rows.len() > 1 {
                return Err(ReadModelStoreError::MultipleObjectsFound {
                    read_model_name: read_model_name.to_string(),
                    id: id.clone(),
                    count: rows.len(),
                });
            }

            rows.into_iter()
                .next()
                .map(|(Json(data),)| ReadModel::from_json(data))
                .transpose()
                .map_err(ReadModelStoreError::from)
        })
    }

    fn search<'a>(
        &'a self,
        read_model_name: &'a str,
        filter: &'a ReadModelFilter,
    ) -> BoxFuture<'a, Result<Vec<ReadModel>>> {
        Box::pin(async move {
            let query = format!(
                "SELECT data FROM {} WHERE read_model_name = $1 AND data @> $2 ORDER BY id, sequence_value",
                self.table_name
            );

            let rows: Vec<(Json<Value>,)> = sqlx::query_as(&query)
                .bind(read_model_name)
                .bind(Json(filter.to_json_object()))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ReadModelStoreError::Storage(format!("Failed to search: {e}")))?;

            rows.into_iter()
                .map(|(Json(data),)| ReadModel::from_json(data).map_err(ReadModelStoreError::from))
                .collect()
        })
    }

    fn store<'a>(
        &'a self,
        read_model_name: &'a str,
        read_model: &'a ReadModel,
        sequence_key: Option<&'a SequenceKey>,
        expected_version: Version,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = require_id(read_model_name, read_model)?;
            let sequence_value = sequence_value(sequence_key);
            let version = to_column(read_model.version())?;
            let data = read_model.to_json()?;

            let affected = if expected_version == Version::INITIAL {
                self.insert_new(read_model_name, &id, sequence_value, version, data)
                    .await?
            } else {
                let expected = to_column(expected_version)?;
                self.update_expected(read_model_name, &id, sequence_value, version, expected, data)
                    .await?
            };

            if affected == 0 {
                return Err(ReadModelStoreError::OptimisticConcurrencyUnexpectedVersion {
                    read_model_name: read_model_name.to_string(),
                    id,
                    expected: expected_version,
                });
            }
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        read_model_name: &'a str,
        read_model: &'a ReadModel,
        sequence_key: Option<&'a SequenceKey>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = require_id(read_model_name, read_model)?;
            let query = format!(
                "DELETE FROM {} WHERE read_model_name = $1 AND id = $2 AND sequence_value = $3",
                self.table_name
            );

            sqlx::query(&query)
                .bind(read_model_name)
                .bind(id.as_str())
                .bind(sequence_value(sequence_key))
                .execute(&self.pool)
                .await
                .map_err(|e| ReadModelStoreError::Storage(format!("Failed to delete: {e}")))?;

            Ok(())
        })
    }
}
