// SPDX-License-Identifier: Apache-2.0

//! Durable hash → token mapping.
//!
//! Both repositories write with `ON CONFLICT DO NOTHING`, so a concurrent
//! writer that got there first wins silently. Callers re-read to learn the
//! winning token.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Postgres, QueryBuilder, Sqlite};
use veil_core::{EngineError, EngineResult};

/// Rows per batched statement.
const BATCH_SIZE: usize = 500;

/// One persisted pseudonym.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudonymEntry {
    /// SHA-256 hex digest of the plaintext
    pub hash: String,
    pub token: String,
}

#[async_trait]
pub trait PseudonymRepository: Send + Sync {
    /// Creates the mapping table if it does not exist.
    async fn init_schema(&self) -> EngineResult<()>;

    /// Tokens already stored for `hashes`.
    async fn find(&self, hashes: &[String]) -> EngineResult<HashMap<String, String>>;

    /// Inserts `entries`, skipping any that conflict with an existing hash or token.
    async fn insert_missing(&self, entries: &[PseudonymEntry]) -> EngineResult<()>;
}

fn store_error(e: sqlx::Error) -> EngineError {
    EngineError::store(e.to_string())
}

pub struct SqlitePseudonymRepository {
    pool: SqlitePool,
}

impl SqlitePseudonymRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `url` and its table.
    pub async fn open(url: &str) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| EngineError::validation(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));
        let mut pool = SqlitePoolOptions::new().max_connections(4);
        if url.contains(":memory:") {
            pool = pool
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }
        let pool = pool.connect_with(options).await.map_err(store_error)?;

        let repository = Self::new(pool);
        repository.init_schema().await?;
        Ok(repository)
    }
}

#[async_trait]
impl PseudonymRepository for SqlitePseudonymRepository {
    async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sensitive_data_mapping (\
                hash TEXT PRIMARY KEY, \
                generated_id TEXT NOT NULL UNIQUE, \
                created_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn find(&self, hashes: &[String]) -> EngineResult<HashMap<String, String>> {
        let mut found = HashMap::with_capacity(hashes.len());
        for chunk in hashes.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT hash, generated_id FROM sensitive_data_mapping WHERE hash IN (",
            );
            let mut separated = builder.separated(", ");
            for hash in chunk {
                separated.push_bind(hash);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String, String)> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(store_error)?;
            found.extend(rows);
        }
        Ok(found)
    }

    async fn insert_missing(&self, entries: &[PseudonymEntry]) -> EngineResult<()> {
        let now = Utc::now();
        for chunk in entries.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO sensitive_data_mapping (hash, generated_id, created_at) ",
            );
            builder.push_values(chunk, |mut row, entry| {
                row.push_bind(&entry.hash)
                    .push_bind(&entry.token)
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }
}

pub struct PostgresPseudonymRepository {
    pool: PgPool,
}

impl PostgresPseudonymRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PseudonymRepository for PostgresPseudonymRepository {
    async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sensitive_data_mapping (\
                hash VARCHAR(64) PRIMARY KEY, \
                generated_id VARCHAR(16) NOT NULL UNIQUE, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        )
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn find(&self, hashes: &[String]) -> EngineResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT hash, generated_id FROM sensitive_data_mapping WHERE hash = ANY($1)",
        )
        .bind(hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_missing(&self, entries: &[PseudonymEntry]) -> EngineResult<()> {
        let now = Utc::now();
        for chunk in entries.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO sensitive_data_mapping (hash, generated_id, created_at) ",
            );
            builder.push_values(chunk, |mut row, entry| {
                row.push_bind(&entry.hash)
                    .push_bind(&entry.token)
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }
}
