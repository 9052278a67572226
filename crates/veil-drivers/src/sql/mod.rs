// SPDX-License-Identifier: Apache-2.0

//! Connection-URL backends (Postgres, MySQL, SQLite) on SQLx pools.

mod mysql;
mod postgres;
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use sqlx::mysql::MySqlPool;
use sqlx::pool::PoolOptions;
use sqlx::postgres::PgPool;
use sqlx::sqlite::SqlitePool;
use tracing::{info, instrument};
use veil_core::{
    BackendDriver, ColumnInfo, EngineError, EngineResult, MetadataProgress, PoolSettings, Row,
    SqlDescriptor, SqlDialect, StreamEvent, StreamSender, TableMetadata,
};

pub enum SqlPool {
    Postgres(PgPool),
    Mysql(MySqlPool),
    Sqlite(SqlitePool),
}

/// Pooled connection to a Postgres, MySQL or SQLite database.
pub struct SqlBackend {
    dialect: SqlDialect,
    pool: SqlPool,
}

impl SqlBackend {
    /// Opens the pool and verifies one connection.
    #[instrument(skip(descriptor), fields(dialect = descriptor.dialect.name()))]
    pub async fn connect(descriptor: &SqlDescriptor) -> EngineResult<Self> {
        let pool = match descriptor.dialect {
            SqlDialect::Postgres => SqlPool::Postgres(postgres::connect(descriptor).await?),
            SqlDialect::Mysql => SqlPool::Mysql(mysql::connect(descriptor).await?),
            SqlDialect::Sqlite => SqlPool::Sqlite(sqlite::connect(descriptor).await?),
        };
        info!("SQL backend connected");
        Ok(Self {
            dialect: descriptor.dialect,
            pool,
        })
    }

    pub fn pool(&self) -> &SqlPool {
        &self.pool
    }
}

#[async_trait]
impl BackendDriver for SqlBackend {
    fn dialect(&self) -> &'static str {
        self.dialect.name()
    }

    fn quote_ident(&self, ident: &str) -> String {
        match self.dialect {
            SqlDialect::Mysql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    fn random_function(&self) -> &'static str {
        match self.dialect {
            SqlDialect::Mysql => "RAND()",
            _ => "RANDOM()",
        }
    }

    async fn load_metadata_with_progress(
        &self,
        progress: Option<MetadataProgress<'_>>,
    ) -> EngineResult<Vec<TableMetadata>> {
        match &self.pool {
            SqlPool::Postgres(pool) => postgres::load_metadata(pool, progress).await,
            SqlPool::Mysql(pool) => mysql::load_metadata(pool, progress).await,
            SqlPool::Sqlite(pool) => sqlite::load_metadata(pool, progress).await,
        }
    }

    async fn execute_stream(&self, sql: &str, sender: StreamSender) -> EngineResult<()> {
        match &self.pool {
            SqlPool::Postgres(pool) => postgres::execute_stream(pool, sql, sender).await,
            SqlPool::Mysql(pool) => mysql::execute_stream(pool, sql, sender).await,
            SqlPool::Sqlite(pool) => sqlite::execute_stream(pool, sql, sender).await,
        }
    }

    async fn close(&self) {
        match &self.pool {
            SqlPool::Postgres(pool) => pool.close().await,
            SqlPool::Mysql(pool) => pool.close().await,
            SqlPool::Sqlite(pool) => pool.close().await,
        }
    }
}

/// Pool options shared by every dialect.
fn pool_options<DB: sqlx::Database>(settings: &PoolSettings) -> PoolOptions<DB> {
    PoolOptions::<DB>::new()
        .max_connections(settings.max_connections.max(1))
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .idle_timeout(settings.idle_timeout_secs.map(Duration::from_secs))
        .max_lifetime(settings.max_lifetime_secs.map(Duration::from_secs))
        .test_before_acquire(settings.test_before_acquire)
}

fn connect_error(e: sqlx::Error) -> EngineError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("password authentication failed") || lower.contains("access denied") {
        EngineError::auth_failed(msg)
    } else {
        EngineError::connection_failed(msg)
    }
}

fn query_error(e: sqlx::Error) -> EngineError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            EngineError::connection_failed(e.to_string())
        }
        other => {
            let msg = other.to_string();
            if msg.to_lowercase().contains("syntax") {
                EngineError::syntax_error(msg)
            } else {
                EngineError::execution_error(msg)
            }
        }
    }
}

/// Forwards fetched rows to `sender`, the column header first.
///
/// A failure before the first row is the query's error. A later one is sent
/// in-band so the rows already read are kept. A closed receiver stops the
/// fetch quietly.
async fn forward_rows<R, S>(
    mut stream: S,
    sender: &StreamSender,
    column_info: fn(&R) -> Vec<ColumnInfo>,
    convert_row: fn(&R) -> Row,
) -> EngineResult<()>
where
    S: Stream<Item = Result<R, sqlx::Error>> + Unpin,
{
    let mut columns_sent = false;
    let mut row_count = 0;

    while let Some(item) = stream.next().await {
        match item {
            Ok(row) => {
                if !columns_sent {
                    if sender.send(StreamEvent::Columns(column_info(&row))).await.is_err() {
                        return Ok(());
                    }
                    columns_sent = true;
                }
                if sender.send(StreamEvent::Row(convert_row(&row))).await.is_err() {
                    return Ok(());
                }
                row_count += 1;
            }
            Err(e) if row_count == 0 => return Err(query_error(e)),
            Err(e) => {
                let _ = sender
                    .send(StreamEvent::Error(format!(
                        "Failed while fetching row {}: {e}",
                        row_count + 1
                    )))
                    .await;
                return Ok(());
            }
        }
    }

    let _ = sender.send(StreamEvent::Done(row_count)).await;
    Ok(())
}

/// Whether to stream rows or run the statement for its affected-row count.
fn returns_rows(dialect: SqlDialect, sql: &str) -> bool {
    veil_sql::returns_rows(dialect.name(), sql).unwrap_or_else(|_| veil_sql::is_select_prefix(sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use veil_core::Value;

    fn columns(_: &i64) -> Vec<ColumnInfo> {
        vec![ColumnInfo::new("n", "INTEGER")]
    }

    fn convert(n: &i64) -> Row {
        Row::new(vec![Value::Int(*n)])
    }

    async fn forward(items: Vec<Result<i64, sqlx::Error>>) -> (EngineResult<()>, Vec<StreamEvent>) {
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = forward_rows(futures::stream::iter(items), &tx, columns, convert).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn failure_before_any_row_is_the_query_error() {
        let (outcome, events) = forward(vec![Err(sqlx::Error::RowNotFound)]).await;
        assert!(outcome.is_err());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn later_failure_keeps_the_rows_read() {
        let (outcome, events) = forward(vec![Ok(1), Ok(2), Err(sqlx::Error::RowNotFound)]).await;
        assert!(outcome.is_ok());
        assert!(matches!(events[0], StreamEvent::Columns(ref c) if c.len() == 1));
        assert_eq!(events.len(), 4);
        assert!(matches!(events[3], StreamEvent::Error(ref msg) if msg.contains("row 3")));
    }
}
