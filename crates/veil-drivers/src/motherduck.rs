// SPDX-License-Identifier: Apache-2.0

//! MotherDuck backend on the native `duckdb` crate.
//!
//! With a token the connection targets `md:{database}`; without one it opens
//! a local DuckDB file or `:memory:`. The `duckdb` API is synchronous, so all
//! work runs in `spawn_blocking` behind a `std::sync::Mutex` (the connection
//! is `Send` but `!Sync`). Rows are pushed with `blocking_send` as they are
//! read, so a dropped receiver stops the scan.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::Connection;
use tracing::{info, instrument};
use veil_core::{
    BackendDriver, ColumnInfo, EngineError, EngineResult, MetadataProgress, MotherDuckDescriptor,
    Row as VRow, StreamEvent, StreamSender, TableMetadata, Value,
};

use crate::catalog::{group_tables, skip_schema_list, table_kind, CatalogRow};

pub struct MotherDuckBackend {
    conn: Arc<Mutex<Connection>>,
    database: String,
}

impl MotherDuckBackend {
    #[instrument(skip(descriptor), fields(database = %descriptor.database, cloud = descriptor.token.is_some()))]
    pub async fn connect(descriptor: &MotherDuckDescriptor) -> EngineResult<Self> {
        let target = descriptor.open_target();
        let token = descriptor.token.as_ref().map(|t| t.expose().clone());
        let conn = tokio::task::spawn_blocking(move || open_connection(&target))
            .await
            .map_err(|e| EngineError::internal(format!("DuckDB task panicked: {e}")))?
            .map_err(|e| redact_token(e, token.as_deref()))?;

        info!("MotherDuck backend connected");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            database: descriptor.database.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Runs a synchronous closure on the connection inside spawn_blocking.
    async fn with_conn<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Connection) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| {
                EngineError::internal(format!("Failed to lock DuckDB connection: {e}"))
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| EngineError::internal(format!("DuckDB task panicked: {e}")))?
    }
}

fn open_connection(target: &str) -> EngineResult<Connection> {
    let result = if target.is_empty() || target == ":memory:" {
        Connection::open_in_memory()
    } else {
        Connection::open(target)
    };
    result.map_err(|e| EngineError::connection_failed(e.to_string()))
}

fn redact_token(err: EngineError, token: Option<&str>) -> EngineError {
    match (err, token) {
        (EngineError::ConnectionFailed { message }, Some(token)) if !token.is_empty() => {
            EngineError::connection_failed(message.replace(token, "***"))
        }
        (err, _) => err,
    }
}

fn classify_error(msg: String) -> EngineError {
    let lower = msg.to_lowercase();
    if lower.contains("syntax") || lower.contains("parser") {
        EngineError::syntax_error(msg)
    } else {
        EngineError::execution_error(msg)
    }
}

fn extract_value(row: &duckdb::Row<'_>, idx: usize) -> Value {
    match row.get::<_, DuckValue>(idx) {
        Ok(value) => convert_value(value),
        Err(_) => Value::Null,
    }
}

fn convert_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i as i64),
        DuckValue::SmallInt(i) => Value::Int(i as i64),
        DuckValue::Int(i) => Value::Int(i as i64),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(i.to_string())),
        DuckValue::UTinyInt(u) => Value::Int(u as i64),
        DuckValue::USmallInt(u) => Value::Int(u as i64),
        DuckValue::UInt(u) => Value::Int(u as i64),
        DuckValue::UBigInt(u) => i64::try_from(u)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(u.to_string())),
        DuckValue::Float(f) => Value::Float(f as f64),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => Value::Text(d.to_string()),
        DuckValue::Text(s) => Value::Text(s),
        DuckValue::Enum(s) => Value::Text(s),
        DuckValue::Blob(b) => Value::Bytes(b),
        DuckValue::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Timestamp(unit, raw) => DateTime::from_timestamp_micros(to_micros(unit, raw))
            .map(|dt| Value::Text(dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(convert_value).collect())
        }
        other => Value::Text(format!("{other:?}")),
    }
}

fn to_micros(unit: TimeUnit, raw: i64) -> i64 {
    match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    }
}

fn stream_rows(conn: &Connection, sql: &str, sender: &StreamSender) -> EngineResult<()> {
    let mut stmt = conn.prepare(sql).map_err(|e| classify_error(e.to_string()))?;
    let mut rows = stmt.query([]).map_err(|e| classify_error(e.to_string()))?;
    let mut columns_sent = false;
    let mut row_count = 0u64;

    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) if row_count == 0 => return Err(classify_error(e.to_string())),
            Err(e) => {
                let _ = sender.blocking_send(StreamEvent::Error(format!(
                    "Failed while fetching row {}: {e}",
                    row_count + 1
                )));
                return Ok(());
            }
        };

        // column_count/column_name panic before execution; the row's statement has run
        let statement = row.as_ref();
        let column_count = statement.column_count();
        if !columns_sent {
            if sender
                .blocking_send(StreamEvent::Columns(column_info(statement, column_count)))
                .is_err()
            {
                return Ok(());
            }
            columns_sent = true;
        }

        let values = (0..column_count).map(|i| extract_value(row, i)).collect();
        if sender.blocking_send(StreamEvent::Row(VRow::new(values))).is_err() {
            return Ok(());
        }
        row_count += 1;
    }
    drop(rows);

    if !columns_sent {
        let columns = column_info(&stmt, stmt.column_count());
        if sender.blocking_send(StreamEvent::Columns(columns)).is_err() {
            return Ok(());
        }
    }

    let _ = sender.blocking_send(StreamEvent::Done(row_count));
    Ok(())
}

fn column_info(statement: &duckdb::Statement<'_>, count: usize) -> Vec<ColumnInfo> {
    (0..count)
        .map(|i| {
            let name = statement
                .column_name(i)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| format!("col_{i}"));
            ColumnInfo::new(name, statement.column_type(i).to_string())
        })
        .collect()
}

#[async_trait]
impl BackendDriver for MotherDuckBackend {
    fn dialect(&self) -> &'static str {
        "motherduck"
    }

    async fn load_metadata_with_progress(
        &self,
        progress: Option<MetadataProgress<'_>>,
    ) -> EngineResult<Vec<TableMetadata>> {
        let sql = format!(
            "SELECT c.table_schema, c.table_name, t.table_type, \
                    c.column_name, c.data_type, c.is_nullable = 'YES' \
             FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON t.table_catalog = c.table_catalog \
              AND t.table_schema = c.table_schema \
              AND t.table_name = c.table_name \
             WHERE c.table_catalog = current_database() \
               AND c.table_schema NOT IN ({}) \
             ORDER BY c.table_schema, c.table_name, c.ordinal_position",
            skip_schema_list()
        );

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| classify_error(e.to_string()))?;
                let mapped = stmt
                    .query_map([], |row| {
                        let table_type: String = row.get(2)?;
                        Ok(CatalogRow {
                            schema: row.get(0)?,
                            table: row.get(1)?,
                            kind: table_kind(&table_type),
                            table_comment: None,
                            column: row.get(3)?,
                            data_type: row.get(4)?,
                            nullable: row.get(5)?,
                            column_comment: None,
                        })
                    })
                    .map_err(|e| classify_error(e.to_string()))?;

                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(|e| EngineError::execution_error(e.to_string()))?);
                }
                Ok(rows)
            })
            .await?;

        Ok(group_tables(rows, progress))
    }

    async fn execute_stream(&self, sql: &str, sender: StreamSender) -> EngineResult<()> {
        let sql = sql.to_string();
        let returns_rows = veil_sql::returns_rows("duckdb", &sql)
            .unwrap_or_else(|_| veil_sql::is_select_prefix(&sql));

        self.with_conn(move |conn| {
            if !returns_rows {
                let affected = conn
                    .execute(&sql, [])
                    .map_err(|e| classify_error(e.to_string()))?;
                let _ = sender.blocking_send(StreamEvent::Done(affected as u64));
                return Ok(());
            }
            stream_rows(conn, &sql, &sender)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::{collect_rows, SamplePayload, SampleRequest, TableKind};

    async fn memory_backend() -> MotherDuckBackend {
        let backend = MotherDuckBackend::connect(&MotherDuckDescriptor::local(":memory:"))
            .await
            .unwrap();
        for sql in [
            "CREATE TABLE users (id INTEGER, email VARCHAR, score DOUBLE, joined DATE)",
            "INSERT INTO users VALUES (1, 'a@x.io', 1.5, DATE '2024-01-02'), (2, 'b@x.io', NULL, NULL)",
            "CREATE VIEW active AS SELECT id FROM users",
        ] {
            let (tx, _rx) = tokio::sync::mpsc::channel(4);
            backend.execute_stream(sql, tx).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn streams_typed_rows() {
        let backend = memory_backend().await;
        let (columns, rows) = collect_rows(&backend, "SELECT * FROM users ORDER BY id", 10)
            .await
            .unwrap();
        assert_eq!(columns, vec!["id", "email", "score", "joined"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["email"], "a@x.io");
        assert_eq!(rows[0]["joined"], "2024-01-02");
        assert!(rows[1]["score"].is_null());
    }

    #[tokio::test]
    async fn metadata_lists_tables_and_views() {
        let backend = memory_backend().await;
        let tables = backend.load_metadata().await.unwrap();
        let users = tables.iter().find(|t| t.table == "users").unwrap();
        assert_eq!(users.schema, "main");
        assert_eq!(users.kind, TableKind::Table);
        assert_eq!(users.columns.len(), 4);
        let active = tables.iter().find(|t| t.table == "active").unwrap();
        assert!(active.is_view);
    }

    #[tokio::test]
    async fn sample_uses_random_ordering() {
        let backend = memory_backend().await;
        let payload = backend.sample(&SampleRequest::new("main", "users", 1)).await;
        match payload {
            SamplePayload::Data {
                sample_query,
                sample_size,
                ..
            } => {
                assert_eq!(
                    sample_query,
                    r#"SELECT * FROM "main"."users" ORDER BY RANDOM() LIMIT 1"#
                );
                assert_eq!(sample_size, 1);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_scan() {
        let backend = memory_backend().await;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        backend
            .execute_stream("SELECT * FROM range(1000000)", tx)
            .await
            .unwrap();
    }
}
