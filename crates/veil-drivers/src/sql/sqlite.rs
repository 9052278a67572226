// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::{Column, Row, TypeInfo};
use veil_core::{
    ColumnInfo, ColumnMetadata, EngineError, EngineResult, MetadataProgress, Row as VRow,
    SqlDescriptor, SqlDialect, StreamEvent, StreamSender, TableMetadata, Value,
};

use super::{connect_error, forward_rows, pool_options, query_error, returns_rows};
use crate::catalog::{report_all, table_kind};

pub(super) async fn connect(descriptor: &SqlDescriptor) -> EngineResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(descriptor.url.expose())
        .map_err(|e| EngineError::validation(format!("Invalid SQLite URL: {e}")))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(30));

    let mut pool = pool_options(&descriptor.pool);
    if descriptor.is_in_memory() {
        // each connection would otherwise see its own empty database
        pool = pool
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>);
    }

    pool.connect_with(options).await.map_err(connect_error)
}

pub(super) async fn execute_stream(
    pool: &SqlitePool,
    sql: &str,
    sender: StreamSender,
) -> EngineResult<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| EngineError::connection_failed(e.to_string()))?;

    if !returns_rows(SqlDialect::Sqlite, sql) {
        let result = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql))
            .await
            .map_err(query_error)?;
        let _ = sender.send(StreamEvent::Done(result.rows_affected())).await;
        return Ok(());
    }

    let stream = sqlx::query(sql).fetch(&mut *conn);
    forward_rows(stream, &sender, column_info, convert_row).await
}

fn convert_row(row: &SqliteRow) -> VRow {
    VRow::new(
        row.columns()
            .iter()
            .map(|col| extract_value(row, col.ordinal()))
            .collect(),
    )
}

fn extract_value(row: &SqliteRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }

    Value::Null
}

fn column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

/// SQLite has a single `main` schema; columns come from `PRAGMA table_info`.
pub(super) async fn load_metadata(
    pool: &SqlitePool,
    progress: Option<MetadataProgress<'_>>,
) -> EngineResult<Vec<TableMetadata>> {
    let objects: Vec<(String, String)> = sqlx::query_as(
        "SELECT name, type FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .map_err(query_error)?;

    let mut tables = Vec::with_capacity(objects.len());
    for (name, object_type) in objects {
        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as(&pragma)
                .fetch_all(pool)
                .await
                .map_err(query_error)?;

        let mut table = TableMetadata::new("main", &name, table_kind(&object_type));
        table.columns = columns
            .into_iter()
            .map(|(_, column, data_type, not_null, _, _)| ColumnMetadata {
                name: column,
                data_type,
                nullable: not_null == 0,
                description: None,
            })
            .collect();
        tables.push(table);
    }

    report_all(&tables, progress);
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use veil_core::{BackendDriver, SampleRequest, SamplePayload};

    use crate::sql::SqlBackend;
    use super::*;

    async fn backend() -> SqlBackend {
        let descriptor = SqlDescriptor::from_url("sqlite::memory:").unwrap();
        let backend = SqlBackend::connect(&descriptor).await.unwrap();
        for sql in [
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT, score REAL)",
            "INSERT INTO users (name, email, score) VALUES ('ada', 'ada@example.com', 9.5), ('bob', NULL, 7.0)",
            "CREATE VIEW active_users AS SELECT id, name FROM users",
        ] {
            let (tx, _rx) = mpsc::channel(4);
            backend.execute_stream(sql, tx).await.unwrap();
        }
        backend
    }

    async fn drain(backend: &SqlBackend, sql: &str) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(16);
        backend.execute_stream(sql, tx).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_columns_then_rows() {
        let backend = backend().await;
        let events = drain(&backend, "SELECT id, name, email, score FROM users ORDER BY id").await;

        match &events[0] {
            StreamEvent::Columns(columns) => {
                let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
                assert_eq!(names, vec!["id", "name", "email", "score"]);
            }
            other => panic!("expected columns, got {other:?}"),
        }
        match &events[2] {
            StreamEvent::Row(row) => assert_eq!(
                row.values,
                vec![
                    Value::Int(2),
                    Value::Text("bob".into()),
                    Value::Null,
                    Value::Float(7.0)
                ]
            ),
            other => panic!("expected row, got {other:?}"),
        }
        assert!(matches!(events.last(), Some(StreamEvent::Done(2))));
    }

    #[tokio::test]
    async fn statements_without_rows_report_affected_count() {
        let backend = backend().await;
        let events = drain(&backend, "UPDATE users SET score = 0").await;
        assert!(matches!(events.as_slice(), [StreamEvent::Done(2)]));

        let events = drain(&backend, "CREATE TABLE audit (id INTEGER)").await;
        assert!(matches!(events.as_slice(), [StreamEvent::Done(0)]));
    }

    #[tokio::test]
    async fn syntax_errors_are_returned_before_streaming() {
        let backend = backend().await;
        let (tx, _rx) = mpsc::channel(4);
        let err = backend.execute_stream("SELEC * FROM users", tx).await.unwrap_err();
        assert!(matches!(err, EngineError::SyntaxError { .. }));
    }

    #[tokio::test]
    async fn metadata_lists_tables_and_views() {
        let backend = backend().await;
        let tables = backend.load_metadata().await.unwrap();

        let names: Vec<_> = tables.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(names, vec!["active_users", "users"]);
        assert!(tables[0].is_view);

        let users = &tables[1];
        assert_eq!(users.schema, "main");
        let name = users.columns.iter().find(|c| c.name == "name").unwrap();
        assert!(!name.nullable);
        assert_eq!(name.data_type, "TEXT");
    }

    #[tokio::test]
    async fn sample_returns_mapped_rows() {
        let backend = backend().await;
        let payload = backend
            .sample(&SampleRequest::new("main", "users", 1))
            .await;

        match payload {
            SamplePayload::Data {
                sample_query,
                sample_size,
                data,
                ..
            } => {
                assert_eq!(
                    sample_query,
                    r#"SELECT * FROM "main"."users" ORDER BY RANDOM() LIMIT 1"#
                );
                assert_eq!(sample_size, 1);
                assert!(data[0].contains_key("email"));
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sample_of_missing_table_is_reported_in_band() {
        let backend = backend().await;
        let payload = backend
            .sample(&SampleRequest::new("main", "missing", 5))
            .await;
        assert!(payload.is_error());
    }
}
