// SPDX-License-Identifier: Apache-2.0

use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo};
use veil_core::{
    ColumnInfo, EngineError, EngineResult, MetadataProgress, Row as VRow, SqlDescriptor,
    SqlDialect, StreamEvent, StreamSender, TableMetadata, Value,
};

use super::{connect_error, forward_rows, pool_options, query_error, returns_rows};
use crate::catalog::{group_tables, skip_schema_list, table_kind, CatalogRow};

pub(super) async fn connect(descriptor: &SqlDescriptor) -> EngineResult<PgPool> {
    pool_options(&descriptor.pool)
        .connect(descriptor.url.expose())
        .await
        .map_err(connect_error)
}

pub(super) async fn execute_stream(
    pool: &PgPool,
    sql: &str,
    sender: StreamSender,
) -> EngineResult<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| EngineError::connection_failed(e.to_string()))?;

    if !returns_rows(SqlDialect::Postgres, sql) {
        let result = sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        let _ = sender.send(StreamEvent::Done(result.rows_affected())).await;
        return Ok(());
    }

    let stream = sqlx::query(sql).fetch(&mut *conn);
    forward_rows(stream, &sender, column_info, convert_row).await
}

fn convert_row(pg_row: &PgRow) -> VRow {
    VRow::new(
        pg_row
            .columns()
            .iter()
            .map(|col| extract_value(pg_row, col.ordinal()))
            .collect(),
    )
}

fn extract_value(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
        return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<String>>, _>(idx) {
        return v
            .map(|items| Value::Array(items.into_iter().map(Value::Text).collect()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<i64>>, _>(idx) {
        return v
            .map(|items| Value::Array(items.into_iter().map(Value::Int).collect()))
            .unwrap_or(Value::Null);
    }

    Value::Null
}

fn column_info(row: &PgRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

type PgCatalogRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    bool,
    Option<String>,
);

/// Tables, views and materialized views with their columns and comments.
pub(super) async fn load_metadata(
    pool: &PgPool,
    progress: Option<MetadataProgress<'_>>,
) -> EngineResult<Vec<TableMetadata>> {
    let sql = format!(
        "SELECT n.nspname::text, c.relname::text, c.relkind::text, \
                obj_description(c.oid, 'pg_class'), \
                a.attname::text, format_type(a.atttypid, a.atttypmod), \
                NOT a.attnotnull, col_description(c.oid, a.attnum) \
         FROM pg_catalog.pg_class c \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid \
         WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f') \
           AND a.attnum > 0 AND NOT a.attisdropped \
           AND n.nspname NOT IN ({}) \
           AND n.nspname NOT LIKE 'pg_temp_%' \
           AND n.nspname NOT LIKE 'pg_toast_temp_%' \
         ORDER BY n.nspname, c.relname, a.attnum",
        skip_schema_list()
    );

    let rows: Vec<PgCatalogRow> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .map_err(query_error)?;

    let rows = rows
        .into_iter()
        .map(
            |(schema, table, relkind, table_comment, column, data_type, nullable, column_comment)| {
                CatalogRow {
                    schema,
                    table,
                    kind: table_kind(&relkind),
                    table_comment,
                    column,
                    data_type,
                    nullable,
                    column_comment,
                }
            },
        )
        .collect();

    Ok(group_tables(rows, progress))
}
