// SPDX-License-Identifier: Apache-2.0

use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use veil_core::{
    ColumnInfo, EngineError, EngineResult, MetadataProgress, Row as VRow, SqlDescriptor,
    SqlDialect, StreamEvent, StreamSender, TableMetadata, Value,
};

use super::{connect_error, forward_rows, pool_options, query_error, returns_rows};
use crate::catalog::{group_tables, skip_schema_list, table_kind, CatalogRow};

pub(super) async fn connect(descriptor: &SqlDescriptor) -> EngineResult<MySqlPool> {
    pool_options(&descriptor.pool)
        .connect(descriptor.url.expose())
        .await
        .map_err(connect_error)
}

pub(super) async fn execute_stream(
    pool: &MySqlPool,
    sql: &str,
    sender: StreamSender,
) -> EngineResult<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| EngineError::connection_failed(e.to_string()))?;

    if !returns_rows(SqlDialect::Mysql, sql) {
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

fn convert_row(row: &MySqlRow) -> VRow {
    VRow::new(
        row.columns()
            .iter()
            .map(|col| extract_value(row, col.ordinal()))
            .collect(),
    )
}

fn extract_value(row: &MySqlRow, idx: usize) -> Value {
    // BIGINT UNSIGNED before the signed types
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v
            .map(|u| i64::try_from(u).map(Value::Int).unwrap_or(Value::Text(u.to_string())))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
        return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
        return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
        return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
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
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        // text returned with a binary collation
        return v
            .map(|bytes| match String::from_utf8(bytes) {
                Ok(text) => Value::Text(text),
                Err(e) => Value::Bytes(e.into_bytes()),
            })
            .unwrap_or(Value::Null);
    }

    Value::Null
}

fn column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

type MySqlCatalogRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    Option<String>,
);

pub(super) async fn load_metadata(
    pool: &MySqlPool,
    progress: Option<MetadataProgress<'_>>,
) -> EngineResult<Vec<TableMetadata>> {
    // information_schema columns decode as binary on some servers
    let sql = format!(
        "SELECT CAST(c.TABLE_SCHEMA AS CHAR), CAST(c.TABLE_NAME AS CHAR), \
                CAST(t.TABLE_TYPE AS CHAR), CAST(t.TABLE_COMMENT AS CHAR), \
                CAST(c.COLUMN_NAME AS CHAR), CAST(c.COLUMN_TYPE AS CHAR), \
                CAST(c.IS_NULLABLE = 'YES' AS SIGNED), CAST(c.COLUMN_COMMENT AS CHAR) \
         FROM information_schema.COLUMNS c \
         JOIN information_schema.TABLES t \
           ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
         WHERE c.TABLE_SCHEMA NOT IN ({}) \
         ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION",
        skip_schema_list()
    );

    let rows: Vec<MySqlCatalogRow> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .map_err(query_error)?;

    let rows = rows
        .into_iter()
        .map(
            |(schema, table, table_type, table_comment, column, data_type, nullable, column_comment)| {
                CatalogRow {
                    schema,
                    table,
                    kind: table_kind(&table_type),
                    table_comment,
                    column,
                    data_type,
                    nullable: nullable != 0,
                    column_comment,
                }
            },
        )
        .collect();

    Ok(group_tables(rows, progress))
}
