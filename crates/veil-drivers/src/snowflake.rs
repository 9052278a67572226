// SPDX-License-Identifier: Apache-2.0

//! Snowflake backend over the SQL API (`/api/v2/statements`).
//!
//! Statements are submitted synchronously; when Snowflake answers `202` the
//! handle is polled until the statement finishes or the timeout elapses.
//! Results arrive in partitions which are fetched one at a time, so a closed
//! receiver stops further downloads.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime};
use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use veil_core::{
    BackendDriver, ColumnInfo, ColumnMetadata, EngineError, EngineResult, MetadataProgress, Row,
    SnowflakeDescriptor, StreamEvent, StreamSender, TableKind, TableMetadata, Value,
};

use crate::catalog::{comment, table_kind};
use crate::http::{build_client, decode, transport_error};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    stats: Option<StatementStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    scale: Option<i64>,
    #[serde(default = "nullable_default")]
    nullable: bool,
}

fn nullable_default() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementStats {
    #[serde(default)]
    num_rows_inserted: u64,
    #[serde(default)]
    num_rows_updated: u64,
    #[serde(default)]
    num_rows_deleted: u64,
}

impl StatementStats {
    fn affected(&self) -> u64 {
        self.num_rows_inserted + self.num_rows_updated + self.num_rows_deleted
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartitionResponse {
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

fn error_message(body: &serde_json::Value) -> Option<String> {
    body.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

/// A table found by `SHOW TABLES` / `SHOW VIEWS`, before its columns are loaded.
#[derive(Debug, Clone)]
struct TableEntry {
    schema: String,
    name: String,
    kind: TableKind,
    comment: Option<String>,
}

pub struct SnowflakeBackend {
    client: Client,
    descriptor: SnowflakeDescriptor,
}

impl SnowflakeBackend {
    /// Builds the HTTP client and runs `SELECT 1` to validate the token.
    #[instrument(skip(descriptor), fields(account = %descriptor.account, database = %descriptor.database))]
    pub async fn connect(descriptor: &SnowflakeDescriptor) -> EngineResult<Self> {
        let backend = Self {
            client: build_client(descriptor.statement_timeout_secs)?,
            descriptor: descriptor.clone(),
        };
        backend.submit("SELECT 1").await?;
        info!("Snowflake backend connected");
        Ok(backend)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(self.descriptor.token.expose())
            .header(TOKEN_TYPE_HEADER, self.descriptor.token_type.header_value())
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn statements_url(&self) -> String {
        format!(
            "{}/api/v2/statements",
            self.descriptor.endpoint().trim_end_matches('/')
        )
    }

    fn statement_body(&self, sql: &str) -> serde_json::Value {
        let mut body = json!({
            "statement": sql,
            "timeout": self.descriptor.statement_timeout_secs,
            "database": self.descriptor.database,
        });
        let optional = [
            ("schema", &self.descriptor.schema),
            ("warehouse", &self.descriptor.warehouse),
            ("role", &self.descriptor.role),
        ];
        for (key, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                body[key] = json!(value);
            }
        }
        body
    }

    /// Submits a statement and waits for its first partition.
    async fn submit(&self, sql: &str) -> EngineResult<StatementResponse> {
        let response = self
            .authorized(self.client.post(self.statements_url()))
            .json(&self.statement_body(sql))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body: StatementResponse = decode(response, error_message).await?;
        if status != StatusCode::ACCEPTED {
            return Ok(body);
        }

        let handle = body.statement_handle.ok_or_else(|| {
            EngineError::execution_error("Snowflake accepted the statement without a handle")
        })?;
        self.poll(&handle).await
    }

    async fn poll(&self, handle: &str) -> EngineResult<StatementResponse> {
        let timeout_ms = self.descriptor.statement_timeout_secs.saturating_mul(1000);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let url = format!("{}/{handle}", self.statements_url());

        loop {
            if Instant::now() >= deadline {
                return Err(EngineError::timeout(timeout_ms));
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let response = self
                .authorized(self.client.get(&url))
                .send()
                .await
                .map_err(transport_error)?;
            let status = response.status();
            let body: StatementResponse = decode(response, error_message).await?;
            if status != StatusCode::ACCEPTED {
                return Ok(body);
            }
            debug!(handle, "Snowflake statement still running");
        }
    }

    async fn partition(&self, handle: &str, index: usize) -> EngineResult<Vec<Vec<Option<String>>>> {
        let response = self
            .authorized(self.client.get(format!("{}/{handle}", self.statements_url())))
            .query(&[("partition", index)])
            .send()
            .await
            .map_err(transport_error)?;
        let body: PartitionResponse = decode(response, error_message).await?;
        Ok(body.data)
    }

    /// Runs a statement and returns every row as a name-to-text map.
    async fn query_maps(&self, sql: &str) -> EngineResult<Vec<HashMap<String, Option<String>>>> {
        let response = self.submit(sql).await?;
        let meta = response.result_set_meta_data.unwrap_or_default();
        let names: Vec<String> = meta.row_type.iter().map(|c| c.name.to_lowercase()).collect();

        let mut raw_rows = response.data.unwrap_or_default();
        if let Some(handle) = response.statement_handle.as_deref() {
            for index in 1..meta.partition_info.len() {
                raw_rows.extend(self.partition(handle, index).await?);
            }
        }

        Ok(raw_rows
            .into_iter()
            .map(|cells| names.iter().cloned().zip(cells).collect())
            .collect())
    }

    async fn list_tables(&self) -> EngineResult<Vec<TableEntry>> {
        let database = self.quote_ident(&self.descriptor.database);
        let schemas = self
            .query_maps(&format!("SHOW SCHEMAS IN DATABASE {database}"))
            .await?;

        let mut entries = Vec::new();
        for schema in schemas.iter().filter_map(|row| text(row, "name")) {
            if schema.eq_ignore_ascii_case("INFORMATION_SCHEMA") {
                continue;
            }
            let scope = format!("{database}.{}", self.quote_ident(&schema));

            match self.query_maps(&format!("SHOW TABLES IN SCHEMA {scope}")).await {
                Ok(rows) => entries.extend(rows.iter().filter_map(|row| {
                    Some(TableEntry {
                        schema: schema.clone(),
                        name: text(row, "name")?,
                        kind: text(row, "kind").map_or(TableKind::Table, |k| table_kind(&k)),
                        comment: comment(text(row, "comment")),
                    })
                })),
                Err(e) => warn!(schema = %schema, error = %e, "Failed to list tables"),
            }

            match self.query_maps(&format!("SHOW VIEWS IN SCHEMA {scope}")).await {
                Ok(rows) => entries.extend(rows.iter().filter_map(|row| {
                    let materialized = text(row, "is_materialized").is_some_and(|m| m == "true");
                    Some(TableEntry {
                        schema: schema.clone(),
                        name: text(row, "name")?,
                        kind: if materialized {
                            TableKind::MaterializedView
                        } else {
                            TableKind::View
                        },
                        comment: comment(text(row, "comment")),
                    })
                })),
                Err(e) => warn!(schema = %schema, error = %e, "Failed to list views"),
            }
        }
        Ok(entries)
    }

    async fn table_metadata(&self, entry: TableEntry) -> EngineResult<TableMetadata> {
        let target = format!(
            "{}.{}.{}",
            self.quote_ident(&self.descriptor.database),
            self.quote_ident(&entry.schema),
            self.quote_ident(&entry.name)
        );
        let rows = self
            .query_maps(&format!("SHOW COLUMNS IN TABLE {target}"))
            .await?;

        let mut table = TableMetadata::new(&entry.schema, &entry.name, entry.kind);
        table.description = entry.comment;
        table.columns = rows
            .iter()
            .filter_map(|row| {
                let (data_type, nullable) = parse_column_type(text(row, "data_type").as_deref());
                Some(ColumnMetadata {
                    name: text(row, "column_name")?,
                    data_type,
                    nullable,
                    description: comment(text(row, "comment")),
                })
            })
            .collect();
        Ok(table)
    }
}

fn text(row: &HashMap<String, Option<String>>, key: &str) -> Option<String> {
    row.get(key).cloned().flatten()
}

/// `SHOW COLUMNS` reports the type as a JSON document such as
/// `{"type":"TEXT","length":16777216,"nullable":true}`.
fn parse_column_type(raw: Option<&str>) -> (String, bool) {
    let Some(raw) = raw else {
        return ("UNKNOWN".to_string(), true);
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(doc) => (
            doc.get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("UNKNOWN")
                .to_string(),
            doc.get("nullable").and_then(|n| n.as_bool()).unwrap_or(true),
        ),
        Err(_) => (raw.to_string(), true),
    }
}

/// Converts one JSONv2 cell according to its declared column type.
fn convert_cell(cell: Option<String>, column: &RowType) -> Value {
    let Some(raw) = cell else {
        return Value::Null;
    };
    match column.kind.to_ascii_lowercase().as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => raw
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or(Value::Text(raw)),
        "real" | "float" | "double" => raw
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Text(raw)),
        "boolean" => Value::Bool(raw.eq_ignore_ascii_case("true") || raw == "1"),
        "variant" | "object" | "array" => serde_json::from_str(&raw)
            .map(Value::Json)
            .unwrap_or(Value::Text(raw)),
        "date" => raw
            .parse::<i64>()
            .ok()
            .and_then(|days| {
                NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(chrono::Duration::days(days))
            })
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Text(raw)),
        "time" => epoch_parts(&raw)
            .and_then(|(secs, nanos)| {
                NaiveTime::from_num_seconds_from_midnight_opt(u32::try_from(secs).ok()?, nanos)
            })
            .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Text(raw)),
        "timestamp_ntz" | "timestamp_ltz" | "timestamp_tz" => epoch_parts(&raw)
            .and_then(|(secs, nanos)| DateTime::from_timestamp(secs, nanos))
            .map(|dt| Value::Text(dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Text(raw)),
        _ => Value::Text(raw),
    }
}

/// Splits `"1700000000.123456789"` (optionally followed by a TZ offset) into
/// seconds and nanoseconds. The fraction has the sign of the whole value, so
/// `"-1.5"` is `(-2, 500_000_000)`.
fn epoch_parts(raw: &str) -> Option<(i64, u32)> {
    const NANOS_PER_SEC: i128 = 1_000_000_000;

    let value = raw.split_whitespace().next()?;
    let (negative, unsigned) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (secs, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if secs.starts_with(['-', '+']) {
        return None;
    }
    let secs = secs.parse::<u64>().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse::<u32>().ok()?
    };

    let magnitude = i128::from(secs) * NANOS_PER_SEC + i128::from(nanos);
    let total = if negative { -magnitude } else { magnitude };
    let secs = i64::try_from(total.div_euclid(NANOS_PER_SEC)).ok()?;
    let nanos = u32::try_from(total.rem_euclid(NANOS_PER_SEC)).ok()?;
    Some((secs, nanos))
}

fn column_info(row_type: &[RowType]) -> Vec<ColumnInfo> {
    row_type
        .iter()
        .map(|c| ColumnInfo {
            name: c.name.clone(),
            data_type: c.kind.to_uppercase(),
            nullable: c.nullable,
        })
        .collect()
}

async fn send_rows(
    sender: &StreamSender,
    row_type: &[RowType],
    rows: Vec<Vec<Option<String>>>,
    sent: &mut u64,
) -> bool {
    for cells in rows {
        let values = cells
            .into_iter()
            .zip(row_type)
            .map(|(cell, column)| convert_cell(cell, column))
            .collect();
        if sender.send(StreamEvent::Row(Row::new(values))).await.is_err() {
            return false;
        }
        *sent += 1;
    }
    true
}

#[async_trait]
impl BackendDriver for SnowflakeBackend {
    fn dialect(&self) -> &'static str {
        "snowflake"
    }

    async fn load_metadata_with_progress(
        &self,
        progress: Option<MetadataProgress<'_>>,
    ) -> EngineResult<Vec<TableMetadata>> {
        let mut entries = self.list_tables().await?;
        let limit = self.descriptor.max_metadata_tables;
        if entries.len() > limit {
            warn!(
                found = entries.len(),
                limit, "Snowflake metadata truncated to the configured table limit"
            );
            entries.truncate(limit);
        }

        let total = entries.len();
        info!(total, "Loading Snowflake column metadata");
        let mut pending = stream::iter(entries)
            .map(|entry| async move {
                let name = format!("{}.{}", entry.schema, entry.name);
                (name, self.table_metadata(entry).await)
            })
            .buffered(self.descriptor.metadata_concurrency.max(1));

        let mut tables = Vec::with_capacity(total);
        let mut current = 0;
        while let Some((name, result)) = pending.next().await {
            current += 1;
            match result {
                Ok(table) => tables.push(table),
                Err(e) => warn!(table = %name, error = %e, "Failed to load table metadata"),
            }
            if let Some(progress) = progress {
                progress(current, total, &name);
            }
        }
        Ok(tables)
    }

    async fn execute_stream(&self, sql: &str, sender: StreamSender) -> EngineResult<()> {
        let response = self.submit(sql).await?;

        if !veil_sql::returns_rows("snowflake", sql).unwrap_or(true) {
            let affected = response.stats.as_ref().map_or(0, StatementStats::affected);
            let _ = sender.send(StreamEvent::Done(affected)).await;
            return Ok(());
        }

        let meta = response.result_set_meta_data.unwrap_or_default();
        if sender
            .send(StreamEvent::Columns(column_info(&meta.row_type)))
            .await
            .is_err()
        {
            return Ok(());
        }

        let mut sent = 0u64;
        let first = response.data.unwrap_or_default();
        if !send_rows(&sender, &meta.row_type, first, &mut sent).await {
            return Ok(());
        }

        if let Some(handle) = response.statement_handle.as_deref() {
            for index in 1..meta.partition_info.len() {
                let rows = match self.partition(handle, index).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        let _ = sender
                            .send(StreamEvent::Error(format!(
                                "Failed to fetch partition {index}: {e}"
                            )))
                            .await;
                        return Ok(());
                    }
                };
                if !send_rows(&sender, &meta.row_type, rows, &mut sent).await {
                    return Ok(());
                }
            }
        }

        let _ = sender.send(StreamEvent::Done(sent)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(kind: &str, scale: Option<i64>) -> RowType {
        RowType {
            name: "c".into(),
            kind: kind.into(),
            scale,
            nullable: true,
        }
    }

    #[test]
    fn cells_follow_declared_types() {
        assert_eq!(
            convert_cell(Some("42".into()), &column("fixed", Some(0))),
            Value::Int(42)
        );
        assert_eq!(
            convert_cell(Some("4.20".into()), &column("fixed", Some(2))),
            Value::Text("4.20".into())
        );
        assert_eq!(
            convert_cell(Some("1.5".into()), &column("real", None)),
            Value::Float(1.5)
        );
        assert_eq!(
            convert_cell(Some("true".into()), &column("boolean", None)),
            Value::Bool(true)
        );
        assert_eq!(
            convert_cell(Some(r#"{"a":1}"#.into()), &column("variant", None)),
            Value::Json(json!({"a": 1}))
        );
        assert_eq!(
            convert_cell(Some("19723".into()), &column("date", None)),
            Value::Text("2024-01-01".into())
        );
        assert_eq!(
            convert_cell(Some("1704067200.500000000".into()), &column("timestamp_ntz", None)),
            Value::Text("2024-01-01 00:00:00.500".into())
        );
        assert_eq!(convert_cell(None, &column("text", None)), Value::Null);
    }

    #[test]
    fn epoch_parts_pads_fractions_and_ignores_offsets() {
        assert_eq!(epoch_parts("10.5"), Some((10, 500_000_000)));
        assert_eq!(epoch_parts("10.000000001 1440"), Some((10, 1)));
        assert_eq!(epoch_parts("nope"), None);
    }

    #[test]
    fn epoch_parts_before_1970_borrow_from_the_seconds() {
        assert_eq!(epoch_parts("-1.5"), Some((-2, 500_000_000)));
        assert_eq!(epoch_parts("-0.25"), Some((-1, 750_000_000)));
        assert_eq!(epoch_parts("-86400"), Some((-86400, 0)));
        assert_eq!(epoch_parts("--1.5"), None);
        assert_eq!(
            convert_cell(Some("-1.5".into()), &column("timestamp_ntz", None)),
            Value::Text("1969-12-31 23:59:58.500".into())
        );
    }

    #[test]
    fn column_type_documents_are_parsed() {
        assert_eq!(
            parse_column_type(Some(r#"{"type":"FIXED","precision":38,"scale":0,"nullable":false}"#)),
            ("FIXED".to_string(), false)
        );
        assert_eq!(parse_column_type(Some("TEXT")), ("TEXT".to_string(), true));
        assert_eq!(parse_column_type(None), ("UNKNOWN".to_string(), true));
    }

    #[test]
    fn statement_response_decodes_partitions() {
        let body = json!({
            "statementHandle": "01b2",
            "resultSetMetaData": {
                "numRows": 3,
                "rowType": [{"name": "ID", "type": "fixed", "scale": 0, "nullable": false}],
                "partitionInfo": [{"rowCount": 2}, {"rowCount": 1}]
            },
            "data": [["1"], ["2"]],
            "stats": {"numRowsInserted": 0}
        });
        let response: StatementResponse = serde_json::from_value(body).unwrap();
        let meta = response.result_set_meta_data.unwrap();
        assert_eq!(meta.partition_info.len(), 2);
        assert!(!meta.row_type[0].nullable);
        assert_eq!(response.data.unwrap().len(), 2);
    }

    #[test]
    fn body_includes_only_configured_context() {
        let mut descriptor = SnowflakeDescriptor::new("acme", "ANALYTICS", "token");
        descriptor.warehouse = Some("COMPUTE_WH".into());
        let backend = SnowflakeBackend {
            client: Client::new(),
            descriptor,
        };
        let body = backend.statement_body("SELECT 1");
        assert_eq!(body["database"], "ANALYTICS");
        assert_eq!(body["warehouse"], "COMPUTE_WH");
        assert_eq!(body["timeout"], 120);
        assert!(body.get("role").is_none());
        assert_eq!(
            backend.statements_url(),
            "https://acme.snowflakecomputing.com/api/v2/statements"
        );
    }

    #[test]
    fn error_message_reads_message_field() {
        let body = json!({"code": "002003", "message": "Object 'X' does not exist"});
        assert_eq!(error_message(&body).as_deref(), Some("Object 'X' does not exist"));
    }
}
