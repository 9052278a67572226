// SPDX-License-Identifier: Apache-2.0

//! BigQuery backend over the REST API (`jobs.query` / `jobs.getQueryResults`).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use veil_core::{
    BackendDriver, BigQueryDescriptor, ColumnInfo, ColumnMetadata, EngineError, EngineResult,
    MetadataProgress, Row, SampleRequest, StreamEvent, StreamSender, TableMetadata, Value,
};

use crate::catalog::{comment, table_kind};
use crate::http::{build_client, decode, transport_error};

const PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Debug, Clone, Deserialize)]
struct Field {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    fields: Vec<Field>,
    #[serde(default)]
    description: Option<String>,
}

impl Field {
    fn is_repeated(&self) -> bool {
        self.mode.as_deref() == Some("REPEATED")
    }

    fn is_nullable(&self) -> bool {
        self.mode.as_deref() != Some("REQUIRED")
    }

    fn display_type(&self) -> String {
        if self.is_repeated() {
            format!("ARRAY<{}>", self.kind)
        } else {
            self.kind.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Debug, Clone, Deserialize)]
struct Cell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableEntry {
    table_reference: TableReference,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    dataset_id: String,
    table_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    schema: Option<TableSchema>,
}

fn error_message(body: &serde_json::Value) -> Option<String> {
    body.pointer("/error/message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

pub struct BigQueryBackend {
    client: Client,
    descriptor: BigQueryDescriptor,
}

impl BigQueryBackend {
    /// Builds the HTTP client and runs `SELECT 1` to validate the token.
    #[instrument(skip(descriptor), fields(project = %descriptor.project_id))]
    pub async fn connect(descriptor: &BigQueryDescriptor) -> EngineResult<Self> {
        let backend = Self {
            client: build_client(descriptor.statement_timeout_secs)?,
            descriptor: descriptor.clone(),
        };
        backend.run_query("SELECT 1").await?;
        info!("BigQuery backend connected");
        Ok(backend)
    }

    fn project_url(&self) -> String {
        format!(
            "{}/projects/{}",
            self.descriptor.endpoint().trim_end_matches('/'),
            self.descriptor.project_id
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.descriptor.access_token.expose())
    }

    fn timeout_ms(&self) -> u64 {
        self.descriptor.statement_timeout_secs.saturating_mul(1000)
    }

    fn query_body(&self, sql: &str) -> serde_json::Value {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": self.timeout_ms(),
            "maxResults": PAGE_SIZE,
        });
        if let Some(location) = self.descriptor.location.as_deref().filter(|l| !l.is_empty()) {
            body["location"] = json!(location);
        }
        body
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> EngineResult<T> {
        let response = self
            .authorized(self.client.get(url))
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        decode(response, error_message).await
    }

    /// Submits a query and waits until the job completes.
    async fn run_query(&self, sql: &str) -> EngineResult<QueryResponse> {
        let response = self
            .authorized(self.client.post(format!("{}/queries", self.project_url())))
            .json(&self.query_body(sql))
            .send()
            .await
            .map_err(transport_error)?;
        let mut result: QueryResponse = decode(response, error_message).await?;

        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms());
        while !result.job_complete {
            if Instant::now() >= deadline {
                return Err(EngineError::timeout(self.timeout_ms()));
            }
            let job = result.job_reference.clone().ok_or_else(|| {
                EngineError::execution_error("BigQuery returned an incomplete job without a reference")
            })?;
            debug!(job_id = %job.job_id, "BigQuery job still running");
            result = self.results_page(&job, None).await?;
        }
        Ok(result)
    }

    async fn results_page(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> EngineResult<QueryResponse> {
        let mut query = vec![
            ("maxResults", PAGE_SIZE.to_string()),
            ("timeoutMs", self.timeout_ms().min(10_000).to_string()),
        ];
        if let Some(location) = job.location.as_deref().or(self.descriptor.location.as_deref()) {
            query.push(("location", location.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        self.get(format!("{}/queries/{}", self.project_url(), job.job_id), &query)
            .await
    }

    async fn list_datasets(&self) -> EngineResult<Vec<String>> {
        let mut datasets = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let query: Vec<(&str, String)> =
                token.iter().map(|t| ("pageToken", t.clone())).collect();
            let page: DatasetList = self
                .get(format!("{}/datasets", self.project_url()), &query)
                .await?;
            datasets.extend(page.datasets.into_iter().map(|d| d.dataset_reference.dataset_id));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(datasets),
            }
        }
    }

    async fn list_tables(&self, dataset: &str) -> EngineResult<Vec<TableEntry>> {
        let mut tables = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let query: Vec<(&str, String)> =
                token.iter().map(|t| ("pageToken", t.clone())).collect();
            let page: TableList = self
                .get(format!("{}/datasets/{dataset}/tables", self.project_url()), &query)
                .await?;
            tables.extend(page.tables);
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(tables),
            }
        }
    }

    async fn table_metadata(&self, entry: &TableEntry) -> EngineResult<TableMetadata> {
        let reference = &entry.table_reference;
        let resource: TableResource = self
            .get(
                format!(
                    "{}/datasets/{}/tables/{}",
                    self.project_url(),
                    reference.dataset_id,
                    reference.table_id
                ),
                &[],
            )
            .await?;

        let kind = resource
            .kind
            .as_deref()
            .or(entry.kind.as_deref())
            .map_or(veil_core::TableKind::Table, table_kind);
        let mut table = TableMetadata::new(&reference.dataset_id, &reference.table_id, kind);
        table.description = comment(resource.description);
        table.columns = resource
            .schema
            .unwrap_or_default()
            .fields
            .iter()
            .map(|field| ColumnMetadata {
                name: field.name.clone(),
                data_type: field.display_type(),
                nullable: field.is_nullable(),
                description: comment(field.description.clone()),
            })
            .collect();
        Ok(table)
    }
}

/// Converts one `v` cell according to its schema field.
fn convert_cell(raw: serde_json::Value, field: &Field) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    if field.is_repeated() {
        let items = match raw {
            serde_json::Value::Array(items) => items,
            other => return Value::Text(other.to_string()),
        };
        let element = Field {
            mode: Some("NULLABLE".into()),
            ..field.clone()
        };
        return Value::Array(
            items
                .into_iter()
                .map(|item| convert_cell(item.get("v").cloned().unwrap_or_default(), &element))
                .collect(),
        );
    }

    match field.kind.to_ascii_uppercase().as_str() {
        "RECORD" | "STRUCT" => Value::Json(record_json(raw, &field.fields)),
        "INTEGER" | "INT64" => scalar_text(raw, |s| s.parse::<i64>().ok().map(Value::Int)),
        "FLOAT" | "FLOAT64" => scalar_text(raw, |s| s.parse::<f64>().ok().map(Value::Float)),
        "BOOLEAN" | "BOOL" => scalar_text(raw, |s| Some(Value::Bool(s.eq_ignore_ascii_case("true")))),
        "TIMESTAMP" => scalar_text(raw, |s| {
            let seconds = s.parse::<f64>().ok()?;
            DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
                .map(|dt| Value::Text(dt.to_rfc3339()))
        }),
        "JSON" => scalar_text(raw, |s| serde_json::from_str(s).ok().map(Value::Json)),
        _ => scalar_text(raw, |_| None),
    }
}

/// Applies `parse` to a string cell, falling back to its text.
fn scalar_text<F>(raw: serde_json::Value, parse: F) -> Value
where
    F: FnOnce(&str) -> Option<Value>,
{
    match raw {
        serde_json::Value::String(s) => parse(&s).unwrap_or(Value::Text(s)),
        other => Value::Json(other),
    }
}

fn record_json(raw: serde_json::Value, fields: &[Field]) -> serde_json::Value {
    let cells = raw
        .get("f")
        .and_then(|f| f.as_array())
        .cloned()
        .unwrap_or_default();
    let object = fields
        .iter()
        .zip(cells)
        .map(|(field, cell)| {
            let value = convert_cell(cell.get("v").cloned().unwrap_or_default(), field);
            (field.name.clone(), value.into_json())
        })
        .collect();
    serde_json::Value::Object(object)
}

fn column_info(schema: &TableSchema) -> Vec<ColumnInfo> {
    schema
        .fields
        .iter()
        .map(|field| ColumnInfo {
            name: field.name.clone(),
            data_type: field.display_type(),
            nullable: field.is_nullable(),
        })
        .collect()
}

async fn send_rows(
    sender: &StreamSender,
    fields: &[Field],
    rows: Vec<TableRow>,
    sent: &mut u64,
) -> bool {
    for row in rows {
        let values = row
            .f
            .into_iter()
            .zip(fields)
            .map(|(cell, field)| convert_cell(cell.v, field))
            .collect();
        if sender.send(StreamEvent::Row(Row::new(values))).await.is_err() {
            return false;
        }
        *sent += 1;
    }
    true
}

#[async_trait]
impl BackendDriver for BigQueryBackend {
    fn dialect(&self) -> &'static str {
        "bigquery"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "\\`"))
    }

    fn random_function(&self) -> &'static str {
        "RAND()"
    }

    /// BigQuery paths are quoted as a single dotted identifier.
    fn sample_target(&self, request: &SampleRequest) -> String {
        let path = match request.database.as_deref().filter(|d| !d.is_empty()) {
            Some(database) => format!("{database}.{}.{}", request.schema, request.table),
            None => format!("{}.{}", request.schema, request.table),
        };
        self.quote_ident(&path)
    }

    async fn load_metadata_with_progress(
        &self,
        progress: Option<MetadataProgress<'_>>,
    ) -> EngineResult<Vec<TableMetadata>> {
        let mut entries = Vec::new();
        for dataset in self.list_datasets().await? {
            match self.list_tables(&dataset).await {
                Ok(tables) => entries.extend(tables),
                Err(e) => warn!(dataset = %dataset, error = %e, "Failed to list tables"),
            }
        }

        let limit = self.descriptor.max_metadata_tables;
        if entries.len() > limit {
            warn!(
                found = entries.len(),
                limit, "BigQuery metadata truncated to the configured table limit"
            );
            entries.truncate(limit);
        }

        let total = entries.len();
        info!(total, "Loading BigQuery table metadata");
        let mut pending = stream::iter(entries)
            .map(|entry| async move {
                let name = format!(
                    "{}.{}",
                    entry.table_reference.dataset_id, entry.table_reference.table_id
                );
                (name, self.table_metadata(&entry).await)
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
        let first = self.run_query(sql).await?;

        let Some(schema) = first.schema.clone().filter(|s| !s.fields.is_empty()) else {
            let affected = first
                .num_dml_affected_rows
                .as_deref()
                .and_then(|n| n.parse::<u64>().ok())
                .unwrap_or(0);
            let _ = sender.send(StreamEvent::Done(affected)).await;
            return Ok(());
        };

        if sender
            .send(StreamEvent::Columns(column_info(&schema)))
            .await
            .is_err()
        {
            return Ok(());
        }

        let mut sent = 0u64;
        let mut page_token = first.page_token;
        let job = first.job_reference;
        if !send_rows(&sender, &schema.fields, first.rows, &mut sent).await {
            return Ok(());
        }

        while let (Some(token), Some(job)) = (page_token.take(), job.as_ref()) {
            let page = match self.results_page(job, Some(&token)).await {
                Ok(page) => page,
                Err(e) => {
                    let _ = sender
                        .send(StreamEvent::Error(format!("Failed to fetch next page: {e}")))
                        .await;
                    return Ok(());
                }
            };
            page_token = page.page_token;
            if !send_rows(&sender, &schema.fields, page.rows, &mut sent).await {
                return Ok(());
            }
        }

        let _ = sender.send(StreamEvent::Done(sent)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, kind: &str, mode: &str) -> Field {
        Field {
            name: name.into(),
            kind: kind.into(),
            mode: Some(mode.into()),
            fields: Vec::new(),
            description: None,
        }
    }

    fn backend() -> BigQueryBackend {
        BigQueryBackend {
            client: Client::new(),
            descriptor: BigQueryDescriptor::new("acme-prod", "token"),
        }
    }

    #[test]
    fn scalar_cells_follow_field_types() {
        assert_eq!(
            convert_cell(json!("42"), &field("n", "INTEGER", "NULLABLE")),
            Value::Int(42)
        );
        assert_eq!(
            convert_cell(json!("2.5"), &field("f", "FLOAT", "NULLABLE")),
            Value::Float(2.5)
        );
        assert_eq!(
            convert_cell(json!("true"), &field("b", "BOOLEAN", "NULLABLE")),
            Value::Bool(true)
        );
        assert_eq!(
            convert_cell(json!("12.30"), &field("d", "NUMERIC", "NULLABLE")),
            Value::Text("12.30".into())
        );
        assert_eq!(
            convert_cell(json!("1.7040672E9"), &field("t", "TIMESTAMP", "NULLABLE")),
            Value::Text("2024-01-01T00:00:00+00:00".into())
        );
        assert_eq!(
            convert_cell(serde_json::Value::Null, &field("s", "STRING", "NULLABLE")),
            Value::Null
        );
    }

    #[test]
    fn repeated_and_record_cells_nest() {
        let tags = field("tags", "STRING", "REPEATED");
        assert_eq!(
            convert_cell(json!([{"v": "a"}, {"v": "b"}]), &tags),
            Value::Array(vec![Value::Text("a".into()), Value::Text("b".into())])
        );

        let mut address = field("address", "RECORD", "NULLABLE");
        address.fields = vec![
            field("city", "STRING", "NULLABLE"),
            field("zip", "INTEGER", "NULLABLE"),
        ];
        assert_eq!(
            convert_cell(json!({"f": [{"v": "Paris"}, {"v": "75001"}]}), &address),
            Value::Json(json!({"city": "Paris", "zip": 75001}))
        );
    }

    #[test]
    fn dml_response_has_no_schema() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "jobReference": {"projectId": "acme-prod", "jobId": "job_1", "location": "EU"},
            "numDmlAffectedRows": "7"
        }))
        .unwrap();
        assert!(response.schema.is_none());
        assert_eq!(response.num_dml_affected_rows.as_deref(), Some("7"));
        assert_eq!(response.job_reference.unwrap().location.as_deref(), Some("EU"));
    }

    #[test]
    fn sample_target_is_one_backticked_path() {
        let backend = backend();
        let request = SampleRequest::new("sales", "orders", 5);
        assert_eq!(
            backend.sample_query(&request),
            "SELECT * FROM `sales.orders` ORDER BY RAND() LIMIT 5"
        );
        let request = request.with_database("acme-prod");
        assert_eq!(backend.sample_target(&request), "`acme-prod.sales.orders`");
    }

    #[test]
    fn query_body_uses_standard_sql() {
        let mut backend = backend();
        backend.descriptor.location = Some("EU".into());
        let body = backend.query_body("SELECT 1");
        assert_eq!(body["useLegacySql"], false);
        assert_eq!(body["timeoutMs"], 120_000);
        assert_eq!(body["location"], "EU");
        assert_eq!(
            backend.project_url(),
            "https://bigquery.googleapis.com/bigquery/v2/projects/acme-prod"
        );
    }

    #[test]
    fn error_message_reads_nested_error() {
        let body = json!({"error": {"code": 400, "message": "Syntax error: Unexpected keyword FORM"}});
        assert_eq!(
            error_message(&body).as_deref(),
            Some("Syntax error: Unexpected keyword FORM")
        );
    }
}
