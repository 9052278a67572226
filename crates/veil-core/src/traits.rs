//! BackendDriver trait definition
//!
//! Every warehouse backend implements this trait. The facade never inspects
//! which backend it holds; it only talks to this interface.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    row_to_map, unique_column_names, ColumnInfo, Row, RowMap, SamplePayload, SampleRequest,
    TableMetadata,
};

/// Events emitted by a driver while streaming a result set.
///
/// `Columns` is sent once before the first row. `Done` carries the number of
/// rows produced, or rows affected for statements without a result set.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Columns(Vec<ColumnInfo>),
    Row(Row),
    Error(String),
    Done(u64),
}

/// Sending half of a result stream. A failed send means the consumer has
/// stopped reading; drivers must stop fetching when that happens.
pub type StreamSender = mpsc::Sender<StreamEvent>;

/// Progress callback for metadata loading: `(current, total, table_name)`.
pub type MetadataProgress<'a> = &'a (dyn Fn(usize, usize, &str) + Send + Sync);

/// Core trait that all warehouse backends implement
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Dialect name, e.g. `postgresql`, `snowflake`, `bigquery`
    fn dialect(&self) -> &'static str;

    /// Quotes an identifier for this backend.
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// SQL expression producing a random ordering key.
    fn random_function(&self) -> &'static str {
        "RANDOM()"
    }

    /// Fully qualified table reference used by sampling.
    fn sample_target(&self, request: &SampleRequest) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(database) = request.database.as_deref().filter(|d| !d.is_empty()) {
            parts.push(self.quote_ident(database));
        }
        parts.push(self.quote_ident(&request.schema));
        parts.push(self.quote_ident(&request.table));
        parts.join(".")
    }

    /// Builds the random-sample query for a table.
    fn sample_query(&self, request: &SampleRequest) -> String {
        format!(
            "SELECT * FROM {} ORDER BY {} LIMIT {}",
            self.sample_target(request),
            self.random_function(),
            request.effective_limit()
        )
    }

    /// Loads a snapshot of every user-visible table, reporting progress.
    async fn load_metadata_with_progress(
        &self,
        progress: Option<MetadataProgress<'_>>,
    ) -> EngineResult<Vec<TableMetadata>>;

    /// Loads a snapshot of every user-visible table.
    async fn load_metadata(&self) -> EngineResult<Vec<TableMetadata>> {
        self.load_metadata_with_progress(None).await
    }

    /// Executes SQL and streams its result set into `sender`.
    ///
    /// Statements without a result set send `Done(rows_affected)` only.
    async fn execute_stream(&self, sql: &str, sender: StreamSender) -> EngineResult<()>;

    /// Returns a random sample of a table. Failures are reported in the payload.
    async fn sample(&self, request: &SampleRequest) -> SamplePayload {
        if !request.is_addressable() {
            return SamplePayload::missing_target();
        }
        let limit = request.effective_limit();
        let sql = self.sample_query(request);
        match collect_rows(self, &sql, limit as usize).await {
            Ok((columns, rows)) => SamplePayload::data(sql, columns, rows, limit),
            Err(e) => SamplePayload::failed(e),
        }
    }

    /// Releases pooled resources.
    async fn close(&self) {}
}

/// Runs `sql` and collects at most `max_rows` rows into maps.
///
/// Dropping the receiver after `max_rows` stops the driver.
pub async fn collect_rows<D>(
    driver: &D,
    sql: &str,
    max_rows: usize,
) -> EngineResult<(Vec<String>, Vec<RowMap>)>
where
    D: BackendDriver + ?Sized,
{
    let (tx, mut rx) = mpsc::channel(max_rows.clamp(1, 256));

    let consumer = async move {
        let mut names = Vec::new();
        let mut rows = Vec::new();
        while rows.len() < max_rows {
            match rx.recv().await {
                Some(StreamEvent::Columns(columns)) => names = unique_column_names(&columns),
                Some(StreamEvent::Row(row)) => rows.push(row_to_map(&names, row)),
                Some(StreamEvent::Error(message)) => {
                    return Err(EngineError::execution_error(message))
                }
                Some(StreamEvent::Done(_)) | None => break,
            }
        }
        Ok((names, rows))
    };

    let (produced, collected) = tokio::join!(driver.execute_stream(sql, tx), consumer);
    produced?;
    collected
}
