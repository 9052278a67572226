// SPDX-License-Identifier: Apache-2.0

//! Bounded Result Materializer
//!
//! Drains a driver's row stream into JSON row maps while tracking the exact
//! serialized size of the accumulated array. Accumulation stops before the
//! row that would cross the cap; dropping the receiver then stops the driver.

use std::collections::HashSet;
use std::io;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use veil_core::{
    collect_rows, row_to_map, unique_column_names, BackendDriver, ColumnInfo, EngineError,
    EngineResult, ExecutionResult, Row, RowMap, StreamEvent,
};

use crate::config::VeilConfig;

/// Counts bytes written through it.
#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialized JSON size of one row map.
pub fn json_size(row: &RowMap) -> usize {
    let mut counter = ByteCounter::default();
    match serde_json::to_writer(&mut counter, row) {
        Ok(()) => counter.0,
        // a map of JSON values always serializes
        Err(_) => usize::MAX,
    }
}

/// Size of `rows` serialized as a JSON array.
pub fn rows_json_size(rows: &[RowMap]) -> usize {
    2 + rows.iter().map(json_size).sum::<usize>() + rows.len().saturating_sub(1)
}

/// Drops trailing rows until `rows` fits in `max_bytes`. Returns whether any
/// row was removed.
pub fn trim_to_cap(rows: &mut Vec<RowMap>, max_bytes: usize) -> bool {
    let mut size = 2;
    let mut keep = 0;
    for row in rows.iter() {
        let next = size + json_size(row) + usize::from(keep > 0);
        if next > max_bytes {
            break;
        }
        size = next;
        keep += 1;
    }
    let trimmed = keep < rows.len();
    rows.truncate(keep);
    trimmed
}

/// Columns to drop when a result repeats a name, keeping the last occurrence.
///
/// A rewritten wildcard query yields both the base column and its tagged
/// override under the same name; only the override may survive. Backends
/// that de-duplicate names report the override as `email:1` (SQLite) or
/// `email_2` (DuckDB). Only exact repeats of the base name are dropped, and
/// a renamed survivor gets the base name back; a real `email_1` column is
/// never touched.
#[derive(Debug, Clone, Default)]
pub struct Collapse {
    names: HashSet<String>,
    /// Separator the backend puts before its de-duplication counter.
    counter_separator: Option<char>,
}

impl Collapse {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
            counter_separator: None,
        }
    }

    /// Collapse set for a backend dialect, aware of how it renames repeats.
    pub fn for_dialect<I, S>(dialect: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut collapse = Self::new(names);
        collapse.counter_separator = match dialect {
            "sqlite" => Some(':'),
            "duckdb" | "motherduck" => Some('_'),
            _ => None,
        };
        collapse
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Collapse name `column` (lower-cased) belongs to, and whether it is
    /// the exact name rather than a renamed repeat.
    fn member_of<'a>(&'a self, column: &str) -> Option<(&'a str, bool)> {
        if let Some(name) = self.names.get(column) {
            return Some((name, true));
        }
        let separator = self.counter_separator?;
        let (prefix, counter) = column.rsplit_once(separator)?;
        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.names.get(prefix).map(|name| (name.as_str(), false))
    }

    fn members(&self, columns: &[ColumnInfo]) -> Vec<Option<(&str, bool)>> {
        columns
            .iter()
            .map(|c| self.member_of(&c.name.to_ascii_lowercase()))
            .collect()
    }

    /// Indices of the columns to keep.
    fn keep(&self, columns: &[ColumnInfo]) -> Vec<usize> {
        let members = self.members(columns);
        (0..columns.len())
            .filter(|&i| match members[i] {
                Some((base, true)) => !members[i + 1..]
                    .iter()
                    .any(|m| m.is_some_and(|(b, _)| b == base)),
                _ => true,
            })
            .collect()
    }

    /// Kept indices and the columns to report for them.
    fn select(&self, columns: &[ColumnInfo]) -> (Vec<usize>, Vec<ColumnInfo>) {
        let members = self.members(columns);
        let keep = self.keep(columns);
        let kept = keep
            .iter()
            .map(|&i| {
                let mut column = columns[i].clone();
                if let Some((base, false)) = members[i] {
                    let is_last = !members[i + 1..]
                        .iter()
                        .any(|m| m.is_some_and(|(b, _)| b == base));
                    if is_last && members[..i].contains(&Some((base, true))) {
                        column.name.truncate(base.len());
                    }
                }
                column
            })
            .collect();
        (keep, kept)
    }
}

pub struct BoundedMaterializer {
    max_bytes: usize,
    count_threshold_ratio: f64,
    stream_buffer: usize,
}

impl BoundedMaterializer {
    pub fn new(max_bytes: usize, count_threshold_ratio: f64, stream_buffer: usize) -> Self {
        Self {
            max_bytes,
            count_threshold_ratio,
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub fn from_config(config: &VeilConfig) -> Self {
        Self::new(
            config.max_result_bytes,
            config.count_threshold_ratio,
            config.stream_buffer,
        )
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Runs `sql` and materializes at most `max_bytes` of rows.
    pub async fn materialize(
        &self,
        driver: &dyn BackendDriver,
        sql: &str,
    ) -> EngineResult<ExecutionResult> {
        self.materialize_collapsed(driver, sql, &Collapse::default())
            .await
    }

    #[instrument(skip(self, driver, sql, collapse), fields(dialect = driver.dialect()))]
    pub async fn materialize_collapsed(
        &self,
        driver: &dyn BackendDriver,
        sql: &str,
        collapse: &Collapse,
    ) -> EngineResult<ExecutionResult> {
        let start = Instant::now();
        let (tx, mut rx) = mpsc::channel(self.stream_buffer);
        let max_bytes = self.max_bytes;

        let consumer = async move {
            let mut acc = Accumulator::new(max_bytes);
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Columns(columns) => acc.set_columns(columns, collapse),
                    StreamEvent::Row(row) => {
                        if !acc.push(row) {
                            break;
                        }
                    }
                    StreamEvent::Error(message) => {
                        return Err(EngineError::execution_error(message));
                    }
                    StreamEvent::Done(_) => break,
                }
            }
            Ok(acc)
        };

        let (produced, consumed) = tokio::join!(driver.execute_stream(sql, tx), consumer);
        produced?;
        let acc = consumed?;
        let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        let Some(columns) = acc.columns else {
            // statement without a result set
            return Ok(ExecutionResult {
                execution_time_ms,
                ..ExecutionResult::empty()
            });
        };

        let near_cap = acc.size as f64 >= self.max_bytes as f64 * self.count_threshold_ratio;
        let count = if acc.truncated || near_cap {
            self.total_count(driver, sql, acc.rows.len()).await
        } else {
            Some(acc.rows.len() as u64)
        };

        debug!(
            rows = acc.rows.len(),
            bytes = acc.size,
            truncated = acc.truncated,
            ?count,
            "Result materialized"
        );

        Ok(ExecutionResult {
            columns,
            rows: acc.rows,
            count,
            truncated: acc.truncated,
            execution_time_ms,
        })
    }

    /// Best-effort total via `SELECT COUNT(*)`. Failures yield `None`.
    async fn total_count(
        &self,
        driver: &dyn BackendDriver,
        sql: &str,
        materialized: usize,
    ) -> Option<u64> {
        let count_sql = veil_sql::count_query(sql);
        let rows = match collect_rows(driver, &count_sql, 1).await {
            Ok((_, rows)) => rows,
            Err(e) => {
                warn!(error = %e, "Count query failed; omitting total");
                return None;
            }
        };

        let total = rows
            .first()
            .and_then(|row| row.values().next())
            .and_then(|value| match value {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.parse::<u64>().ok(),
                _ => None,
            })?;
        // a total below what was already read means the data moved underneath us
        (total >= materialized as u64).then_some(total)
    }
}

struct Accumulator {
    max_bytes: usize,
    columns: Option<Vec<ColumnInfo>>,
    names: Vec<String>,
    keep: Option<Vec<usize>>,
    rows: Vec<RowMap>,
    size: usize,
    truncated: bool,
}

impl Accumulator {
    fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            columns: None,
            names: Vec::new(),
            keep: None,
            rows: Vec::new(),
            size: 2,
            truncated: false,
        }
    }

    fn set_columns(&mut self, columns: Vec<ColumnInfo>, collapse: &Collapse) {
        let columns = if collapse.is_empty() {
            columns
        } else {
            let (keep, kept) = collapse.select(&columns);
            if keep.len() < columns.len() {
                self.keep = Some(keep);
            }
            kept
        };
        self.names = unique_column_names(&columns);
        self.columns = Some(columns);
    }

    /// Adds a row unless it would cross the cap. Returns false once full.
    fn push(&mut self, row: Row) -> bool {
        let row = match &self.keep {
            Some(keep) => {
                let mut values: Vec<_> = row.values.into_iter().map(Some).collect();
                Row::new(
                    keep.iter()
                        .filter_map(|&i| values.get_mut(i).and_then(Option::take))
                        .collect(),
                )
            }
            None => row,
        };
        let map = row_to_map(&self.names, row);
        let next = self.size + json_size(&map) + usize::from(!self.rows.is_empty());
        if next > self.max_bytes {
            self.truncated = true;
            return false;
        }
        self.size = next;
        self.rows.push(map);
        true
    }
}
