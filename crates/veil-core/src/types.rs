//! Data model shared by drivers, the SQL layer and the facade
//!
//! Rows travel between a driver and the materializer as positional
//! [`Row`]s; the facade hands callers ordered JSON maps ([`RowMap`]).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Universal value representation produced by drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    /// Converts the value into the JSON shape returned to callers.
    ///
    /// Bytes are base64 encoded; non-finite floats become `null`.
    pub fn into_json(self) -> serde_json::Value {
        use base64::{engine::general_purpose::STANDARD, Engine};

        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s),
            Value::Bytes(bytes) => serde_json::Value::String(STANDARD.encode(bytes)),
            Value::Json(json) => json,
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Value::into_json).collect())
            }
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column metadata of a result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

/// A materialized row: column name to JSON value, in result-set order.
pub type RowMap = serde_json::Map<String, serde_json::Value>;

/// Returns one key per column, suffixing repeated names with `_1`, `_2`, ...
pub fn unique_column_names(columns: &[ColumnInfo]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut names = Vec::with_capacity(columns.len());

    for (index, column) in columns.iter().enumerate() {
        let base = if column.name.is_empty() {
            format!("col_{index}")
        } else {
            column.name.clone()
        };
        let occurrences = seen.entry(column.name.as_str()).or_insert(0);
        let mut name = if *occurrences == 0 {
            base.clone()
        } else {
            format!("{base}_{occurrences}")
        };
        *occurrences += 1;
        // a suffixed name may collide with a real column further left
        while names.contains(&name) {
            *occurrences += 1;
            name = format!("{base}_{occurrences}");
        }
        names.push(name);
    }

    names
}

/// Zips a positional row with precomputed column keys.
///
/// Extra values beyond the known columns get positional `col_N` keys.
pub fn row_to_map(names: &[String], row: Row) -> RowMap {
    let mut map = RowMap::with_capacity(row.values.len());
    for (index, value) in row.values.into_iter().enumerate() {
        let key = names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("col_{index}"));
        map.insert(key, value.into_json());
    }
    map
}

/// Result of a materialized query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<RowMap>,
    /// Total row count; `None` when truncated and the count query failed.
    pub count: Option<u64>,
    pub truncated: bool,
    pub execution_time_ms: f64,
}

impl ExecutionResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            count: Some(0),
            truncated: false,
            execution_time_ms: 0.0,
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        unique_column_names(&self.columns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Table,
    View,
    MaterializedView,
}

/// Column description in a metadata snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Table description in a metadata snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub schema: String,
    pub table: String,
    pub kind: TableKind,
    pub is_view: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, kind: TableKind) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            kind,
            is_view: kind != TableKind::Table,
            description: None,
            columns: Vec::new(),
        }
    }
}

/// Upper bound on rows a sample may return.
pub const MAX_SAMPLE_ROWS: u32 = 20;

/// Parameters of a random sample request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub table: String,
    pub schema: String,
    #[serde(default = "default_sample_limit")]
    pub limit: u32,
    #[serde(default)]
    pub database: Option<String>,
}

fn default_sample_limit() -> u32 {
    10
}

impl SampleRequest {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, limit: u32) -> Self {
        Self {
            table: table.into(),
            schema: schema.into(),
            limit,
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn is_addressable(&self) -> bool {
        !self.schema.trim().is_empty() && !self.table.trim().is_empty()
    }

    /// Limit clamped to `[1, MAX_SAMPLE_ROWS]`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_SAMPLE_ROWS)
    }
}

/// Result of a sample. Failures are reported in-band, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SamplePayload {
    Data {
        sample_query: String,
        sample_size: usize,
        columns: Vec<String>,
        data: Vec<RowMap>,
        note: String,
    },
    Error {
        error: String,
        note: String,
    },
}

impl SamplePayload {
    pub fn data(sample_query: String, columns: Vec<String>, data: Vec<RowMap>, limit: u32) -> Self {
        Self::Data {
            sample_query,
            sample_size: data.len(),
            columns,
            data,
            note: format!("Sample shows first {limit} rows from table"),
        }
    }

    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Error {
            error: format!("Failed to sample data: {reason}"),
            note: "Sample data could not be retrieved".to_string(),
        }
    }

    pub fn missing_target() -> Self {
        Self::Error {
            error: "Cannot sample data: missing schema or table information".to_string(),
            note: "Sample data requires both schema and table names".to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Statement kinds that mutate data or schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteKind {
    Create,
    Drop,
    Insert,
    Update,
    Delete,
    Alter,
    Truncate,
    Merge,
    Replace,
    Load,
}

impl WriteKind {
    pub const ALL: [WriteKind; 10] = [
        WriteKind::Create,
        WriteKind::Drop,
        WriteKind::Insert,
        WriteKind::Update,
        WriteKind::Delete,
        WriteKind::Alter,
        WriteKind::Truncate,
        WriteKind::Merge,
        WriteKind::Replace,
        WriteKind::Load,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            WriteKind::Create => "CREATE",
            WriteKind::Drop => "DROP",
            WriteKind::Insert => "INSERT",
            WriteKind::Update => "UPDATE",
            WriteKind::Delete => "DELETE",
            WriteKind::Alter => "ALTER",
            WriteKind::Truncate => "TRUNCATE",
            WriteKind::Merge => "MERGE",
            WriteKind::Replace => "REPLACE",
            WriteKind::Load => "LOAD",
        }
    }

    /// Maps a leading SQL keyword (any case) to a write kind.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.keyword().eq_ignore_ascii_case(keyword))
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Outcome of write classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteClassification {
    pub is_write: bool,
    pub kind: Option<WriteKind>,
}

impl WriteClassification {
    pub const READ: Self = Self {
        is_write: false,
        kind: None,
    };

    pub fn write(kind: WriteKind) -> Self {
        Self {
            is_write: true,
            kind: Some(kind),
        }
    }
}

/// How the gate treats statements classified as writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WritePolicy {
    #[serde(rename = "read-only")]
    ReadOnly,
    #[default]
    #[serde(rename = "confirmation")]
    Confirm,
    #[serde(rename = "skip-confirmation")]
    SkipConfirmation,
}

/// A column that must never leave the backend in plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrivacyRule {
    pub table: String,
    pub column: String,
    /// Label used when rendering tokens, e.g. `Encrypted`.
    #[serde(alias = "encryption_key", default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "Encrypted".to_string()
}

impl PrivacyRule {
    pub fn encrypted(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            strategy: default_strategy(),
        }
    }
}
