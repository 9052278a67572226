// SPDX-License-Identifier: Apache-2.0

//! Veil core: the backend-neutral data model and driver contract.

pub mod descriptor;
pub mod error;
pub mod sensitive;
pub mod traits;
pub mod types;

pub use descriptor::{
    BigQueryDescriptor, ConnectionDescriptor, MotherDuckDescriptor, PoolSettings,
    SnowflakeDescriptor, SnowflakeTokenType, SqlDescriptor, SqlDialect,
};
pub use error::{EngineError, EngineResult};
pub use sensitive::Sensitive;
pub use traits::{collect_rows, BackendDriver, MetadataProgress, StreamEvent, StreamSender};
pub use types::{
    row_to_map, unique_column_names, ColumnInfo, ColumnMetadata, ExecutionResult, PrivacyRule,
    Row, RowMap, SamplePayload, SampleRequest, TableKind, TableMetadata, Value,
    WriteClassification, WriteKind, WritePolicy, MAX_SAMPLE_ROWS,
};
