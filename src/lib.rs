// SPDX-License-Identifier: Apache-2.0

//! Veil - guarded, privacy-aware query execution over external warehouses.

pub mod config;
pub mod gate;
pub mod materializer;
pub mod observability;
pub mod privacy;
pub mod pseudonym;
pub mod warehouse;

pub use config::{LoggingConfig, VeilConfig};
pub use gate::{GateDecision, QueryOutcome, QueryRequest};
pub use materializer::BoundedMaterializer;
pub use privacy::{ColumnPrivacyCatalog, PrivacyCatalog, StaticRules};
pub use pseudonym::{PseudonymStore, SqlitePseudonymRepository};
pub use warehouse::Warehouse;

pub use veil_core::{
    ConnectionDescriptor, EngineError, EngineResult, ExecutionResult, PrivacyRule, SamplePayload,
    SampleRequest, TableMetadata, WriteKind, WritePolicy,
};
pub use veil_drivers::{BackendHandle, ConnectionRegistry};
