// SPDX-License-Identifier: Apache-2.0

//! Normalized error types shared by every Veil crate
//!
//! Driver-specific failures are mapped onto these variants so the facade can
//! report them uniformly regardless of which backend produced them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for warehouse operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Write operation '{kind}' is not allowed in read-only mode")]
    UnsafeQuery { kind: String },

    #[error("Write operation '{kind}' requires confirmation")]
    WriteOperation { kind: String, sql: String },

    #[error("Query syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Pseudonym store error: {message}")]
    Store { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: msg.into() }
    }

    pub fn unsafe_query(kind: impl ToString) -> Self {
        Self::UnsafeQuery {
            kind: kind.to_string(),
        }
    }

    pub fn write_operation(kind: impl ToString, sql: impl Into<String>) -> Self {
        Self::WriteOperation {
            kind: kind.to_string(),
            sql: sql.into(),
        }
    }

    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError { message: msg.into() }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// True for the two write-gate refusals.
    pub fn is_gate_refusal(&self) -> bool {
        matches!(self, Self::UnsafeQuery { .. } | Self::WriteOperation { .. })
    }
}

/// Result type alias for warehouse operations
pub type EngineResult<T> = Result<T, EngineError>;
