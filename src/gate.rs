// SPDX-License-Identifier: Apache-2.0

//! Query Execution Gate
//!
//! Combines the write classification of a statement with the request's
//! policy. The gate never executes anything; it only decides whether the
//! next stage may run.

use serde::{Deserialize, Serialize};
use tracing::debug;
use veil_core::{EngineError, EngineResult, ExecutionResult, WriteClassification, WriteKind, WritePolicy};

/// One call to the facade's `execute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    /// Role whose privacy rules apply to this query
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub policy: WritePolicy,
    /// Set on the second call, after a write was approved
    #[serde(default)]
    pub skip_confirmation: bool,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>, role: impl Into<String>, policy: WritePolicy) -> Self {
        Self {
            sql: sql.into(),
            role: role.into(),
            policy,
            skip_confirmation: false,
        }
    }

    /// Re-submits the same request after the caller approved it.
    pub fn confirmed(mut self) -> Self {
        self.skip_confirmation = true;
        self
    }
}

/// Verdict of the gate for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Block { kind: WriteKind },
    NeedsConfirmation { kind: WriteKind, sql: String },
}

/// Decides whether `request` may run. The classifier is only consulted when
/// the policy needs it.
pub fn evaluate(request: &QueryRequest, dialect: &str) -> GateDecision {
    if request.skip_confirmation || request.policy == WritePolicy::SkipConfirmation {
        return GateDecision::Allow;
    }
    let classification = veil_sql::classify_for(dialect, &request.sql);
    let decision = decide(request.policy, classification, &request.sql);
    debug!(?classification, ?decision, "Gate evaluated");
    decision
}

/// The policy table, without the skip flag.
pub fn decide(policy: WritePolicy, classification: WriteClassification, sql: &str) -> GateDecision {
    let kind = match classification.kind {
        Some(kind) if classification.is_write => kind,
        _ => return GateDecision::Allow,
    };
    match policy {
        WritePolicy::ReadOnly => GateDecision::Block { kind },
        WritePolicy::Confirm => GateDecision::NeedsConfirmation {
            kind,
            sql: sql.to_string(),
        },
        WritePolicy::SkipConfirmation => GateDecision::Allow,
    }
}

/// What `execute` produced: rows, or the reason nothing ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Executed(ExecutionResult),
    NeedsConfirmation { kind: WriteKind, sql: String },
    Blocked { kind: WriteKind },
}

impl QueryOutcome {
    /// Maps the non-executed outcomes onto their errors.
    pub fn into_result(self) -> EngineResult<ExecutionResult> {
        match self {
            QueryOutcome::Executed(result) => Ok(result),
            QueryOutcome::NeedsConfirmation { kind, sql } => {
                Err(EngineError::write_operation(kind, sql))
            }
            QueryOutcome::Blocked { kind } => Err(EngineError::unsafe_query(kind)),
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, QueryOutcome::Executed(_))
    }
}

impl GateDecision {
    /// The outcome to return instead of executing, if any.
    pub fn into_outcome(self) -> Option<QueryOutcome> {
        match self {
            GateDecision::Allow => None,
            GateDecision::Block { kind } => Some(QueryOutcome::Blocked { kind }),
            GateDecision::NeedsConfirmation { kind, sql } => {
                Some(QueryOutcome::NeedsConfirmation { kind, sql })
            }
        }
    }
}
