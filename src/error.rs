//! Error types for the fusion pipeline.
//!
//! Agent-level problems never appear here: they are recovered locally as
//! [`AgentFailure`] values. Only pipeline-level conditions propagate.

use crate::models::AgentFailure;
use std::time::Duration;

/// Errors returned by [`crate::pipeline::evaluate`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed input rejected before any agent ran.
    #[error("invalid case: {0}")]
    InvalidCase(String),

    /// Inconsistent pipeline configuration.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// No agent produced an opinion.
    #[error(
        "total failure: none of the {} agents produced an opinion ({})",
        failures.len(),
        summarize(failures)
    )]
    TotalFailure { failures: Vec<AgentFailure> },
}

fn summarize(failures: &[AgentFailure]) -> String {
    if failures.is_empty() {
        return "no agents configured".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.agent_id, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from the text-generation backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors from the evidence store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvidenceError {
    #[error("evidence store unavailable: {0}")]
    Unavailable(String),

    #[error("evidence retrieval timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the audit sink. Logged, never propagated to the caller.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to write audit trace: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to encode audit trace: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors while loading a safety rule table.
#[derive(Debug, thiserror::Error)]
pub enum RuleTableError {
    #[error("failed to read rule table: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rule table: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },
}
