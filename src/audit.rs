//! Audit traces and sinks.
//!
//! One [`AuditTrace`] is emitted per pipeline invocation. Sink failures
//! are logged and never change the returned assessment.

use crate::error::AuditError;
use crate::models::{AgentKind, AssessmentOutput, FailureReason, GateStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Structured record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrace {
    pub trace_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub rule_table_version: String,
    pub evidence: EvidenceTrace,
    /// Every configured agent, in canonical order.
    pub agents: Vec<AgentTraceEntry>,
    pub rules_fired: Vec<String>,
    pub gate_status: GateStatus,
    pub provisional: bool,
    pub output: AssessmentOutput,
}

impl AuditTrace {
    pub fn failed_agents(&self) -> impl Iterator<Item = &AgentTraceEntry> {
        self.agents.iter().filter(|a| a.status == AgentStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceTrace {
    pub available: bool,
    /// Source ids of the snippets handed to agents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTraceEntry {
    pub kind: AgentKind,
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub elapsed_ms: u64,
}

/// Destination for audit traces.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, trace: &AuditTrace) -> Result<(), AuditError>;
}

/// Record `trace` within `timeout`, logging (not propagating) any failure.
pub async fn emit(sink: &dyn AuditSink, trace: &AuditTrace, timeout: Duration) {
    match tokio::time::timeout(timeout, sink.record(trace)).await {
        Ok(Ok(())) => debug!(trace_id = %trace.trace_id, "audit trace recorded"),
        Ok(Err(e)) => warn!(
            trace_id = %trace.trace_id,
            error = %e,
            "audit sink failed; result returned anyway"
        ),
        Err(_) => warn!(
            trace_id = %trace.trace_id,
            timeout_ms = timeout.as_millis() as u64,
            "audit sink timed out; result returned anyway"
        ),
    }
}

/// Appends one JSON object per line.
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, trace: &AuditTrace) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(trace)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps traces in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    traces: Mutex<Vec<AuditTrace>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<AuditTrace> {
        self.traces.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, trace: &AuditTrace) -> Result<(), AuditError> {
        if let Ok(mut traces) = self.traces.lock() {
            traces.push(trace.clone());
        }
        Ok(())
    }
}
