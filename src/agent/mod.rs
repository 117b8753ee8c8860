//! Reasoning agents.
//!
//! Every agent kind implements [`ReasoningAgent::assess`]; the set of kinds
//! is closed by [`AgentKind`]. Agents hold no per-invocation state, so a
//! single instance may serve concurrent pipeline runs.

pub mod diagnostic;
pub mod drug_safety;
pub mod evidence;
pub mod parse;

pub use diagnostic::DiagnosticAgent;
pub use drug_safety::DrugSafetyAgent;
pub use evidence::EvidenceAgent;

use crate::backend::{complete_with_retry, TextBackend};
use crate::error::{BackendError, EvidenceError};
use crate::models::{
    AgentFailure, AgentKind, AgentOutcome, ClinicalCase, EvidenceSnippet, FailureReason,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Evidence as seen by agents: the retrieved snippets, or why there are none.
pub type EvidenceSet = Result<Vec<EvidenceSnippet>, EvidenceError>;

/// Share of the agent timeout handed to the backend; the rest covers parsing.
const BACKEND_BUDGET_SHARE: f64 = 0.9;

/// The single capability shared by all agent kinds.
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Stable name, unique within one pipeline.
    fn id(&self) -> &str;

    /// Declared per-invocation timeout, enforced by the orchestrator.
    fn timeout(&self) -> Duration;

    /// Produce one opinion for `case`, or an explicit failure.
    async fn assess(&self, case: &ClinicalCase, evidence: &EvidenceSet) -> AgentOutcome;
}

/// Settings shared by the LLM-backed agents.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub timeout: Duration,
    pub max_tokens: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_tokens: 512,
        }
    }
}

/// Backend plumbing common to every LLM-backed agent.
#[derive(Clone)]
pub(crate) struct AgentCore {
    pub(crate) id: String,
    pub(crate) kind: AgentKind,
    pub(crate) backend: Arc<dyn TextBackend>,
    pub(crate) settings: AgentSettings,
}

impl AgentCore {
    pub(crate) fn new(
        kind: AgentKind,
        id: impl Into<String>,
        backend: Arc<dyn TextBackend>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            backend,
            settings,
        }
    }

    /// Send `prompt` and parse the reply into an opinion.
    pub(crate) async fn ask(&self, prompt: &str) -> AgentOutcome {
        let budget = self.settings.timeout.mul_f64(BACKEND_BUDGET_SHARE);
        let raw = complete_with_retry(
            self.backend.as_ref(),
            prompt,
            self.settings.max_tokens,
            budget,
        )
        .await
        .map_err(|e| self.backend_failure(e))?;

        debug!(agent = %self.id, bytes = raw.len(), "agent received reply");
        parse::parse_opinion(self.kind, &self.id, &raw)
    }

    pub(crate) fn failure(&self, reason: FailureReason, detail: impl Into<String>) -> AgentFailure {
        AgentFailure::new(self.kind, self.id.clone(), reason, detail)
    }

    fn backend_failure(&self, err: BackendError) -> AgentFailure {
        let reason = match err {
            BackendError::Timeout(_) => FailureReason::Timeout,
            BackendError::Unavailable(_) => FailureReason::BackendUnavailable,
            BackendError::InvalidResponse(_) => FailureReason::MalformedOutput,
        };
        self.failure(reason, err.to_string())
    }
}

/// Render evidence snippets for inclusion in a prompt.
pub(crate) fn format_evidence(snippets: &[EvidenceSnippet]) -> String {
    let mut out = String::new();
    for (i, snippet) in snippets.iter().enumerate() {
        out.push_str(&format!(
            "[{}] ({}, relevance {:.2})\n{}\n\n",
            i + 1,
            snippet.source,
            snippet.relevance,
            snippet.text.trim()
        ));
    }
    out
}

/// Build the default cohort: one agent of each kind sharing one backend.
pub fn default_cohort(
    backend: Arc<dyn TextBackend>,
    settings: AgentSettings,
) -> Vec<Arc<dyn ReasoningAgent>> {
    vec![
        Arc::new(DiagnosticAgent::new(backend.clone(), settings.clone())),
        Arc::new(EvidenceAgent::new(backend.clone(), settings.clone())),
        Arc::new(DrugSafetyAgent::new(backend, settings)),
    ]
}
