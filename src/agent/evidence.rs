//! Evidence synthesis agent.
//!
//! Grounds its opinion strictly in retrieved snippets. When retrieval
//! failed the agent reports `backend-unavailable` instead of answering
//! from the model's own priors.

use super::{format_evidence, AgentCore, AgentSettings, EvidenceSet, ReasoningAgent};
use crate::backend::TextBackend;
use crate::models::{AgentKind, AgentOutcome, ClinicalCase, FailureReason};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const TASK: &str = r#"Task: using ONLY the evidence excerpts below, estimate which diagnoses the evidence supports for this case.
Respond with JSON of the form:
{"labels": [{"name": "<diagnosis>", "probability": <0..1>}], "confidence": <0..1>, "rationale": "<cite excerpt numbers>"}
If the excerpts do not bear on the case, return low confidence."#;

const NO_EVIDENCE: &str = "No excerpts were retrieved for this case. Return an empty label list and confidence 0.";

pub struct EvidenceAgent {
    core: AgentCore,
}

impl EvidenceAgent {
    pub fn new(backend: Arc<dyn TextBackend>, settings: AgentSettings) -> Self {
        Self::with_id("evidence", backend, settings)
    }

    pub fn with_id(
        id: impl Into<String>,
        backend: Arc<dyn TextBackend>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            core: AgentCore::new(AgentKind::Evidence, id, backend, settings),
        }
    }
}

#[async_trait]
impl ReasoningAgent for EvidenceAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Evidence
    }

    fn id(&self) -> &str {
        &self.core.id
    }

    fn timeout(&self) -> Duration {
        self.core.settings.timeout
    }

    async fn assess(&self, case: &ClinicalCase, evidence: &EvidenceSet) -> AgentOutcome {
        let snippets = match evidence {
            Ok(snippets) => snippets,
            Err(e) => {
                warn!(agent = %self.core.id, error = %e, "evidence agent has no evidence source");
                return Err(self.core.failure(
                    FailureReason::BackendUnavailable,
                    format!("evidence unavailable: {}", e),
                ));
            }
        };

        let mut prompt = format!("{}\n\n## Case\n{}\n## Evidence\n", TASK, case.summary());
        if snippets.is_empty() {
            prompt.push_str(NO_EVIDENCE);
        } else {
            prompt.push_str(&format_evidence(snippets));
        }

        self.core.ask(&prompt).await
    }
}
