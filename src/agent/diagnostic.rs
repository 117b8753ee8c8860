//! Differential diagnosis agent.

use super::{format_evidence, AgentCore, AgentSettings, EvidenceSet, ReasoningAgent};
use crate::backend::TextBackend;
use crate::models::{AgentKind, AgentOutcome, ClinicalCase};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const TASK: &str = r#"Task: produce a ranked differential diagnosis for the case below.
Respond with JSON of the form:
{"labels": [{"name": "<diagnosis>", "probability": <0..1>}], "confidence": <0..1>, "rationale": "<one or two sentences>"}
List at most five diagnoses, most likely first."#;

/// Proposes ranked diagnoses from the case and any retrieved evidence.
pub struct DiagnosticAgent {
    core: AgentCore,
}

impl DiagnosticAgent {
    pub fn new(backend: Arc<dyn TextBackend>, settings: AgentSettings) -> Self {
        Self::with_id("diagnostic", backend, settings)
    }

    pub fn with_id(
        id: impl Into<String>,
        backend: Arc<dyn TextBackend>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            core: AgentCore::new(AgentKind::Diagnostic, id, backend, settings),
        }
    }

    fn build_prompt(&self, case: &ClinicalCase, evidence: &EvidenceSet) -> String {
        let mut prompt = format!("{}\n\n## Case\n{}", TASK, case.summary());

        // Evidence is optional context here; its absence is not a failure.
        if let Ok(snippets) = evidence {
            if !snippets.is_empty() {
                prompt.push_str("\n## Supporting evidence\n");
                prompt.push_str(&format_evidence(snippets));
            }
        }

        prompt
    }
}

#[async_trait]
impl ReasoningAgent for DiagnosticAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Diagnostic
    }

    fn id(&self) -> &str {
        &self.core.id
    }

    fn timeout(&self) -> Duration {
        self.core.settings.timeout
    }

    async fn assess(&self, case: &ClinicalCase, evidence: &EvidenceSet) -> AgentOutcome {
        let prompt = self.build_prompt(case, evidence);
        self.core.ask(&prompt).await
    }
}
