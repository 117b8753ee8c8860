//! Medication suggestion agent.
//!
//! Its labels are candidate prescriptions rather than diagnoses; they are
//! screened by the safety gate but never ranked against diagnoses.

use super::{AgentCore, AgentSettings, EvidenceSet, ReasoningAgent};
use crate::backend::TextBackend;
use crate::models::{AgentKind, AgentOutcome, ClinicalCase};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const TASK: &str = r#"Task: suggest candidate medications for the most likely presentation of this case and flag safety concerns with the patient's current medications, allergies and conditions.
Respond with JSON of the form:
{"labels": [{"name": "<generic drug name>", "probability": <0..1>}], "confidence": <0..1>, "rationale": "<one sentence>", "warnings": ["<concern>"]}
Use lower-case generic names. Probability is how strongly you would suggest the drug."#;

pub struct DrugSafetyAgent {
    core: AgentCore,
}

impl DrugSafetyAgent {
    pub fn new(backend: Arc<dyn TextBackend>, settings: AgentSettings) -> Self {
        Self::with_id("drug-safety", backend, settings)
    }

    pub fn with_id(
        id: impl Into<String>,
        backend: Arc<dyn TextBackend>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            core: AgentCore::new(AgentKind::DrugSafety, id, backend, settings),
        }
    }
}

#[async_trait]
impl ReasoningAgent for DrugSafetyAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::DrugSafety
    }

    fn id(&self) -> &str {
        &self.core.id
    }

    fn timeout(&self) -> Duration {
        self.core.settings.timeout
    }

    async fn assess(&self, case: &ClinicalCase, _evidence: &EvidenceSet) -> AgentOutcome {
        let prompt = format!("{}\n\n## Case\n{}", TASK, case.summary());
        self.core.ask(&prompt).await
    }
}
