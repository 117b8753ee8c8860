//! Pipeline entry point.
//!
//! `evaluate` runs one case end to end: validation, evidence retrieval,
//! concurrent agents, uncertainty estimation, the safety gate, result
//! assembly and auditing. All collaborators arrive through an explicit
//! [`PipelineContext`]; nothing is global.

use crate::agent::{AgentSettings, EvidenceSet, ReasoningAgent};
use crate::audit::{self, AuditSink, AuditTrace};
use crate::error::{EvidenceError, PipelineError};
use crate::evidence::{EvidenceAdapter, EvidenceStore};
use crate::fusion;
use crate::models::{ClinicalCase, FusedAssessment};
use crate::orchestrator::Orchestrator;
use crate::safety::{self, GateInput, RuleTable};
use crate::uncertainty::{self, EstimatorSettings, RiskThresholds};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Tunables for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Per-agent budget. Used when building agents and enforced as a cap
    /// on every agent at evaluation time.
    pub agent_timeout: Duration,
    /// Bound on the whole agent cohort.
    pub global_timeout: Duration,
    pub evidence_timeout: Duration,
    /// Bound on recording the audit trace.
    pub audit_timeout: Duration,
    pub evidence_k: usize,
    pub min_relevance: f64,
    pub risk_thresholds: RiskThresholds,
    pub variance_penalty: f64,
    /// Expected rule table version; a mismatch makes results provisional.
    pub rule_table_version: Option<String>,
    pub max_rule_age_days: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(20),
            global_timeout: Duration::from_secs(30),
            evidence_timeout: Duration::from_secs(5),
            audit_timeout: Duration::from_secs(5),
            evidence_k: 5,
            min_relevance: 0.0,
            risk_thresholds: RiskThresholds::default(),
            variance_penalty: 1.0,
            rule_table_version: None,
            max_rule_age_days: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        for (name, value) in [
            ("agent_timeout", self.agent_timeout),
            ("global_timeout", self.global_timeout),
            ("evidence_timeout", self.evidence_timeout),
            ("audit_timeout", self.audit_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("{} must be greater than zero", name));
            }
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return invalid(format!(
                "min_relevance must be within [0, 1], got {}",
                self.min_relevance
            ));
        }
        if !self.variance_penalty.is_finite() || self.variance_penalty < 0.0 {
            return invalid(format!(
                "variance_penalty must be a non-negative number, got {}",
                self.variance_penalty
            ));
        }
        self.risk_thresholds.validate().map_err(PipelineError::InvalidConfig)?;

        Ok(())
    }

    /// Agent settings derived from this configuration.
    pub fn agent_settings(&self, max_tokens: usize) -> AgentSettings {
        AgentSettings {
            timeout: self.agent_timeout,
            max_tokens,
        }
    }

    fn estimator_settings(&self) -> EstimatorSettings {
        EstimatorSettings {
            thresholds: self.risk_thresholds,
            variance_penalty: self.variance_penalty,
        }
    }
}

/// Collaborators of a pipeline run.
pub struct PipelineContext {
    pub agents: Vec<Arc<dyn ReasoningAgent>>,
    pub evidence_store: Option<Arc<dyn EvidenceStore>>,
    pub rules: RuleTable,
    pub audit: Arc<dyn AuditSink>,
}

impl PipelineContext {
    pub fn new(
        agents: Vec<Arc<dyn ReasoningAgent>>,
        rules: RuleTable,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            agents,
            evidence_store: None,
            rules,
            audit,
        }
    }

    pub fn with_evidence_store(mut self, store: Arc<dyn EvidenceStore>) -> Self {
        self.evidence_store = Some(store);
        self
    }
}

/// Assessment together with the trace that was sent to the audit sink.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub assessment: FusedAssessment,
    pub trace: AuditTrace,
}

/// Evaluate `case` and return the fused assessment.
pub async fn evaluate(
    case: &ClinicalCase,
    config: &PipelineConfig,
    context: &PipelineContext,
) -> Result<FusedAssessment, PipelineError> {
    evaluate_with_trace(case, config, context)
        .await
        .map(|evaluation| evaluation.assessment)
}

/// Like [`evaluate`], also returning the audit trace.
pub async fn evaluate_with_trace(
    case: &ClinicalCase,
    config: &PipelineConfig,
    context: &PipelineContext,
) -> Result<Evaluation, PipelineError> {
    config.validate()?;
    case.validate().map_err(PipelineError::InvalidCase)?;

    info!(
        agents = context.agents.len(),
        medications = case.medications.len(),
        rule_table = %context.rules.version,
        "evaluating case"
    );

    let evidence = retrieve_evidence(case, config, context).await;

    let orchestrator = Orchestrator::new(context.agents.clone(), config.global_timeout)
        .with_agent_timeout(config.agent_timeout);
    let cohort = orchestrator.run(case, &evidence).await.map_err(|e| {
        error!(error = %e, "no agent produced an opinion");
        e
    })?;

    let opinions = cohort.opinions();
    let estimation = uncertainty::estimate(&opinions, &config.estimator_settings());

    let stale_reason = context.rules.staleness(
        config.rule_table_version.as_deref(),
        config.max_rule_age_days,
        Utc::now().date_naive(),
    );
    if let Some(ref reason) = stale_reason {
        warn!(reason = %reason, "rule table is stale; result will be provisional");
    }

    let decision = safety::evaluate(GateInput {
        case,
        ranking: &estimation.ranking,
        opinions: &opinions,
        table: &context.rules,
        stale_reason: stale_reason.as_deref(),
    });

    let assessment = fusion::assemble(estimation, decision, &cohort);
    let trace = fusion::trace(&assessment, &cohort, &evidence, &context.rules.version);
    audit::emit(context.audit.as_ref(), &trace, config.audit_timeout).await;

    info!(
        trace_id = %trace.trace_id,
        gate = %assessment.gate_status,
        risk = %assessment.risk_band,
        confidence = assessment.confidence,
        provisional = assessment.provisional,
        "assessment complete"
    );

    Ok(Evaluation { assessment, trace })
}

async fn retrieve_evidence(
    case: &ClinicalCase,
    config: &PipelineConfig,
    context: &PipelineContext,
) -> EvidenceSet {
    let Some(ref store) = context.evidence_store else {
        return Err(EvidenceError::Unavailable("no evidence store configured".to_string()));
    };

    EvidenceAdapter::new(store.clone(), config.evidence_timeout)
        .with_min_relevance(config.min_relevance)
        .retrieve(&case.retrieval_query(), config.evidence_k)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{DiagnosticAgent, DrugSafetyAgent, EvidenceAgent};
    use crate::audit::{AgentStatus, JsonlAuditSink, MemoryAuditSink};
    use crate::backend::stub::{ScriptedBackend, Step};
    use crate::error::BackendError;
    use crate::evidence::InMemoryEvidenceStore;
    use crate::models::{
        FailureReason, GateStatus, Medication, RiskBand, Severity, REFERRAL_MARKER,
    };
    use crate::safety::STALE_TABLE_RULE;

    const RULES: &str = r#"
version = "test-1"
reviewed_on = "2026-01-01"

[[interaction]]
id = "interaction.warfarin-aspirin"
drugs = ["warfarin", "aspirin"]
hard = true
explanation = "Additive bleeding risk"
"#;

    const DIAGNOSTIC_REPLY: &str = r#"{"labels": [{"name": "flu", "probability": 0.6}, {"name": "cold", "probability": 0.4}],
        "confidence": 0.8, "rationale": "fever with myalgia"}"#;
    const EVIDENCE_REPLY: &str = r#"{"labels": [{"name": "flu", "probability": 0.5}, {"name": "cold", "probability": 0.5}],
        "confidence": 0.6, "rationale": "[1]"}"#;
    const DRUG_REPLY: &str = r#"{"labels": [{"name": "paracetamol", "probability": 0.8}],
        "confidence": 0.7, "rationale": "symptomatic relief"}"#;

    fn scripted(reply: &str) -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend::always(reply))
    }

    fn agents(diagnostic: Step, evidence: Step, drug: Step) -> Vec<Arc<dyn ReasoningAgent>> {
        let settings = PipelineConfig::default().agent_settings(256);
        vec![
            Arc::new(DiagnosticAgent::new(
                Arc::new(ScriptedBackend::new(vec![diagnostic])),
                settings.clone(),
            )),
            Arc::new(EvidenceAgent::new(
                Arc::new(ScriptedBackend::new(vec![evidence])),
                settings.clone(),
            )),
            Arc::new(DrugSafetyAgent::new(Arc::new(ScriptedBackend::new(vec![drug])), settings)),
        ]
    }

    fn default_agents() -> Vec<Arc<dyn ReasoningAgent>> {
        agents(
            Step::Reply(DIAGNOSTIC_REPLY.to_string()),
            Step::Reply(EVIDENCE_REPLY.to_string()),
            Step::Reply(DRUG_REPLY.to_string()),
        )
    }

    fn store() -> Arc<InMemoryEvidenceStore> {
        let mut store = InMemoryEvidenceStore::new();
        store.add_document("flu.md", "Influenza causes fever, myalgia and cough.");
        Arc::new(store)
    }

    fn context(agents: Vec<Arc<dyn ReasoningAgent>>, audit: Arc<dyn AuditSink>) -> PipelineContext {
        PipelineContext::new(agents, RuleTable::from_toml_str(RULES).unwrap(), audit)
            .with_evidence_store(store())
    }

    fn case() -> ClinicalCase {
        ClinicalCase::new("fever, cough and myalgia").with_age(40)
    }

    #[tokio::test]
    async fn test_flu_cold_scenario_passes() {
        let sink = Arc::new(MemoryAuditSink::new());
        let ctx = context(default_agents(), sink.clone());

        let assessment = evaluate(&case(), &PipelineConfig::default(), &ctx).await.unwrap();

        assert_eq!(assessment.gate_status, GateStatus::Pass);
        assert_eq!(assessment.labels[0].name, "flu");
        assert!((assessment.labels[0].probability - 0.557).abs() < 1e-3);
        assert_eq!(assessment.uncertainty.contributing, 2);
        assert!(assessment.safety_findings.is_empty());
        assert!(!assessment.provisional);

        let traces = sink.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].agents.len(), 3);
        assert!(traces[0].evidence.available);
        assert_eq!(traces[0].evidence.sources, vec!["flu.md#1"]);
    }

    #[tokio::test]
    async fn test_permutation_invariance() {
        let sink: Arc<dyn AuditSink> = Arc::new(MemoryAuditSink::new());
        let forward = context(default_agents(), sink.clone());
        let mut reversed_agents = default_agents();
        reversed_agents.reverse();
        let reversed = context(reversed_agents, sink);

        let config = PipelineConfig::default();
        let a = evaluate(&case(), &config, &forward).await.unwrap();
        let b = evaluate(&case(), &config, &reversed).await.unwrap();

        assert_eq!(
            serde_json::to_string(&a.to_output()).unwrap(),
            serde_json::to_string(&b.to_output()).unwrap()
        );
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[tokio::test]
    async fn test_warfarin_aspirin_is_blocked() {
        let aspirin = r#"{"labels": [{"name": "aspirin", "probability": 0.9}], "confidence": 0.95, "rationale": "antiplatelet"}"#;
        let diagnosis = r#"{"labels": [{"name": "angina", "probability": 0.95}], "confidence": 0.99}"#;
        let ctx = context(
            agents(
                Step::Reply(diagnosis.to_string()),
                Step::Reply(diagnosis.to_string()),
                Step::Reply(aspirin.to_string()),
            ),
            Arc::new(MemoryAuditSink::new()),
        );
        let case = ClinicalCase::new("exertional chest pain")
            .with_medication(Medication::new("warfarin"));

        let evaluation = evaluate_with_trace(&case, &PipelineConfig::default(), &ctx)
            .await
            .unwrap();
        let assessment = evaluation.assessment;

        assert_eq!(assessment.gate_status, GateStatus::Blocked);
        assert_eq!(assessment.labels.len(), 1);
        assert_eq!(assessment.labels[0].name, REFERRAL_MARKER);
        assert_eq!(assessment.risk_band, RiskBand::High);
        assert_eq!(assessment.safety_findings[0].severity, Severity::Critical);
        assert_eq!(assessment.safety_findings[0].rule_id, "interaction.warfarin-aspirin");
        assert_eq!(evaluation.trace.rules_fired, vec!["interaction.warfarin-aspirin"]);
        assert_eq!(evaluation.trace.gate_status, GateStatus::Blocked);
    }

    #[tokio::test]
    async fn test_zero_responders_is_total_failure() {
        let down = || Step::Fail(BackendError::Unavailable("connection refused".to_string()));
        let sink = Arc::new(MemoryAuditSink::new());
        let ctx = context(agents(down(), down(), down()), sink.clone());

        let result = evaluate(&case(), &PipelineConfig::default(), &ctx).await;

        match result {
            Err(PipelineError::TotalFailure { failures }) => {
                assert_eq!(failures.len(), 3);
                assert!(failures
                    .iter()
                    .all(|f| f.reason == FailureReason::BackendUnavailable));
            }
            other => panic!("expected total failure, got {:?}", other.map(|a| a.gate_status)),
        }
        assert!(sink.traces().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_timeout_two_successes() {
        let ctx = context(
            agents(
                Step::Reply(DIAGNOSTIC_REPLY.to_string()),
                Step::Reply(EVIDENCE_REPLY.to_string()),
                Step::Hang,
            ),
            Arc::new(MemoryAuditSink::new()),
        );

        let evaluation = evaluate_with_trace(&case(), &PipelineConfig::default(), &ctx)
            .await
            .unwrap();

        let failed: Vec<_> = evaluation.trace.failed_agents().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].agent_id, "drug-safety");
        assert_eq!(failed[0].reason, Some(FailureReason::Timeout));
        assert_eq!(
            evaluation
                .trace
                .agents
                .iter()
                .filter(|a| a.status == AgentStatus::Succeeded)
                .count(),
            2
        );

        let estimate = &evaluation.assessment.uncertainty;
        assert_eq!(estimate.contributing, 2);
        assert!((estimate.epistemic_variance.unwrap() - 0.0025).abs() < 1e-12);
        assert!(evaluation.assessment.notes.iter().any(|n| n.contains("timeout")));
    }

    #[tokio::test]
    async fn test_single_responder_has_undefined_epistemic_variance() {
        let down = || Step::Fail(BackendError::Unavailable("down".to_string()));
        let ctx = context(
            agents(Step::Reply(DIAGNOSTIC_REPLY.to_string()), down(), down()),
            Arc::new(MemoryAuditSink::new()),
        );

        let assessment = evaluate(&case(), &PipelineConfig::default(), &ctx).await.unwrap();
        assert_eq!(assessment.uncertainty.epistemic_variance, None);
        assert_eq!(assessment.notes.len(), 2);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_block_result() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("no-such-dir").join("a.jsonl");
        let sink = Arc::new(JsonlAuditSink::new(path));
        let ctx = context(default_agents(), sink);

        let assessment = evaluate(&case(), &PipelineConfig::default(), &ctx).await;
        assert!(assessment.is_ok());
    }

    struct StalledSink;

    #[async_trait::async_trait]
    impl AuditSink for StalledSink {
        async fn record(&self, _trace: &AuditTrace) -> Result<(), crate::error::AuditError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_audit_sink_does_not_block_result() {
        let ctx = context(default_agents(), Arc::new(StalledSink));
        let config = PipelineConfig {
            audit_timeout: Duration::from_secs(2),
            ..PipelineConfig::default()
        };

        let case = case();
        let evaluation = evaluate(&case, &config, &ctx);
        let result = tokio::time::timeout(Duration::from_secs(3600), evaluation)
            .await
            .expect("evaluate returned despite a stalled audit sink");
        assert_eq!(result.unwrap().gate_status, GateStatus::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_agent_timeout_caps_agents() {
        // Agents are built with the 20s default; the evaluation asks for 1s.
        let ctx = context(
            agents(
                Step::Delay(Duration::from_secs(10), DIAGNOSTIC_REPLY.to_string()),
                Step::Reply(EVIDENCE_REPLY.to_string()),
                Step::Reply(DRUG_REPLY.to_string()),
            ),
            Arc::new(MemoryAuditSink::new()),
        );
        let config = PipelineConfig {
            agent_timeout: Duration::from_secs(1),
            ..PipelineConfig::default()
        };

        let started = tokio::time::Instant::now();
        let evaluation = evaluate_with_trace(&case(), &config, &ctx).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        let failed: Vec<_> = evaluation.trace.failed_agents().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].agent_id, "diagnostic");
        assert_eq!(failed[0].reason, Some(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn test_invalid_case_rejected_before_agents_run() {
        let backend = scripted(DIAGNOSTIC_REPLY);
        let agents: Vec<Arc<dyn ReasoningAgent>> = vec![Arc::new(DiagnosticAgent::new(
            backend.clone(),
            AgentSettings::default(),
        ))];
        let ctx = context(agents, Arc::new(MemoryAuditSink::new()));

        let result = evaluate(&ClinicalCase::new("   "), &PipelineConfig::default(), &ctx).await;
        assert!(matches!(result, Err(PipelineError::InvalidCase(_))));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_rule_table_is_provisional() {
        let ctx = context(default_agents(), Arc::new(MemoryAuditSink::new()));
        let config = PipelineConfig {
            rule_table_version: Some("test-2".to_string()),
            ..PipelineConfig::default()
        };

        let assessment = evaluate(&case(), &config, &ctx).await.unwrap();
        assert!(assessment.provisional);
        assert_eq!(assessment.gate_status, GateStatus::Pass);
        assert!(assessment
            .safety_findings
            .iter()
            .any(|f| f.rule_id == STALE_TABLE_RULE && f.severity == Severity::Info));
    }

    #[tokio::test]
    async fn test_missing_evidence_store_fails_evidence_agent_only() {
        let ctx = PipelineContext::new(
            default_agents(),
            RuleTable::from_toml_str(RULES).unwrap(),
            Arc::new(MemoryAuditSink::new()),
        );

        let evaluation = evaluate_with_trace(&case(), &PipelineConfig::default(), &ctx)
            .await
            .unwrap();
        let failed: Vec<_> = evaluation.trace.failed_agents().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].agent_id, "evidence");
        assert!(!evaluation.trace.evidence.available);
    }

    #[test]
    fn test_config_validation() {
        assert!(PipelineConfig::default().validate().is_ok());

        let zero = PipelineConfig {
            global_timeout: Duration::ZERO,
            ..PipelineConfig::default()
        };
        assert!(matches!(zero.validate(), Err(PipelineError::InvalidConfig(_))));

        let thresholds = PipelineConfig {
            risk_thresholds: RiskThresholds { low: 0.3, medium: 0.5 },
            ..PipelineConfig::default()
        };
        assert!(thresholds.validate().is_err());

        let penalty = PipelineConfig {
            variance_penalty: f64::NAN,
            ..PipelineConfig::default()
        };
        assert!(penalty.validate().is_err());
    }
}
