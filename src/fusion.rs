//! Fusion result builder.
//!
//! Combines the estimator output and the gate decision into the final
//! [`FusedAssessment`], enforcing that a critical finding always yields a
//! blocked, referral-only result, and derives the matching audit trace.

use crate::agent::EvidenceSet;
use crate::audit::{AgentStatus, AgentTraceEntry, AuditTrace, EvidenceTrace};
use crate::models::{
    FusedAssessment, GateStatus, LabelProbability, RiskBand, Severity, REFERRAL_MARKER,
};
use crate::orchestrator::CohortResult;
use crate::safety::GateDecision;
use crate::uncertainty::Estimation;
use chrono::Utc;
use uuid::Uuid;

/// Assemble the assessment. Deterministic in its inputs.
pub fn assemble(
    estimation: Estimation,
    decision: GateDecision,
    cohort: &CohortResult,
) -> FusedAssessment {
    let Estimation { ranking, estimate } = estimation;
    let mut notes = Vec::new();

    for failure in cohort.failures() {
        notes.push(format!(
            "{} agent {} excluded: {} ({})",
            failure.kind, failure.agent_id, failure.reason, failure.detail
        ));
    }

    let blocked = decision.status == GateStatus::Blocked
        || decision.findings.iter().any(|f| f.severity == Severity::Critical);

    let (labels, confidence, risk_band, status) = if blocked {
        let rules: Vec<&str> = decision
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .map(|f| f.rule_id.as_str())
            .collect();
        notes.push(format!(
            "blocked by critical safety finding(s) {}; refer to a clinician",
            rules.join(", ")
        ));
        (
            vec![LabelProbability::new(REFERRAL_MARKER, 0.0)],
            0.0,
            RiskBand::High,
            GateStatus::Blocked,
        )
    } else {
        if ranking.is_empty() {
            notes.push(if estimate.contributing == 0 {
                "no diagnostic or evidence opinion was available; nothing to rank".to_string()
            } else {
                "contributing opinions proposed no labels".to_string()
            });
        }
        let band = match decision.status {
            GateStatus::Downgraded => RiskBand::High,
            _ => estimate.risk_band,
        };
        (ranking, estimate.posterior_confidence, band, decision.status)
    };

    if decision.provisional {
        notes.push("safety rules may be out of date; result is provisional".to_string());
    }

    FusedAssessment {
        labels,
        uncertainty: estimate,
        confidence,
        risk_band,
        safety_findings: decision.findings,
        gate_status: status,
        provisional: decision.provisional,
        notes,
    }
}

/// Build the audit trace for one run.
pub fn trace(
    assessment: &FusedAssessment,
    cohort: &CohortResult,
    evidence: &EvidenceSet,
    rule_table_version: &str,
) -> AuditTrace {
    let agents = cohort
        .runs
        .iter()
        .map(|run| {
            let elapsed_ms = run.elapsed.as_millis() as u64;
            match &run.outcome {
                Ok(opinion) => AgentTraceEntry {
                    kind: opinion.kind,
                    agent_id: opinion.agent_id.clone(),
                    status: AgentStatus::Succeeded,
                    reason: None,
                    detail: None,
                    top_label: opinion.labels.first().map(|l| l.name.clone()),
                    confidence: Some(opinion.confidence),
                    elapsed_ms,
                },
                Err(failure) => AgentTraceEntry {
                    kind: failure.kind,
                    agent_id: failure.agent_id.clone(),
                    status: AgentStatus::Failed,
                    reason: Some(failure.reason),
                    detail: Some(failure.detail.clone()),
                    top_label: None,
                    confidence: None,
                    elapsed_ms,
                },
            }
        })
        .collect();

    let evidence = match evidence {
        Ok(snippets) => EvidenceTrace {
            available: true,
            sources: snippets.iter().map(|s| s.source.clone()).collect(),
            error: None,
        },
        Err(e) => EvidenceTrace {
            available: false,
            sources: Vec::new(),
            error: Some(e.to_string()),
        },
    };

    AuditTrace {
        trace_id: Uuid::new_v4(),
        recorded_at: Utc::now(),
        rule_table_version: rule_table_version.to_string(),
        evidence,
        agents,
        rules_fired: assessment.safety_findings.iter().map(|f| f.rule_id.clone()).collect(),
        gate_status: assessment.gate_status,
        provisional: assessment.provisional,
        output: assessment.to_output(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvidenceError;
    use crate::models::{
        AgentFailure, AgentKind, ConfidenceInterval, FailureReason, Opinion, SafetyFinding,
        UncertaintyEstimate,
    };
    use crate::orchestrator::AgentRun;
    use std::time::Duration;

    fn estimation() -> Estimation {
        Estimation {
            ranking: vec![
                LabelProbability::new("flu", 0.557),
                LabelProbability::new("cold", 0.443),
            ],
            estimate: UncertaintyEstimate {
                top_label: Some("flu".to_string()),
                posterior_confidence: 0.8,
                epistemic_variance: Some(0.0025),
                aleatoric_variance: 0.2,
                risk_band: RiskBand::Low,
                contributing: 2,
                confidence_interval: Some(ConfidenceInterval { lower: 0.5, upper: 0.6 }),
                explanation: String::new(),
            },
        }
    }

    fn decision(status: GateStatus, findings: Vec<SafetyFinding>) -> GateDecision {
        GateDecision {
            status,
            findings,
            provisional: false,
        }
    }

    fn cohort() -> CohortResult {
        CohortResult {
            runs: vec![
                AgentRun {
                    outcome: Ok(Opinion {
                        kind: AgentKind::Diagnostic,
                        agent_id: "diagnostic".to_string(),
                        labels: vec![LabelProbability::new("flu", 0.6)],
                        rationale: String::new(),
                        confidence: 0.8,
                    }),
                    elapsed: Duration::from_millis(150),
                },
                AgentRun {
                    outcome: Err(AgentFailure::new(
                        AgentKind::DrugSafety,
                        "drug-safety",
                        FailureReason::Timeout,
                        "no answer within 2000ms",
                    )),
                    elapsed: Duration::from_secs(2),
                },
            ],
        }
    }

    #[test]
    fn test_pass_keeps_estimate() {
        let assessment = assemble(estimation(), decision(GateStatus::Pass, vec![]), &cohort());
        assert_eq!(assessment.gate_status, GateStatus::Pass);
        assert_eq!(assessment.labels[0].name, "flu");
        assert_eq!(assessment.confidence, 0.8);
        assert_eq!(assessment.risk_band, RiskBand::Low);
        assert_eq!(assessment.notes.len(), 1);
        assert!(assessment.notes[0].contains("drug-safety excluded: timeout"));
    }

    #[test]
    fn test_downgrade_forces_high_risk() {
        let findings = vec![SafetyFinding::new(Severity::Warning, "interaction.x", "soft")];
        let assessment = assemble(
            estimation(),
            decision(GateStatus::Downgraded, findings),
            &cohort(),
        );
        assert_eq!(assessment.risk_band, RiskBand::High);
        assert_eq!(assessment.confidence, 0.8);
        assert_eq!(assessment.labels.len(), 2);
    }

    #[test]
    fn test_critical_finding_always_blocks() {
        // Even if a caller hands over an inconsistent status.
        let findings = vec![SafetyFinding::new(
            Severity::Critical,
            "interaction.warfarin-aspirin",
            "bleeding",
        )];
        let assessment = assemble(estimation(), decision(GateStatus::Pass, findings), &cohort());

        assert_eq!(assessment.gate_status, GateStatus::Blocked);
        assert!(assessment.is_referral());
        assert_eq!(assessment.confidence, 0.0);
        assert_eq!(assessment.risk_band, RiskBand::High);
        assert_eq!(assessment.uncertainty.posterior_confidence, 0.8);
        assert!(assessment
            .notes
            .iter()
            .any(|n| n.contains("interaction.warfarin-aspirin")));
    }

    #[test]
    fn test_empty_ranking_has_note() {
        let empty = Estimation {
            ranking: Vec::new(),
            estimate: UncertaintyEstimate {
                top_label: None,
                posterior_confidence: 0.0,
                epistemic_variance: None,
                aleatoric_variance: 0.0,
                risk_band: RiskBand::High,
                contributing: 0,
                confidence_interval: None,
                explanation: String::new(),
            },
        };
        let assessment = assemble(empty, decision(GateStatus::Pass, vec![]), &cohort());
        assert!(assessment.labels.is_empty());
        assert!(assessment.notes.iter().any(|n| n.contains("nothing to rank")));
    }

    #[test]
    fn test_trace_records_agents_and_evidence() {
        let cohort = cohort();
        let assessment = assemble(estimation(), decision(GateStatus::Pass, vec![]), &cohort);

        let trace = trace(
            &assessment,
            &cohort,
            &Err(EvidenceError::Unavailable("offline".to_string())),
            "2026.1",
        );

        assert_eq!(trace.agents.len(), 2);
        assert_eq!(trace.agents[0].status, AgentStatus::Succeeded);
        assert_eq!(trace.agents[0].top_label.as_deref(), Some("flu"));
        assert_eq!(trace.agents[1].reason, Some(FailureReason::Timeout));
        assert_eq!(trace.agents[1].elapsed_ms, 2000);
        assert!(!trace.evidence.available);
        assert_eq!(trace.rule_table_version, "2026.1");
        assert_eq!(trace.output, assessment.to_output());
    }
}
