//! Data models for the fusion pipeline.
//!
//! This module contains the structures that flow between pipeline stages:
//! the immutable case, retrieved evidence, agent opinions and failures,
//! the uncertainty estimate, safety findings and the fused assessment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker label that replaces the ranking of a blocked assessment.
pub const REFERRAL_MARKER: &str = "refer-to-clinician";

/// Version of the stable output schema handed to external sinks.
pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

/// Kind of reasoning agent. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Differential diagnosis from the case presentation
    Diagnostic,
    /// Diagnosis grounded in retrieved evidence
    Evidence,
    /// Candidate prescriptions and medication safety commentary
    DrugSafety,
}

impl AgentKind {
    /// Canonical order used for logs, traces and tests.
    pub const CANONICAL: [AgentKind; 3] = [
        AgentKind::Diagnostic,
        AgentKind::Evidence,
        AgentKind::DrugSafety,
    ];

    /// Tie-break priority (lower wins).
    pub fn priority(&self) -> u8 {
        match self {
            AgentKind::Diagnostic => 0,
            AgentKind::Evidence => 1,
            AgentKind::DrugSafety => 2,
        }
    }

    /// Whether opinions of this kind contribute probability mass to the ranking.
    pub fn contributes_to_ranking(&self) -> bool {
        matches!(self, AgentKind::Diagnostic | AgentKind::Evidence)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Diagnostic => write!(f, "diagnostic"),
            AgentKind::Evidence => write!(f, "evidence"),
            AgentKind::DrugSafety => write!(f, "drug-safety"),
        }
    }
}

/// Vital signs recorded at presentation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate_bpm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respiratory_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic_bp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diastolic_bp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2_pct: Option<f64>,
}

impl Vitals {
    fn readings(&self) -> [(&'static str, Option<f64>); 6] {
        [
            ("temperature_c", self.temperature_c),
            ("heart_rate_bpm", self.heart_rate_bpm),
            ("respiratory_rate", self.respiratory_rate),
            ("systolic_bp", self.systolic_bp),
            ("diastolic_bp", self.diastolic_bp),
            ("spo2_pct", self.spo2_pct),
        ]
    }
}

/// A medication the patient is currently taking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    /// Total daily dose in milligrams, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_dose_mg: Option<f64>,
}

impl Medication {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            daily_dose_mg: None,
        }
    }

    pub fn with_daily_dose(mut self, mg: f64) -> Self {
        self.daily_dose_mg = Some(mg);
        self
    }
}

/// The immutable input of one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalCase {
    /// Free-text symptom description.
    pub symptoms: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vitals: Option<Vitals>,
    #[serde(default)]
    pub medications: Vec<Medication>,
    #[serde(default)]
    pub allergies: Vec<String>,
    /// Known diagnoses and chronic conditions.
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub pregnant: bool,
}

impl ClinicalCase {
    pub fn new(symptoms: impl Into<String>) -> Self {
        Self {
            symptoms: symptoms.into(),
            ..Self::default()
        }
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_medication(mut self, medication: Medication) -> Self {
        self.medications.push(medication);
        self
    }

    pub fn with_allergy(mut self, allergy: impl Into<String>) -> Self {
        self.allergies.push(allergy.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// Reject malformed input before any agent runs.
    pub fn validate(&self) -> Result<(), String> {
        if self.symptoms.trim().is_empty() {
            return Err("symptom description is empty".to_string());
        }

        if let Some(age) = self.age {
            if age > 130 {
                return Err(format!("age {} is out of range", age));
            }
        }

        if let Some(ref vitals) = self.vitals {
            for (name, value) in vitals.readings() {
                if let Some(v) = value {
                    if !v.is_finite() || v < 0.0 {
                        return Err(format!("vital sign {} has invalid value {}", name, v));
                    }
                }
            }
        }

        for medication in &self.medications {
            if medication.name.trim().is_empty() {
                return Err("medication entry without a name".to_string());
            }
            if let Some(dose) = medication.daily_dose_mg {
                if !dose.is_finite() || dose < 0.0 {
                    return Err(format!(
                        "medication {} has invalid daily dose {}",
                        medication.name, dose
                    ));
                }
            }
        }

        if self.allergies.iter().any(|a| a.trim().is_empty()) {
            return Err("empty allergy entry".to_string());
        }

        Ok(())
    }

    /// Query string handed to the evidence store.
    pub fn retrieval_query(&self) -> String {
        let mut query = self.symptoms.trim().to_string();
        for condition in &self.conditions {
            query.push(' ');
            query.push_str(condition);
        }
        query
    }

    /// Plain-text rendering used inside agent prompts.
    pub fn summary(&self) -> String {
        let mut out = format!("Symptoms: {}\n", self.symptoms.trim());

        if let Some(age) = self.age {
            out.push_str(&format!("Age: {}\n", age));
        }
        if self.pregnant {
            out.push_str("Pregnant: yes\n");
        }
        if let Some(ref vitals) = self.vitals {
            let readings: Vec<String> = vitals
                .readings()
                .iter()
                .filter_map(|(name, value)| value.map(|v| format!("{}={}", name, v)))
                .collect();
            if !readings.is_empty() {
                out.push_str(&format!("Vitals: {}\n", readings.join(", ")));
            }
        }
        if !self.medications.is_empty() {
            let meds: Vec<String> = self
                .medications
                .iter()
                .map(|m| match m.daily_dose_mg {
                    Some(dose) => format!("{} ({} mg/day)", m.name, dose),
                    None => m.name.clone(),
                })
                .collect();
            out.push_str(&format!("Medications: {}\n", meds.join(", ")));
        }
        if !self.allergies.is_empty() {
            out.push_str(&format!("Allergies: {}\n", self.allergies.join(", ")));
        }
        if !self.conditions.is_empty() {
            out.push_str(&format!("Conditions: {}\n", self.conditions.join(", ")));
        }

        out
    }
}

/// A ranked snippet returned by the evidence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSnippet {
    pub text: String,
    /// Source identifier (document name, guideline id).
    pub source: String,
    /// Relevance score in [0, 1].
    pub relevance: f64,
}

/// One (label, probability) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelProbability {
    pub name: String,
    pub probability: f64,
}

impl LabelProbability {
    pub fn new(name: impl Into<String>, probability: f64) -> Self {
        Self {
            name: name.into(),
            probability,
        }
    }
}

/// Structured output of one reasoning agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opinion {
    pub kind: AgentKind,
    /// Stable name of the agent that produced this opinion.
    pub agent_id: String,
    /// Ranked labels; probabilities sum to at most 1.
    pub labels: Vec<LabelProbability>,
    pub rationale: String,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
}

impl Opinion {
    /// Probability this opinion assigns to `label` (0 when absent).
    pub fn probability_of(&self, label: &str) -> f64 {
        self.labels
            .iter()
            .find(|l| l.name == label)
            .map(|l| l.probability)
            .unwrap_or(0.0)
    }
}

/// Why an agent produced no opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Timeout,
    BackendUnavailable,
    MalformedOutput,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::BackendUnavailable => write!(f, "backend-unavailable"),
            FailureReason::MalformedOutput => write!(f, "malformed-output"),
        }
    }
}

/// Alternative outcome of an agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub kind: AgentKind,
    pub agent_id: String,
    pub reason: FailureReason,
    pub detail: String,
}

impl AgentFailure {
    pub fn new(
        kind: AgentKind,
        agent_id: impl Into<String>,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            agent_id: agent_id.into(),
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} agent {} failed ({}): {}",
            self.kind, self.agent_id, self.reason, self.detail
        )
    }
}

/// Result of a single agent invocation.
pub type AgentOutcome = Result<Opinion, AgentFailure>;

/// Discretized confidence level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskBand::Low => write!(f, "low"),
            RiskBand::Medium => write!(f, "medium"),
            RiskBand::High => write!(f, "high"),
        }
    }
}

/// Fused confidence with its uncertainty decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyEstimate {
    /// Label with the highest weighted probability.
    pub top_label: Option<String>,
    /// Posterior confidence after the variance penalty.
    pub posterior_confidence: f64,
    /// Inter-agent disagreement on the top label. `None` means undefined
    /// (fewer than two contributing opinions).
    pub epistemic_variance: Option<f64>,
    /// Declared per-agent uncertainty.
    pub aleatoric_variance: f64,
    pub risk_band: RiskBand,
    /// Number of opinions that contributed probability mass.
    pub contributing: usize,
    /// Spread of the contributors' top-label probabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_interval: Option<ConfidenceInterval>,
    /// Plain-language reading of the numbers above.
    #[serde(default)]
    pub explanation: String,
}

/// Lowest and highest probability any contributing agent gave the top label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Severity of a safety finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - recorded, does not change the gate outcome
    Info,
    /// Warning - heuristic or partial match, downgrades the assessment
    Warning,
    /// Critical - hard rule matched exactly, blocks the assessment
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl Severity {
    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Info => "🔵",
            Severity::Warning => "🟠",
            Severity::Critical => "🔴",
        }
    }
}

/// One rule match produced by the safety gate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SafetyFinding {
    pub severity: Severity,
    pub rule_id: String,
    pub explanation: String,
}

impl SafetyFinding {
    pub fn new(
        severity: Severity,
        rule_id: impl Into<String>,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            rule_id: rule_id.into(),
            explanation: explanation.into(),
        }
    }
}

/// Outcome of the safety gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pass,
    Downgraded,
    Blocked,
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStatus::Pass => write!(f, "pass"),
            GateStatus::Downgraded => write!(f, "downgraded"),
            GateStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Final output of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedAssessment {
    /// Ranked labels, or the referral marker when blocked.
    pub labels: Vec<LabelProbability>,
    /// Estimate as computed before gating.
    pub uncertainty: UncertaintyEstimate,
    /// Confidence after gating.
    pub confidence: f64,
    /// Risk band after gating.
    pub risk_band: RiskBand,
    pub safety_findings: Vec<SafetyFinding>,
    pub gate_status: GateStatus,
    /// Set when the rule table was stale.
    pub provisional: bool,
    /// Explanations for excluded agents and empty rankings.
    pub notes: Vec<String>,
}

impl FusedAssessment {
    /// Whether the ranking was replaced by the referral marker.
    pub fn is_referral(&self) -> bool {
        self.labels.len() == 1 && self.labels[0].name == REFERRAL_MARKER
    }

    /// Highest severity among the findings, if any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.safety_findings.iter().map(|f| f.severity).max()
    }

    /// Project onto the stable, versioned output schema.
    pub fn to_output(&self) -> AssessmentOutput {
        AssessmentOutput {
            schema_version: OUTPUT_SCHEMA_VERSION,
            labels: self.labels.clone(),
            confidence: self.confidence,
            risk_band: self.risk_band,
            safety_findings: self.safety_findings.clone(),
            gate_status: self.gate_status,
            provisional: self.provisional,
            notes: self.notes.clone(),
        }
    }
}

/// Stable output record for presentation and audit consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentOutput {
    pub schema_version: u32,
    pub labels: Vec<LabelProbability>,
    pub confidence: f64,
    pub risk_band: RiskBand,
    pub safety_findings: Vec<SafetyFinding>,
    pub gate_status: GateStatus,
    pub provisional: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}
