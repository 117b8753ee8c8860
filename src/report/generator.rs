//! Markdown and JSON report generation.
//!
//! Renders one evaluation (assessment plus audit trace) for a human
//! reviewer or a downstream tool.

use crate::audit::{AgentStatus, AuditTrace};
use crate::models::{
    AssessmentOutput, FusedAssessment, GateStatus, RiskBand, SafetyFinding, UncertaintyEstimate,
};
use crate::pipeline::Evaluation;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Report metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub model_used: String,
    /// Path or name of the evaluated case.
    pub case_source: String,
    pub duration_seconds: f64,
}

/// Everything a report shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub assessment: AssessmentOutput,
    pub uncertainty: UncertaintyEstimate,
    pub trace: AuditTrace,
}

impl Report {
    pub fn new(metadata: ReportMetadata, evaluation: &Evaluation) -> Self {
        Self::from_parts(metadata, &evaluation.assessment, evaluation.trace.clone())
    }

    pub fn from_parts(
        metadata: ReportMetadata,
        assessment: &FusedAssessment,
        trace: AuditTrace,
    ) -> Self {
        Self {
            metadata,
            assessment: assessment.to_output(),
            uncertainty: assessment.uncertainty.clone(),
            trace,
        }
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# ClinFuse Assessment\n\n");
    output.push_str(
        "> Decision support only. This output is not a diagnosis and must be reviewed by a qualified clinician.\n\n",
    );

    output.push_str(&generate_metadata_section(&report.metadata, &report.trace));
    output.push_str(&generate_summary_section(&report.assessment));
    output.push_str(&generate_labels_section(&report.assessment));
    output.push_str(&generate_uncertainty_section(&report.uncertainty));
    output.push_str(&generate_findings_section(&report.assessment.safety_findings));
    output.push_str(&generate_agents_section(&report.trace));
    output.push_str(&generate_notes_section(&report.assessment.notes));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(metadata: &ReportMetadata, trace: &AuditTrace) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Case:** `{}`\n", metadata.case_source));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model_used));
    section.push_str(&format!("- **Rule Table:** {}\n", trace.rule_table_version));
    section.push_str(&format!("- **Trace ID:** `{}`\n", trace.trace_id));
    section.push_str(&format!("- **Duration:** {:.1}s\n", metadata.duration_seconds));
    section.push('\n');

    section
}

fn generate_summary_section(assessment: &AssessmentOutput) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str(&format!("**Gate:** {}\n\n", gate_badge(assessment.gate_status)));
    section.push_str("| Confidence | Risk Band | Findings | Provisional |\n");
    section.push_str("|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {:.3} | {} | {} | {} |\n\n",
        assessment.confidence,
        risk_badge(assessment.risk_band),
        assessment.safety_findings.len(),
        if assessment.provisional { "yes" } else { "no" }
    ));

    section
}

fn gate_badge(status: GateStatus) -> &'static str {
    match status {
        GateStatus::Pass => "🟢 **PASS**",
        GateStatus::Downgraded => "🟠 **DOWNGRADED**",
        GateStatus::Blocked => "🔴 **BLOCKED** (refer to clinician)",
    }
}

fn risk_badge(band: RiskBand) -> &'static str {
    match band {
        RiskBand::Low => "🟢 low",
        RiskBand::Medium => "🟡 medium",
        RiskBand::High => "🔴 high",
    }
}

fn generate_labels_section(assessment: &AssessmentOutput) -> String {
    let mut section = String::new();

    section.push_str("## Differential\n\n");

    if assessment.labels.is_empty() {
        section.push_str("No labels were ranked. See notes.\n\n");
        return section;
    }

    section.push_str("| # | Label | Probability |\n");
    section.push_str("|:---:|:---|:---:|\n");
    for (i, label) in assessment.labels.iter().enumerate() {
        section.push_str(&format!("| {} | {} | {:.3} |\n", i + 1, label.name, label.probability));
    }
    section.push('\n');

    section
}

fn generate_uncertainty_section(estimate: &UncertaintyEstimate) -> String {
    let mut section = String::new();

    section.push_str("## Uncertainty\n\n");
    section.push_str(&format!(
        "- **Top label:** {}\n",
        estimate.top_label.as_deref().unwrap_or("none")
    ));
    section.push_str(&format!(
        "- **Posterior confidence (before gate):** {:.3}\n",
        estimate.posterior_confidence
    ));
    match estimate.epistemic_variance {
        Some(v) => section.push_str(&format!("- **Epistemic variance:** {:.4}\n", v)),
        None => section.push_str("- **Epistemic variance:** undefined (single source)\n"),
    }
    section.push_str(&format!("- **Aleatoric variance:** {:.4}\n", estimate.aleatoric_variance));
    if let Some(interval) = estimate.confidence_interval {
        section.push_str(&format!(
            "- **Agent range:** {:.3} to {:.3}\n",
            interval.lower, interval.upper
        ));
    }
    section.push_str(&format!("- **Contributing opinions:** {}\n\n", estimate.contributing));
    if !estimate.explanation.is_empty() {
        section.push_str(&format!("{}\n\n", estimate.explanation));
    }

    section
}

fn generate_findings_section(findings: &[SafetyFinding]) -> String {
    let mut section = String::new();

    section.push_str("## Safety Findings\n\n");

    if findings.is_empty() {
        section.push_str("No rule matched.\n\n");
        return section;
    }

    for finding in findings {
        section.push_str(&format!(
            "- {} **{}** `{}`: {}\n",
            finding.severity.emoji(),
            finding.severity.to_string().to_uppercase(),
            finding.rule_id,
            finding.explanation
        ));
    }
    section.push('\n');

    section
}

fn generate_agents_section(trace: &AuditTrace) -> String {
    let mut section = String::new();

    section.push_str("## Agents\n\n");
    section.push_str("| Agent | Kind | Status | Top Label | Confidence | Time |\n");
    section.push_str("|:---|:---|:---|:---|:---:|---:|\n");

    for agent in &trace.agents {
        let status = match agent.status {
            AgentStatus::Succeeded => "✅ ok".to_string(),
            AgentStatus::Failed => format!(
                "❌ {}",
                agent.reason.map(|r| r.to_string()).unwrap_or_default()
            ),
        };
        section.push_str(&format!(
            "| {} | {} | {} | {} | {} | {}ms |\n",
            agent.agent_id,
            agent.kind,
            status,
            agent.top_label.as_deref().unwrap_or("-"),
            agent
                .confidence
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".to_string()),
            agent.elapsed_ms
        ));
    }
    section.push('\n');

    if !trace.evidence.available {
        section.push_str(&format!(
            "*Evidence unavailable: {}*\n\n",
            trace.evidence.error.as_deref().unwrap_or("unknown error")
        ));
    } else if !trace.evidence.sources.is_empty() {
        section.push_str(&format!("*Evidence: {}*\n\n", trace.evidence.sources.join(", ")));
    }

    section
}

fn generate_notes_section(notes: &[String]) -> String {
    if notes.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Notes\n\n");
    for note in notes {
        section.push_str(&format!("- {}\n", note));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!("*Report generated by ClinFuse v{}*\n", env!("CARGO_PKG_VERSION")));

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
