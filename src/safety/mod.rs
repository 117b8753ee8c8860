//! Safety gate.
//!
//! A pure function of the case, the fused ranking, the drug-safety
//! opinions and a rule table. It never mutates opinions; it only decides
//! whether the fused result passes, is downgraded or is blocked.

pub mod rules;

pub use rules::{RuleTable, TermMatch};

use crate::models::{
    AgentKind, ClinicalCase, GateStatus, LabelProbability, Opinion, SafetyFinding, Severity,
};
use regex::Regex;
use rules::{match_term, normalize_term, PregnancyCategory};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

/// Built-in rule: a candidate that is itself a recorded allergy.
pub const DIRECT_ALLERGY_RULE: &str = "allergy.direct";
/// Emitted when the rule table is stale; the result becomes provisional.
pub const STALE_TABLE_RULE: &str = "rule-table.stale";
/// Emitted when a drug-safety rationale raises a concern the table does not confirm.
pub const ADVISORY_RULE: &str = "advisory.unconfirmed";

static ADVISORY_LANGUAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(interact\w*|contraindicat\w*|allerg\w*|cross[- ]react\w*|bleeding|serotonin syndrome)\b")
        .expect("valid advisory regex")
});

/// Result of running the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub status: GateStatus,
    /// Deduplicated, most severe first.
    pub findings: Vec<SafetyFinding>,
    pub provisional: bool,
}

impl GateDecision {
    pub fn rules_fired(&self) -> Vec<String> {
        self.findings.iter().map(|f| f.rule_id.clone()).collect()
    }
}

/// Everything the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub case: &'a ClinicalCase,
    pub ranking: &'a [LabelProbability],
    /// Successful opinions; only drug-safety ones are read.
    pub opinions: &'a [&'a Opinion],
    pub table: &'a RuleTable,
    /// Set when the table failed its freshness check.
    pub stale_reason: Option<&'a str>,
}

/// Screen the candidate prescriptions and the recorded medications.
pub fn evaluate(input: GateInput<'_>) -> GateDecision {
    let mut findings = Vec::new();
    let candidates = candidate_drugs(&input);

    for candidate in &candidates {
        check_direct_allergy(input.case, candidate, &mut findings);
        check_allergy_classes(input.case, input.table, candidate, &mut findings);
        for medication in &input.case.medications {
            check_interactions(input.table, candidate, &medication.name, &mut findings);
        }
        check_contraindications(input.case, input.table, candidate, &mut findings);
        check_pregnancy(input.case, input.table, candidate, &mut findings);
    }

    let medications = &input.case.medications;
    for (i, first) in medications.iter().enumerate() {
        for second in &medications[i + 1..] {
            check_interactions(input.table, &first.name, &second.name, &mut findings);
        }
    }
    check_dose_limits(input.case, input.table, &mut findings);
    check_adverse_events(&input, &candidates, &mut findings);

    if !findings.iter().any(|f| f.severity >= Severity::Warning) {
        check_advisories(&input, &candidates, &mut findings);
    }

    if let Some(reason) = input.stale_reason {
        findings.push(SafetyFinding::new(Severity::Info, STALE_TABLE_RULE, reason));
    }

    let findings = canonical_findings(findings);
    let status = match findings.iter().map(|f| f.severity).max() {
        Some(Severity::Critical) => GateStatus::Blocked,
        Some(Severity::Warning) => GateStatus::Downgraded,
        _ => GateStatus::Pass,
    };

    debug!(
        candidates = candidates.len(),
        findings = findings.len(),
        status = %status,
        "safety gate evaluated"
    );

    GateDecision {
        status,
        findings,
        provisional: input.stale_reason.is_some(),
    }
}

/// Fused labels plus drug-safety suggestions, keyed by normalized name.
fn candidate_drugs(input: &GateInput<'_>) -> Vec<String> {
    let mut candidates: BTreeMap<String, String> = BTreeMap::new();

    let suggested = input
        .opinions
        .iter()
        .filter(|o| o.kind == AgentKind::DrugSafety)
        .flat_map(|o| o.labels.iter());

    for label in input.ranking.iter().chain(suggested) {
        let key = normalize_term(&label.name);
        if !key.is_empty() {
            candidates.entry(key).or_insert_with(|| label.name.clone());
        }
    }

    candidates.into_values().collect()
}

fn severity_for(matched: TermMatch, hard: bool) -> Severity {
    if matched == TermMatch::Exact && hard {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// Weakest of two matches: a pair is only exact when both sides are.
fn weaker(a: TermMatch, b: TermMatch) -> TermMatch {
    if a == TermMatch::Exact && b == TermMatch::Exact {
        TermMatch::Exact
    } else {
        TermMatch::Partial
    }
}

fn check_direct_allergy(case: &ClinicalCase, candidate: &str, findings: &mut Vec<SafetyFinding>) {
    for allergy in &case.allergies {
        if let Some(matched) = match_term(candidate, allergy) {
            findings.push(SafetyFinding::new(
                severity_for(matched, true),
                DIRECT_ALLERGY_RULE,
                format!("{} matches recorded allergy to {}", candidate, allergy),
            ));
        }
    }
}

fn check_allergy_classes(
    case: &ClinicalCase,
    table: &RuleTable,
    candidate: &str,
    findings: &mut Vec<SafetyFinding>,
) {
    for rule in &table.allergy_classes {
        for allergy in &case.allergies {
            let Some(allergy_match) = match_term(allergy, &rule.allergen) else {
                continue;
            };
            let drug_match = rule
                .cross_reactive
                .iter()
                .filter_map(|drug| match_term(candidate, drug))
                .min_by_key(|m| *m == TermMatch::Partial);
            if let Some(drug_match) = drug_match {
                let explanation = if rule.explanation.is_empty() {
                    format!("{} cross-reacts with recorded {} allergy", candidate, allergy)
                } else {
                    format!("{}: {}", candidate, rule.explanation)
                };
                findings.push(SafetyFinding::new(
                    severity_for(weaker(allergy_match, drug_match), true),
                    rule.id.clone(),
                    explanation,
                ));
            }
        }
    }
}

fn check_interactions(
    table: &RuleTable,
    drug: &str,
    other: &str,
    findings: &mut Vec<SafetyFinding>,
) {
    for rule in &table.interactions {
        let [first, second] = rule.drugs.as_slice() else {
            continue;
        };
        let forward = match_term(drug, first).zip(match_term(other, second));
        let backward = match_term(drug, second).zip(match_term(other, first));

        let matched = [forward, backward]
            .into_iter()
            .flatten()
            .map(|(a, b)| weaker(a, b))
            .min_by_key(|m| *m == TermMatch::Partial);

        if let Some(matched) = matched {
            findings.push(SafetyFinding::new(
                severity_for(matched, rule.hard),
                rule.id.clone(),
                format!("{} with {}: {}", drug, other, rule.explanation),
            ));
        }
    }
}

fn check_contraindications(
    case: &ClinicalCase,
    table: &RuleTable,
    candidate: &str,
    findings: &mut Vec<SafetyFinding>,
) {
    for rule in &table.contraindications {
        let Some(drug_match) = match_term(candidate, &rule.drug) else {
            continue;
        };
        for condition in &case.conditions {
            if let Some(condition_match) = match_term(condition, &rule.condition) {
                findings.push(SafetyFinding::new(
                    severity_for(weaker(drug_match, condition_match), rule.hard),
                    rule.id.clone(),
                    format!("{} with {}: {}", candidate, condition, rule.explanation),
                ));
            }
        }
    }
}

fn check_pregnancy(
    case: &ClinicalCase,
    table: &RuleTable,
    candidate: &str,
    findings: &mut Vec<SafetyFinding>,
) {
    if !case.pregnant {
        return;
    }
    for rule in &table.pregnancy {
        if let Some(matched) = match_term(candidate, &rule.drug) {
            let hard = rule.category == PregnancyCategory::X;
            findings.push(SafetyFinding::new(
                severity_for(matched, hard),
                rule.id.clone(),
                format!(
                    "{} in pregnancy (category {:?}): {}",
                    candidate, rule.category, rule.explanation
                ),
            ));
        }
    }
}

fn check_dose_limits(case: &ClinicalCase, table: &RuleTable, findings: &mut Vec<SafetyFinding>) {
    for medication in &case.medications {
        let Some(dose) = medication.daily_dose_mg else {
            continue;
        };
        for rule in &table.dose_limits {
            if match_term(&medication.name, &rule.drug).is_some() && dose > rule.max_daily_mg {
                findings.push(SafetyFinding::new(
                    Severity::Warning,
                    rule.id.clone(),
                    format!(
                        "{} {} mg/day exceeds the {} mg/day limit{}",
                        medication.name,
                        dose,
                        rule.max_daily_mg,
                        if rule.explanation.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", rule.explanation)
                        }
                    ),
                ));
            }
        }
    }
}

/// Known adverse events of candidates and recorded medications, at info level.
fn check_adverse_events(
    input: &GateInput<'_>,
    candidates: &[String],
    findings: &mut Vec<SafetyFinding>,
) {
    let mut drugs: BTreeMap<String, &str> = BTreeMap::new();
    let recorded = input.case.medications.iter().map(|m| m.name.as_str());
    for name in candidates.iter().map(String::as_str).chain(recorded) {
        drugs.entry(normalize_term(name)).or_insert(name);
    }

    for drug in drugs.values() {
        for rule in &input.table.adverse_events {
            if match_term(drug, &rule.drug).is_none() {
                continue;
            }
            let mut explanation = format!("{}: {}", drug, rule.event);
            if let Some(ref frequency) = rule.frequency {
                explanation.push_str(&format!(" ({})", frequency));
            }
            if !rule.monitoring.is_empty() {
                explanation.push_str(&format!("; monitor: {}", rule.monitoring));
            }
            findings.push(SafetyFinding::new(Severity::Info, rule.id.clone(), explanation));
        }
    }
}

/// Surface drug-safety concerns the table did not confirm, at info level.
fn check_advisories(
    input: &GateInput<'_>,
    candidates: &[String],
    findings: &mut Vec<SafetyFinding>,
) {
    for opinion in input.opinions.iter().filter(|o| o.kind == AgentKind::DrugSafety) {
        if let Some(hit) = ADVISORY_LANGUAGE.find(&opinion.rationale) {
            findings.push(SafetyFinding::new(
                Severity::Info,
                ADVISORY_RULE,
                format!(
                    "agent {} mentioned '{}' for {} candidate(s); not confirmed by rule table",
                    opinion.agent_id,
                    hit.as_str().to_lowercase(),
                    candidates.len()
                ),
            ));
        }
    }
}

/// Deduplicate, most severe first, then by rule id and explanation.
fn canonical_findings(mut findings: Vec<SafetyFinding>) -> Vec<SafetyFinding> {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
            .then_with(|| a.explanation.cmp(&b.explanation))
    });
    findings.dedup();
    findings
}
