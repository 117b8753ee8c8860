//! Parsing of agent replies into opinions.
//!
//! Replies are expected to be one JSON object:
//! `{"labels": [{"name": "...", "probability": 0.6}], "confidence": 0.8,
//!   "rationale": "...", "warnings": ["..."]}`.
//! Surrounding prose or code fences are tolerated. Distributions that do
//! not sum to at most one are renormalized rather than rejected.

use crate::models::{
    AgentFailure, AgentKind, AgentOutcome, FailureReason, LabelProbability, Opinion,
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Tolerance on the probability sum before renormalizing.
pub const SUM_TOLERANCE: f64 = 1e-3;

/// Suffix appended to the rationale when a distribution was rescaled.
pub const RENORMALIZED_NOTE: &str = "renormalized";

#[derive(Debug, Deserialize)]
struct RawOpinion {
    #[serde(default)]
    labels: Vec<RawLabel>,
    confidence: f64,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    #[serde(alias = "label", alias = "diagnosis", alias = "drug")]
    name: String,
    probability: f64,
}

/// Parse a backend reply for an agent of `kind`.
pub fn parse_opinion(kind: AgentKind, agent_id: &str, reply: &str) -> AgentOutcome {
    let malformed = |detail: String| {
        AgentFailure::new(kind, agent_id, FailureReason::MalformedOutput, detail)
    };

    let json = extract_json_object(reply)
        .ok_or_else(|| malformed("reply contains no JSON object".to_string()))?;

    let raw: RawOpinion = serde_json::from_str(json)
        .map_err(|e| malformed(format!("reply is not a valid opinion: {}", e)))?;

    if !raw.confidence.is_finite() {
        return Err(malformed("confidence is not a finite number".to_string()));
    }
    if let Some(bad) = raw.labels.iter().find(|l| !l.probability.is_finite()) {
        return Err(malformed(format!("probability for {} is not finite", bad.name)));
    }

    let (labels, renormalized) = normalize_labels(raw.labels);

    let mut rationale = raw.rationale.trim().to_string();
    if !raw.warnings.is_empty() {
        append_note(&mut rationale, &format!("Warnings: {}", raw.warnings.join("; ")));
    }
    if renormalized {
        append_note(&mut rationale, RENORMALIZED_NOTE);
    }

    Ok(Opinion {
        kind,
        agent_id: agent_id.to_string(),
        labels,
        rationale,
        confidence: raw.confidence.clamp(0.0, 1.0),
    })
}

/// Merge duplicates, clamp negatives and rescale when the sum is invalid.
///
/// Returns the labels ranked by probability (ties by name) and whether
/// any probability was altered.
fn normalize_labels(raw: Vec<RawLabel>) -> (Vec<LabelProbability>, bool) {
    let mut merged: BTreeMap<String, f64> = BTreeMap::new();
    let mut had_negative = false;

    for label in raw {
        let name = label.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        if label.probability < 0.0 {
            had_negative = true;
        }
        *merged.entry(name).or_insert(0.0) += label.probability.max(0.0);
    }

    // Clamping a negative entry already changed the distribution, so it is
    // flagged even when nothing positive is left to rescale.
    let sum: f64 = merged.values().sum();
    let renormalized = had_negative || sum > 1.0 + SUM_TOLERANCE;
    if renormalized && sum > 0.0 {
        for p in merged.values_mut() {
            *p /= sum;
        }
    }

    let mut labels: Vec<LabelProbability> = merged
        .into_iter()
        .map(|(name, probability)| LabelProbability { name, probability })
        .collect();
    labels.sort_by(|a, b| {
        b.probability
            .total_cmp(&a.probability)
            .then_with(|| a.name.cmp(&b.name))
    });

    (labels, renormalized)
}

fn append_note(rationale: &mut String, note: &str) {
    if rationale.is_empty() {
        rationale.push_str(note);
    } else {
        rationale.push_str("; ");
        rationale.push_str(note);
    }
}

/// Locate the outermost JSON object in free text.
fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_opinion() {
        let reply = r#"{"labels": [{"name": "cold", "probability": 0.4}, {"name": "flu", "probability": 0.6}],
                        "confidence": 0.8, "rationale": "fever and myalgia"}"#;
        let opinion = parse_opinion(AgentKind::Diagnostic, "diagnostic", reply).unwrap();

        assert_eq!(opinion.labels[0].name, "flu");
        assert_eq!(opinion.labels[1].name, "cold");
        assert_eq!(opinion.confidence, 0.8);
        assert_eq!(opinion.rationale, "fever and myalgia");
    }

    #[test]
    fn test_parse_tolerates_prose_and_fences() {
        let reply = "Here is my answer:\n```json\n{\"labels\": [{\"label\": \"flu\", \"probability\": 0.5}], \"confidence\": 0.5}\n```";
        let opinion = parse_opinion(AgentKind::Evidence, "evidence", reply).unwrap();
        assert_eq!(opinion.labels[0].name, "flu");
        assert_eq!(opinion.rationale, "");
    }

    #[test]
    fn test_oversized_distribution_is_renormalized() {
        let reply = r#"{"labels": [{"name": "flu", "probability": 0.9}, {"name": "cold", "probability": 0.6}],
                        "confidence": 0.7, "rationale": "overlapping"}"#;
        let opinion = parse_opinion(AgentKind::Diagnostic, "diagnostic", reply).unwrap();

        let sum: f64 = opinion.labels.iter().map(|l| l.probability).sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((opinion.labels[0].probability - 0.6).abs() < 1e-12);
        assert!(opinion.rationale.ends_with(RENORMALIZED_NOTE));
    }

    #[test]
    fn test_sum_within_tolerance_is_kept() {
        let reply = r#"{"labels": [{"name": "flu", "probability": 0.6005}, {"name": "cold", "probability": 0.4}],
                        "confidence": 0.7}"#;
        let opinion = parse_opinion(AgentKind::Diagnostic, "diagnostic", reply).unwrap();
        assert_eq!(opinion.labels[0].probability, 0.6005);
        assert!(!opinion.rationale.contains(RENORMALIZED_NOTE));
    }

    #[test]
    fn test_negative_probability_is_renormalized() {
        let reply = r#"{"labels": [{"name": "flu", "probability": 0.5}, {"name": "cold", "probability": -0.2}],
                        "confidence": 0.7}"#;
        let opinion = parse_opinion(AgentKind::Diagnostic, "diagnostic", reply).unwrap();
        assert_eq!(opinion.probability_of("flu"), 1.0);
        assert_eq!(opinion.probability_of("cold"), 0.0);
        assert_eq!(opinion.rationale, RENORMALIZED_NOTE);
    }

    #[test]
    fn test_all_negative_distribution_is_flagged() {
        let reply = r#"{"labels": [{"name": "flu", "probability": -0.5}],
                        "confidence": 0.5, "rationale": "x"}"#;
        let opinion = parse_opinion(AgentKind::Diagnostic, "d", reply).unwrap();
        assert_eq!(opinion.labels[0].probability, 0.0);
        assert_eq!(opinion.rationale, format!("x; {}", RENORMALIZED_NOTE));
    }

    #[test]
    fn test_duplicate_labels_are_merged() {
        let reply = r#"{"labels": [{"name": "flu", "probability": 0.3}, {"name": " flu ", "probability": 0.2}],
                        "confidence": 0.6}"#;
        let opinion = parse_opinion(AgentKind::Diagnostic, "diagnostic", reply).unwrap();
        assert_eq!(opinion.labels.len(), 1);
        assert!((opinion.labels[0].probability - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let reply = r#"{"labels": [], "confidence": 1.7}"#;
        let opinion = parse_opinion(AgentKind::Diagnostic, "diagnostic", reply).unwrap();
        assert_eq!(opinion.confidence, 1.0);
    }

    #[test]
    fn test_warnings_are_embedded_in_rationale() {
        let reply = r#"{"labels": [{"drug": "aspirin", "probability": 0.7}], "confidence": 0.9,
                        "rationale": "antiplatelet", "warnings": ["bleeding with warfarin"]}"#;
        let opinion = parse_opinion(AgentKind::DrugSafety, "drug-safety", reply).unwrap();
        assert_eq!(opinion.labels[0].name, "aspirin");
        assert_eq!(opinion.rationale, "antiplatelet; Warnings: bleeding with warfarin");
    }

    #[test]
    fn test_malformed_replies() {
        for reply in [
            "no json here",
            "{\"labels\": []}",
            "{\"labels\": [{\"name\": \"flu\"}], \"confidence\": 0.5}",
            "} backwards {",
        ] {
            let failure = parse_opinion(AgentKind::Diagnostic, "diagnostic", reply).unwrap_err();
            assert_eq!(failure.reason, FailureReason::MalformedOutput, "reply: {}", reply);
        }
    }
}
