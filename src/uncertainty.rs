//! Opinion fusion and uncertainty decomposition.
//!
//! Only diagnostic and evidence opinions contribute probability mass.
//! Opinions are put in canonical order before any floating-point
//! accumulation so the result does not depend on arrival order.

use crate::models::{ConfidenceInterval, LabelProbability, Opinion, RiskBand, UncertaintyEstimate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Width of the grid probabilities are snapped to before ranking. Labels
/// on the same grid step are tied.
pub const TIE_EPSILON: f64 = 1e-9;

/// Epistemic variance above which the explanation calls out disagreement.
const DISAGREEMENT_VARIANCE: f64 = 0.04;

/// Aleatoric variance above which the explanation calls the case ambiguous.
const AMBIGUITY_VARIANCE: f64 = 0.2;

/// Variance assumed for the epistemic term when it is undefined (the
/// maximum variance of a quantity in [0, 1]).
pub const UNDEFINED_EPISTEMIC_PRIOR: f64 = 0.25;

/// Confidence cut-offs for the risk bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Posterior at or above this is `low` risk.
    pub low: f64,
    /// Posterior at or above this (and below `low`) is `medium` risk.
    pub medium: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 0.75,
            medium: 0.45,
        }
    }
}

impl RiskThresholds {
    pub fn band(&self, confidence: f64) -> RiskBand {
        if confidence >= self.low {
            RiskBand::Low
        } else if confidence >= self.medium {
            RiskBand::Medium
        } else {
            RiskBand::High
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("low", self.low), ("medium", self.medium)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!(
                    "risk threshold {} must be within [0, 1], got {}",
                    name, value
                ));
            }
        }
        if self.medium > self.low {
            return Err(format!(
                "medium risk threshold ({}) must not exceed the low risk threshold ({})",
                self.medium, self.low
            ));
        }
        Ok(())
    }
}

/// Tunables of the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSettings {
    pub thresholds: RiskThresholds,
    /// λ in `1 / (1 + λ·v)`.
    pub variance_penalty: f64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            variance_penalty: 1.0,
        }
    }
}

/// Fused ranking and the estimate derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimation {
    pub ranking: Vec<LabelProbability>,
    pub estimate: UncertaintyEstimate,
}

/// Fuse `opinions` into a ranked label list and an uncertainty estimate.
pub fn estimate(opinions: &[&Opinion], settings: &EstimatorSettings) -> Estimation {
    let mut contributing: Vec<&Opinion> = opinions
        .iter()
        .copied()
        .filter(|o| o.kind.contributes_to_ranking())
        .collect();
    contributing.sort_by(|a, b| {
        let left = (a.kind.priority(), a.agent_id.as_str());
        let right = (b.kind.priority(), b.agent_id.as_str());
        left.cmp(&right)
    });

    if contributing.is_empty() {
        return Estimation {
            ranking: Vec::new(),
            estimate: UncertaintyEstimate {
                top_label: None,
                posterior_confidence: 0.0,
                epistemic_variance: None,
                aleatoric_variance: 0.0,
                risk_band: RiskBand::High,
                contributing: 0,
                confidence_interval: None,
                explanation: "No diagnostic or evidence opinion contributed. Refer to a clinician."
                    .to_string(),
            },
        };
    }

    let weights = weights(&contributing);
    let ranking = rank_labels(&contributing, &weights);

    let top = ranking.first();
    let mean_top = top.map(|l| l.probability).unwrap_or(0.0);

    // Per-agent probability of the top label, in canonical agent order.
    let samples: Vec<f64> = match top {
        Some(label) => contributing
            .iter()
            .map(|o| o.probability_of(&label.name))
            .collect(),
        None => Vec::new(),
    };

    let epistemic = (samples.len() >= 2).then(|| population_variance(&samples));
    let aleatoric = aleatoric_variance(&contributing);
    let interval = confidence_interval(&samples);

    let variance = epistemic.unwrap_or(UNDEFINED_EPISTEMIC_PRIOR) + aleatoric;
    let posterior = (mean_top * penalty(variance, settings.variance_penalty)).clamp(0.0, 1.0);

    let mut estimate = UncertaintyEstimate {
        top_label: top.map(|l| l.name.clone()),
        posterior_confidence: posterior,
        epistemic_variance: epistemic,
        aleatoric_variance: aleatoric,
        risk_band: settings.thresholds.band(posterior),
        contributing: contributing.len(),
        confidence_interval: interval,
        explanation: String::new(),
    };
    estimate.explanation = explain(&estimate);

    Estimation { estimate, ranking }
}

/// Min and max of the per-agent top-label probabilities.
fn confidence_interval(samples: &[f64]) -> Option<ConfidenceInterval> {
    let (first, rest) = samples.split_first()?;
    let (lower, upper) = rest
        .iter()
        .fold((*first, *first), |(lo, hi), p| (lo.min(*p), hi.max(*p)));
    Some(ConfidenceInterval { lower, upper })
}

fn explain(estimate: &UncertaintyEstimate) -> String {
    let mut text = match estimate.top_label {
        Some(ref label) => format!(
            "Confidence {:.1}% for {} (risk {}).",
            estimate.posterior_confidence * 100.0,
            label,
            estimate.risk_band
        ),
        None => format!("No label was ranked (risk {}).", estimate.risk_band),
    };

    match estimate.epistemic_variance {
        None => text.push_str(" Only one opinion contributed, so agreement is unknown."),
        Some(v) if v > DISAGREEMENT_VARIANCE => {
            text.push_str(" Agents disagree on the top label.")
        }
        Some(_) => {}
    }
    if estimate.aleatoric_variance > AMBIGUITY_VARIANCE {
        text.push_str(" Agents report the case as inherently ambiguous.");
    }
    if let Some(interval) = estimate.confidence_interval {
        if interval.width() > 0.0 {
            text.push_str(&format!(
                " Agent estimates range from {:.1}% to {:.1}%.",
                interval.lower * 100.0,
                interval.upper * 100.0
            ));
        }
    }
    text.push_str(" Verify with clinical judgment.");
    text
}

/// Strictly decreasing penalty factor for a total variance `v`.
pub fn penalty(variance: f64, lambda: f64) -> f64 {
    1.0 / (1.0 + lambda * variance.max(0.0))
}

/// Normalized confidence weights; equal weights when every agent reported zero.
fn weights(opinions: &[&Opinion]) -> Vec<f64> {
    let total: f64 = opinions.iter().map(|o| o.confidence).sum();
    if total <= 0.0 {
        let equal = 1.0 / opinions.len() as f64;
        return vec![equal; opinions.len()];
    }
    opinions.iter().map(|o| o.confidence / total).collect()
}

fn rank_labels(opinions: &[&Opinion], weights: &[f64]) -> Vec<LabelProbability> {
    // label -> (weighted probability, best backing kind priority)
    let mut fused: BTreeMap<&str, (f64, u8)> = BTreeMap::new();

    for label in opinions.iter().flat_map(|o| o.labels.iter()) {
        fused.entry(label.name.as_str()).or_insert((0.0, u8::MAX));
    }

    for (opinion, weight) in opinions.iter().zip(weights) {
        for (name, entry) in fused.iter_mut() {
            let p = opinion.probability_of(name);
            entry.0 += weight * p;
            if p > 0.0 {
                entry.1 = entry.1.min(opinion.kind.priority());
            }
        }
    }

    let mut ranked: Vec<(&str, f64, u8)> = fused
        .into_iter()
        .map(|(name, (p, prio))| (name, p, prio))
        .collect();
    // Snapping to a fixed grid keeps the ordering a total order.
    let step = |p: f64| (p / TIE_EPSILON).round() as i64;
    ranked.sort_by(|a, b| {
        step(b.1)
            .cmp(&step(a.1))
            .then(a.2.cmp(&b.2))
            .then_with(|| a.0.cmp(b.0))
    });

    ranked
        .into_iter()
        .map(|(name, p, _)| LabelProbability::new(name, p.clamp(0.0, 1.0)))
        .collect()
}

fn population_variance(samples: &[f64]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n
}

fn aleatoric_variance(opinions: &[&Opinion]) -> f64 {
    let total: f64 = opinions.iter().map(|o| o.confidence).sum();
    if total <= 0.0 {
        return 1.0;
    }
    opinions.iter().map(|o| o.confidence * (1.0 - o.confidence)).sum::<f64>() / total
}
