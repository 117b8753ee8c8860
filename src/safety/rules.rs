//! Versioned safety rule table.
//!
//! Loaded from TOML. Each family (interaction, contraindication, allergy,
//! pregnancy, dose_limit, adverse_event) is a repeated table:
//!
//! ```toml
//! version = "2026.1"
//! reviewed_on = "2026-03-01"
//!
//! [[interaction]]
//! id = "interaction.warfarin-aspirin"
//! drugs = ["warfarin", "aspirin"]
//! hard = true
//! explanation = "Additive bleeding risk"
//! ```

use crate::error::RuleTableError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Minimum length for a substring match to count as a partial match.
const MIN_PARTIAL_LEN: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    pub version: String,
    #[serde(default)]
    pub reviewed_on: Option<NaiveDate>,
    #[serde(default, rename = "interaction")]
    pub interactions: Vec<InteractionRule>,
    #[serde(default, rename = "contraindication")]
    pub contraindications: Vec<ContraindicationRule>,
    #[serde(default, rename = "allergy")]
    pub allergy_classes: Vec<AllergyRule>,
    #[serde(default, rename = "pregnancy")]
    pub pregnancy: Vec<PregnancyRule>,
    #[serde(default, rename = "dose_limit")]
    pub dose_limits: Vec<DoseLimitRule>,
    #[serde(default, rename = "adverse_event")]
    pub adverse_events: Vec<AdverseEventRule>,
}

/// Drug-drug interaction. `hard` rules block on an exact match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRule {
    pub id: String,
    pub drugs: Vec<String>,
    #[serde(default)]
    pub hard: bool,
    pub explanation: String,
}

/// Drug-condition contraindication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContraindicationRule {
    pub id: String,
    pub drug: String,
    pub condition: String,
    #[serde(default)]
    pub hard: bool,
    pub explanation: String,
}

/// Allergy class: an allergen and the drugs that cross-react with it.
/// Always hard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllergyRule {
    pub id: String,
    pub allergen: String,
    #[serde(default)]
    pub cross_reactive: Vec<String>,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PregnancyCategory {
    /// Contraindicated in pregnancy.
    X,
    /// Evidence of risk; use only if benefit outweighs it.
    D,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PregnancyRule {
    pub id: String,
    pub drug: String,
    pub category: PregnancyCategory,
    pub explanation: String,
}

/// Maximum daily dose. Exceeding it is a dosage-range concern, never hard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseLimitRule {
    pub id: String,
    pub drug: String,
    pub max_daily_mg: f64,
    #[serde(default)]
    pub explanation: String,
}

/// Known adverse event of a drug with its monitoring advice.
/// Informational only; never changes the gate outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdverseEventRule {
    pub id: String,
    pub drug: String,
    pub event: String,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub monitoring: String,
}

impl RuleTable {
    /// Load and validate a rule table from disk.
    pub fn load(path: &Path) -> Result<Self, RuleTableError> {
        let content = std::fs::read_to_string(path)?;
        let table = Self::from_toml_str(&content)?;

        info!(
            "Loaded rule table {} from {} ({} rules)",
            table.version,
            path.display(),
            table.rule_count()
        );
        Ok(table)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RuleTableError> {
        let table: RuleTable = toml::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    pub fn rule_count(&self) -> usize {
        self.interactions.len()
            + self.contraindications.len()
            + self.allergy_classes.len()
            + self.pregnancy.len()
            + self.dose_limits.len()
            + self.adverse_events.len()
    }

    fn validate(&self) -> Result<(), RuleTableError> {
        let invalid = |rule_id: &str, reason: &str| RuleTableError::InvalidRule {
            rule_id: rule_id.to_string(),
            reason: reason.to_string(),
        };

        if self.version.trim().is_empty() {
            return Err(invalid("<table>", "version must not be empty"));
        }

        let ids = self
            .interactions
            .iter()
            .map(|r| &r.id)
            .chain(self.contraindications.iter().map(|r| &r.id))
            .chain(self.allergy_classes.iter().map(|r| &r.id))
            .chain(self.pregnancy.iter().map(|r| &r.id))
            .chain(self.dose_limits.iter().map(|r| &r.id))
            .chain(self.adverse_events.iter().map(|r| &r.id));

        let mut seen = HashSet::new();
        for id in ids {
            if id.trim().is_empty() {
                return Err(invalid("<unnamed>", "rule id must not be empty"));
            }
            if !seen.insert(id.as_str()) {
                return Err(invalid(id, "duplicate rule id"));
            }
        }

        for rule in &self.interactions {
            if rule.drugs.len() != 2 || rule.drugs.iter().any(|d| d.trim().is_empty()) {
                return Err(invalid(&rule.id, "an interaction names exactly two drugs"));
            }
        }
        for rule in &self.allergy_classes {
            if rule.allergen.trim().is_empty() {
                return Err(invalid(&rule.id, "allergen must not be empty"));
            }
        }
        for rule in &self.adverse_events {
            if rule.event.trim().is_empty() {
                return Err(invalid(&rule.id, "adverse event must name the event"));
            }
        }
        for rule in &self.dose_limits {
            if !rule.max_daily_mg.is_finite() || rule.max_daily_mg <= 0.0 {
                return Err(invalid(&rule.id, "max_daily_mg must be a positive number"));
            }
        }

        Ok(())
    }

    /// Why this table should not be trusted as current, if it should not.
    pub fn staleness(
        &self,
        expected_version: Option<&str>,
        max_age_days: Option<u32>,
        today: NaiveDate,
    ) -> Option<String> {
        if let Some(expected) = expected_version {
            if self.version != expected {
                return Some(format!(
                    "rule table version {} does not match expected version {}",
                    self.version, expected
                ));
            }
        }

        if let Some(max_age) = max_age_days {
            match self.reviewed_on {
                Some(reviewed) => {
                    let age = (today - reviewed).num_days();
                    if age > i64::from(max_age) {
                        return Some(format!(
                            "rule table last reviewed {} ({} days ago, limit {})",
                            reviewed, age, max_age
                        ));
                    }
                }
                None => return Some("rule table has no review date".to_string()),
            }
        }

        None
    }
}

/// How a candidate term matched a rule term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermMatch {
    Exact,
    /// Substring match on a normalized name; heuristic only.
    Partial,
}

/// Lower-case, treat `_` and `-` as spaces, collapse whitespace.
pub fn normalize_term(term: &str) -> String {
    term.to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn match_term(candidate: &str, rule_term: &str) -> Option<TermMatch> {
    let candidate = normalize_term(candidate);
    let rule_term = normalize_term(rule_term);
    if candidate.is_empty() || rule_term.is_empty() {
        return None;
    }
    if candidate == rule_term {
        return Some(TermMatch::Exact);
    }

    let (shorter, longer) = if candidate.len() <= rule_term.len() {
        (&candidate, &rule_term)
    } else {
        (&rule_term, &candidate)
    };
    if shorter.len() >= MIN_PARTIAL_LEN && longer.contains(shorter.as_str()) {
        return Some(TermMatch::Partial);
    }
    None
}
