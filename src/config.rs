//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `clinfuse.toml` files.

use crate::pipeline::PipelineConfig;
use crate::uncertainty::RiskThresholds;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "clinfuse.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub model: ModelConfig,

    /// Timeouts, retrieval and fusion settings.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Risk band thresholds.
    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    /// Guideline documents for the evidence store.
    #[serde(default)]
    pub evidence: EvidenceConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Report output path. Printed to stdout when unset.
    #[serde(default)]
    pub output: Option<String>,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// JSONL file receiving one audit trace per evaluation.
    #[serde(default = "default_audit_log")]
    pub audit_log: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: None,
            verbose: false,
            audit_log: default_audit_log(),
        }
    }
}

fn default_audit_log() -> String {
    "clinfuse-audit.jsonl".to_string()
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub name: String,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per agent reply.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> usize {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Per-agent budget, including the single backend retry.
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,

    /// Bound on the whole agent cohort.
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: u64,

    #[serde(default = "default_evidence_timeout_ms")]
    pub evidence_timeout_ms: u64,

    /// Bound on writing the audit trace.
    #[serde(default = "default_audit_timeout_ms")]
    pub audit_timeout_ms: u64,

    /// Snippets handed to the agents.
    #[serde(default = "default_evidence_k")]
    pub evidence_k: usize,

    #[serde(default)]
    pub min_relevance: f64,

    /// λ in the posterior penalty `1 / (1 + λ·variance)`.
    #[serde(default = "default_variance_penalty")]
    pub variance_penalty: f64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            agent_timeout_ms: default_agent_timeout_ms(),
            global_timeout_ms: default_global_timeout_ms(),
            evidence_timeout_ms: default_evidence_timeout_ms(),
            audit_timeout_ms: default_audit_timeout_ms(),
            evidence_k: default_evidence_k(),
            min_relevance: 0.0,
            variance_penalty: default_variance_penalty(),
        }
    }
}

fn default_agent_timeout_ms() -> u64 {
    20_000
}

fn default_global_timeout_ms() -> u64 {
    30_000
}

fn default_evidence_timeout_ms() -> u64 {
    5_000
}

fn default_audit_timeout_ms() -> u64 {
    5_000
}

fn default_evidence_k() -> usize {
    5
}

fn default_variance_penalty() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_risk_low")]
    pub low: f64,

    #[serde(default = "default_risk_medium")]
    pub medium: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            low: default_risk_low(),
            medium: default_risk_medium(),
        }
    }
}

fn default_risk_low() -> f64 {
    0.75
}

fn default_risk_medium() -> f64 {
    0.45
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Path to the TOML rule table.
    #[serde(default = "default_rule_table")]
    pub rule_table: String,

    /// Expected rule table version; results are provisional on mismatch.
    #[serde(default)]
    pub rule_table_version: Option<String>,

    /// Maximum age of the table's review date.
    #[serde(default)]
    pub max_rule_age_days: Option<u32>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            rule_table: default_rule_table(),
            rule_table_version: None,
            max_rule_age_days: None,
        }
    }
}

fn default_rule_table() -> String {
    "rules.toml".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Directory of guideline documents. No evidence store when unset.
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_evidence_extensions")]
    pub extensions: Vec<String>,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            dir: None,
            extensions: default_evidence_extensions(),
        }
    }
}

fn default_evidence_extensions() -> Vec<String> {
    vec!["md".to_string(), "txt".to_string()]
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence; only values given on the command
    /// line (or through the environment) override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if let Some(max_tokens) = args.max_tokens {
            self.model.max_tokens = max_tokens;
        }

        if let Some(ms) = args.agent_timeout_ms {
            self.pipeline.agent_timeout_ms = ms;
        }
        if let Some(ms) = args.global_timeout_ms {
            self.pipeline.global_timeout_ms = ms;
        }

        if let Some(ref rules) = args.rules {
            self.safety.rule_table = rules.to_string_lossy().into_owned();
        }
        if let Some(ref dir) = args.evidence_dir {
            self.evidence.dir = Some(dir.to_string_lossy().into_owned());
        }
        if let Some(ref audit_log) = args.audit_log {
            self.general.audit_log = audit_log.to_string_lossy().into_owned();
        }
        if let Some(ref output) = args.output {
            self.general.output = Some(output.to_string_lossy().into_owned());
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Log level after merging: `--quiet` wins, then verbose from the
    /// command line or the file.
    pub fn log_level(&self, args: &crate::cli::Args) -> tracing::Level {
        if args.quiet {
            tracing::Level::ERROR
        } else if self.general.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        let section = &config.pipeline;
        PipelineConfig {
            agent_timeout: Duration::from_millis(section.agent_timeout_ms),
            global_timeout: Duration::from_millis(section.global_timeout_ms),
            evidence_timeout: Duration::from_millis(section.evidence_timeout_ms),
            audit_timeout: Duration::from_millis(section.audit_timeout_ms),
            evidence_k: section.evidence_k,
            min_relevance: section.min_relevance,
            risk_thresholds: RiskThresholds {
                low: config.risk.low,
                medium: config.risk.medium,
            },
            variance_penalty: section.variance_penalty,
            rule_table_version: config.safety.rule_table_version.clone(),
            max_rule_age_days: config.safety.max_rule_age_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::tests::make_args;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model.name, "llama3.2:latest");
        assert_eq!(config.pipeline.agent_timeout_ms, 20_000);
        assert_eq!(config.risk.low, 0.75);
        assert!(config.evidence.extensions.contains(&"md".to_string()));
        assert_eq!(config.general.output, None);
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
verbose = true

[model]
name = "meditron:7b"
temperature = 0.2

[pipeline]
agent_timeout_ms = 5000
evidence_k = 3

[risk]
low = 0.8

[safety]
rule_table = "fixtures/rules.toml"
rule_table_version = "2026.1"
max_rule_age_days = 365
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.general.verbose);
        assert_eq!(config.model.name, "meditron:7b");
        assert_eq!(config.model.temperature, 0.2);
        assert_eq!(config.model.max_tokens, 512);
        assert_eq!(config.pipeline.agent_timeout_ms, 5000);
        assert_eq!(config.pipeline.global_timeout_ms, 30_000);
        assert_eq!(config.pipeline.evidence_k, 3);
        assert_eq!(config.risk.low, 0.8);
        assert_eq!(config.risk.medium, 0.45);
        assert_eq!(config.safety.rule_table_version.as_deref(), Some("2026.1"));
        assert_eq!(config.safety.max_rule_age_days, Some(365));
    }

    #[test]
    fn test_pipeline_config_from_file_config() {
        let mut config = Config::default();
        config.pipeline.global_timeout_ms = 45_000;
        config.risk.medium = 0.5;

        let pipeline = PipelineConfig::from(&config);
        assert_eq!(pipeline.agent_timeout, Duration::from_secs(20));
        assert_eq!(pipeline.global_timeout, Duration::from_secs(45));
        assert_eq!(pipeline.audit_timeout, Duration::from_secs(5));
        assert_eq!(pipeline.risk_thresholds.medium, 0.5);
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_merge_with_args_only_overrides_given_values() {
        let mut config = Config::default();
        config.model.name = "from-file".to_string();
        config.pipeline.agent_timeout_ms = 9_000;

        let mut args = make_args();
        args.global_timeout_ms = Some(60_000);
        args.rules = Some("custom-rules.toml".into());
        config.merge_with_args(&args);

        assert_eq!(config.model.name, "from-file");
        assert_eq!(config.pipeline.agent_timeout_ms, 9_000);
        assert_eq!(config.pipeline.global_timeout_ms, 60_000);
        assert_eq!(config.safety.rule_table, "custom-rules.toml");
    }

    #[test]
    fn test_verbose_from_file_raises_log_level() {
        let mut config: Config = toml::from_str("[general]\nverbose = true\n").unwrap();
        let mut args = make_args();
        config.merge_with_args(&args);
        assert_eq!(config.log_level(&args), tracing::Level::DEBUG);

        args.quiet = true;
        assert_eq!(config.log_level(&args), tracing::Level::ERROR);

        let quiet_file = Config::default();
        assert_eq!(quiet_file.log_level(&make_args()), tracing::Level::INFO);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("[safety]"));

        let round_trip: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(round_trip.pipeline.evidence_k, 5);
    }
}
