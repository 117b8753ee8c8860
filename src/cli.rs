//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// ClinFuse - clinical decision fusion pipeline
///
/// Runs diagnostic, evidence and drug-safety agents on a clinical case,
/// fuses their opinions with calibrated uncertainty and screens the
/// result through a rule-driven safety gate. Decision support only.
///
/// Examples:
///   clinfuse --case case.json --rules rules.toml
///   clinfuse --case case.json --evidence-dir guidelines/ --format json
///   clinfuse --case case.json --dry-run
///   clinfuse --init-config
///
/// Exit codes: 0 pass or downgraded, 1 error, 2 blocked.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Clinical case to evaluate (JSON)
    #[arg(long, value_name = "FILE", required_unless_present = "init_config")]
    pub case: Option<PathBuf>,

    /// Safety rule table (TOML)
    ///
    /// Overrides [safety].rule_table from the config file.
    #[arg(long, value_name = "FILE")]
    pub rules: Option<PathBuf>,

    /// Directory of guideline documents for evidence retrieval
    #[arg(long, value_name = "DIR")]
    pub evidence_dir: Option<PathBuf>,

    /// Append the audit trace to this JSONL file
    #[arg(long, value_name = "FILE")]
    pub audit_log: Option<PathBuf>,

    /// Ollama model used by every agent
    #[arg(short, long, env = "CLINFUSE_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Temperature for LLM responses (0.0 - 1.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Maximum tokens per agent reply
    #[arg(long, value_name = "TOKENS")]
    pub max_tokens: Option<usize>,

    /// Per-agent timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub agent_timeout_ms: Option<u64>,

    /// Timeout for the whole agent cohort in milliseconds
    #[arg(long, value_name = "MS")]
    pub global_timeout_ms: Option<u64>,

    /// Output file for the report (stdout when omitted)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Path to configuration file
    ///
    /// If not specified, looks for clinfuse.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: validate the case, rules and evidence without calling the LLM
    ///
    /// Runs the safety gate over the case's recorded medications only.
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default clinfuse.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        match self.case {
            Some(ref path) if !path.is_file() => {
                return Err(format!("Case file does not exist: {}", path.display()));
            }
            None => return Err("A case file is required (--case)".to_string()),
            _ => {}
        }

        // Validate Ollama URL format (not needed for dry-run)
        if !self.dry_run {
            if let Some(ref url) = self.ollama_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
                }
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 1.0".to_string());
            }
        }

        if self.max_tokens == Some(0) {
            return Err("Max tokens must be at least 1".to_string());
        }

        if self.agent_timeout_ms == Some(0) || self.global_timeout_ms == Some(0) {
            return Err("Timeouts must be at least 1 millisecond".to_string());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref rules) = self.rules {
            if !rules.is_file() {
                return Err(format!("Rule table does not exist: {}", rules.display()));
            }
        }

        if let Some(ref dir) = self.evidence_dir {
            if !dir.is_dir() {
                return Err(format!("Evidence directory does not exist: {}", dir.display()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn make_args() -> Args {
        Args {
            case: Some(PathBuf::from("Cargo.toml")),
            rules: None,
            evidence_dir: None,
            audit_log: None,
            model: None,
            ollama_url: None,
            temperature: None,
            max_tokens: None,
            agent_timeout_ms: None,
            global_timeout_ms: None,
            output: None,
            format: OutputFormat::Markdown,
            config: None,
            verbose: false,
            quiet: false,
            dry_run: false,
            init_config: false,
        }
    }

    #[test]
    fn test_valid_args() {
        assert!(make_args().validate().is_ok());
    }

    #[test]
    fn test_validation_missing_case() {
        let mut args = make_args();
        args.case = Some(PathBuf::from("no/such/case.json"));
        assert!(args.validate().is_err());

        args.case = None;
        assert!(args.validate().is_err());

        args.init_config = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut args = make_args();
        args.ollama_url = Some("localhost:11434".to_string());
        assert!(args.validate().is_err());

        args.dry_run = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_ranges() {
        let mut args = make_args();
        args.temperature = Some(1.5);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.agent_timeout_ms = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.max_tokens = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_paths() {
        let temp_dir = TempDir::new().unwrap();

        let mut args = make_args();
        args.evidence_dir = Some(temp_dir.path().to_path_buf());
        assert!(args.validate().is_ok());

        args.rules = Some(temp_dir.path().join("rules.toml"));
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_parse_from_command_line() {
        let args = Args::try_parse_from([
            "clinfuse",
            "--case",
            "case.json",
            "--format",
            "json",
            "--agent-timeout-ms",
            "1500",
        ])
        .unwrap();
        assert_eq!(args.format, OutputFormat::Json);
        assert_eq!(args.agent_timeout_ms, Some(1500));
        assert!(!args.dry_run);
    }
}
