//! ClinFuse - clinical decision fusion pipeline
//!
//! A CLI tool that runs a cohort of LLM-backed reasoning agents on a
//! clinical case and produces a gated, uncertainty-aware assessment.
//!
//! Exit codes:
//!   0 - Assessment produced (pass or downgraded)
//!   1 - Runtime error (invalid case, rule table, total agent failure, etc.)
//!   2 - Assessment blocked by the safety gate (refer to clinician)

use anyhow::{Context, Result};
use chrono::Utc;
use clinfuse::agent::default_cohort;
use clinfuse::audit::JsonlAuditSink;
use clinfuse::backend::ollama::{OllamaBackend, OllamaConfig};
use clinfuse::cli::{Args, OutputFormat};
use clinfuse::config::{Config, DEFAULT_CONFIG_FILE};
use clinfuse::evidence::store::InMemoryEvidenceStore;
use clinfuse::models::{ClinicalCase, GateStatus};
use clinfuse::report::{self, Report, ReportMetadata};
use clinfuse::safety::{self, rules::RuleTable, GateInput};
use clinfuse::{evaluate_with_trace, PipelineConfig, PipelineContext};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Config first: its verbose setting decides the log level.
    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(config.log_level(&args));

    info!("ClinFuse v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Evaluation failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default clinfuse.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to set the model, timeouts, rule table and evidence directory.");
    Ok(())
}

/// Initialize logging at `level`.
fn init_logging(level: tracing::Level) {
    // Logs go to stderr so a report printed to stdout stays clean.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run one evaluation. Returns the exit code (0 or 2).
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let case_path = args
        .case
        .clone()
        .context("A case file is required (--case)")?;
    let case = load_case(&case_path)?;

    let rules_path = Path::new(&config.safety.rule_table);
    let rules = RuleTable::load(rules_path)
        .with_context(|| format!("Failed to load rule table: {}", rules_path.display()))?;

    let evidence_store = match config.evidence.dir {
        Some(ref dir) => Some(InMemoryEvidenceStore::load_dir(
            Path::new(dir),
            &config.evidence.extensions,
        )?),
        None => {
            info!("No evidence directory configured; evidence agent will report unavailable");
            None
        }
    };

    let pipeline_config = PipelineConfig::from(&config);
    pipeline_config.validate()?;

    if args.dry_run {
        return handle_dry_run(&case, &rules, &pipeline_config, evidence_store.as_ref());
    }

    // Say what is about to happen (stderr keeps stdout for the report)
    if !args.quiet {
        eprintln!("🩺 Evaluating case: {}", case_path.display());
        eprintln!("   Model: {}", config.model.name);
        eprintln!("   Ollama: {}", config.model.ollama_url);
        eprintln!(
            "   Rule table: {} ({} rules)",
            rules.version,
            rules.rule_count()
        );
        eprintln!(
            "   Timeouts: {}ms per agent, {}ms overall",
            config.pipeline.agent_timeout_ms, config.pipeline.global_timeout_ms
        );
    }

    let backend = Arc::new(OllamaBackend::new(OllamaConfig {
        ollama_url: config.model.ollama_url.clone(),
        model_name: config.model.name.clone(),
        temperature: config.model.temperature,
    })?);

    let agents = default_cohort(backend, pipeline_config.agent_settings(config.model.max_tokens));
    let audit = Arc::new(JsonlAuditSink::new(&config.general.audit_log));

    let mut context = PipelineContext::new(agents, rules, audit);
    if let Some(store) = evidence_store {
        context = context.with_evidence_store(Arc::new(store));
    }

    let spinner = progress_spinner(args.quiet);
    let result = evaluate_with_trace(&case, &pipeline_config, &context).await;
    spinner.finish_and_clear();
    let evaluation = result?;

    let duration = start_time.elapsed().as_secs_f64();
    let metadata = ReportMetadata {
        generated_at: Utc::now(),
        model_used: config.model.name.clone(),
        case_source: case_path.display().to_string(),
        duration_seconds: duration,
    };
    let report = Report::new(metadata, &evaluation);

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    match config.general.output {
        Some(ref path) => {
            std::fs::write(path, &output)
                .with_context(|| format!("Failed to write report to {}", path))?;
            if !args.quiet {
                eprintln!("\n✅ Report saved to: {}", path);
            }
        }
        None => println!("{}", output),
    }

    let assessment = &evaluation.assessment;
    if !args.quiet {
        eprintln!("\n📊 Assessment Summary:");
        eprintln!(
            "   Top label: {}",
            assessment
                .labels
                .first()
                .map(|l| l.name.as_str())
                .unwrap_or("none")
        );
        eprintln!(
            "   Confidence: {:.3} | Risk: {} | Gate: {}",
            assessment.confidence, assessment.risk_band, assessment.gate_status
        );
        for finding in &assessment.safety_findings {
            eprintln!("   {} {}", finding.severity.emoji(), finding.rule_id);
        }
        eprintln!("   Audit trace: {} -> {}", evaluation.trace.trace_id, config.general.audit_log);
        eprintln!("   Duration: {:.1}s", duration);
    }

    if assessment.gate_status == GateStatus::Blocked {
        eprintln!("\n⛔ Blocked by the safety gate. Refer to a clinician (exit code 2).");
        return Ok(2);
    }

    Ok(0)
}

/// Handle --dry-run: validate inputs and screen the recorded medications only.
fn handle_dry_run(
    case: &ClinicalCase,
    rules: &RuleTable,
    pipeline_config: &PipelineConfig,
    evidence_store: Option<&InMemoryEvidenceStore>,
) -> Result<i32> {
    println!("\n🔍 Dry run: screening recorded medications (no LLM call)...\n");

    case.validate().map_err(anyhow::Error::msg)?;

    for line in case.summary().lines() {
        println!("   {}", line);
    }
    println!("   Rule table: {} ({} rules)", rules.version, rules.rule_count());
    match evidence_store {
        Some(store) => println!("   Evidence passages: {}", store.len()),
        None => println!("   Evidence: not configured"),
    }

    let stale_reason = rules.staleness(
        pipeline_config.rule_table_version.as_deref(),
        pipeline_config.max_rule_age_days,
        Utc::now().date_naive(),
    );
    if let Some(ref reason) = stale_reason {
        warn!("Rule table is stale: {}", reason);
    }

    let decision = safety::evaluate(GateInput {
        case,
        ranking: &[],
        opinions: &[],
        table: rules,
        stale_reason: stale_reason.as_deref(),
    });

    if decision.findings.is_empty() {
        println!("\n   No rule matched the recorded medications.");
    } else {
        println!();
        for finding in &decision.findings {
            println!(
                "     {} {} {}: {}",
                finding.severity.emoji(),
                finding.severity.to_string().to_uppercase(),
                finding.rule_id,
                finding.explanation
            );
        }
    }

    println!("\n✅ Dry run complete (gate: {}). No LLM calls were made.", decision.status);
    Ok(0)
}

fn load_case(path: &Path) -> Result<ClinicalCase> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read case file: {}", path.display()))?;
    let case: ClinicalCase = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse case file: {}", path.display()))?;
    Ok(case)
}

fn progress_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("Consulting agents...");
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            // Logging is not set up yet.
            eprintln!("⚠️  Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG_FILE, e);
            Ok(Config::default())
        }
    }
}
