//! ClinFuse - clinical decision fusion pipeline.
//!
//! Several reasoning agents assess a structured clinical case in parallel.
//! Their opinions are fused into a ranked differential with a calibrated
//! confidence, screened by a rule-driven safety gate and recorded in an
//! audit trace. Entry point: [`pipeline::evaluate`].

pub mod agent;
pub mod audit;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod evidence;
pub mod fusion;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod safety;
pub mod uncertainty;

pub use error::PipelineError;
pub use models::{ClinicalCase, FusedAssessment};
pub use pipeline::{evaluate, evaluate_with_trace, PipelineConfig, PipelineContext};
