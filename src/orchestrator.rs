//! Concurrent agent invocation.
//!
//! The orchestrator is the single fan-out/join point of a pipeline run.
//! Agents are polled as futures on the caller's task and borrow the case
//! and evidence; nothing is spawned.

use crate::agent::{EvidenceSet, ReasoningAgent};
use crate::error::PipelineError;
use crate::models::{AgentFailure, AgentOutcome, ClinicalCase, FailureReason, Opinion};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one agent together with how long it took.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub outcome: AgentOutcome,
    pub elapsed: Duration,
}

impl AgentRun {
    fn sort_key(&self) -> (u8, &str) {
        match &self.outcome {
            Ok(o) => (o.kind.priority(), o.agent_id.as_str()),
            Err(f) => (f.kind.priority(), f.agent_id.as_str()),
        }
    }
}

/// Every agent's outcome in canonical order (kind, then id).
#[derive(Debug, Clone)]
pub struct CohortResult {
    pub runs: Vec<AgentRun>,
}

impl CohortResult {
    pub fn opinions(&self) -> Vec<&Opinion> {
        self.runs.iter().filter_map(|r| r.outcome.as_ref().ok()).collect()
    }

    pub fn failures(&self) -> Vec<&AgentFailure> {
        self.runs.iter().filter_map(|r| r.outcome.as_ref().err()).collect()
    }
}

pub struct Orchestrator {
    agents: Vec<Arc<dyn ReasoningAgent>>,
    global_timeout: Duration,
    /// Upper bound applied on top of each agent's own timeout.
    agent_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(agents: Vec<Arc<dyn ReasoningAgent>>, global_timeout: Duration) -> Self {
        Self {
            agents,
            global_timeout,
            agent_timeout: None,
        }
    }

    /// Cap every agent at `timeout`, even if it was built with a longer one.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }

    fn budget_for(&self, agent: &dyn ReasoningAgent) -> Duration {
        match self.agent_timeout {
            Some(cap) => agent.timeout().min(cap),
            None => agent.timeout(),
        }
    }

    pub fn agents(&self) -> &[Arc<dyn ReasoningAgent>] {
        &self.agents
    }

    /// Run every agent against `case` and `evidence` concurrently.
    ///
    /// Each agent is bounded by its own timeout and all of them by the
    /// global deadline; agents still pending at the deadline are reported
    /// as timeouts. Fails with [`PipelineError::TotalFailure`] only when no
    /// agent produced an opinion.
    pub async fn run(
        &self,
        case: &ClinicalCase,
        evidence: &EvidenceSet,
    ) -> Result<CohortResult, PipelineError> {
        let started = Instant::now();
        let deadline = started + self.global_timeout;

        let mut pending: FuturesUnordered<_> = self
            .agents
            .iter()
            .enumerate()
            .map(|(index, agent)| {
                let budget = self.budget_for(agent.as_ref());
                async move {
                    let agent_started = Instant::now();
                    let assessment = agent.assess(case, evidence);
                    let outcome = match tokio::time::timeout(budget, assessment).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(AgentFailure::new(
                            agent.kind(),
                            agent.id(),
                            FailureReason::Timeout,
                            format!("no answer within {}ms", budget.as_millis()),
                        )),
                    };
                    (index, outcome, agent_started.elapsed())
                }
            })
            .collect();

        let mut slots: Vec<Option<AgentRun>> = (0..self.agents.len()).map(|_| None).collect();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((index, outcome, elapsed))) => {
                    log_outcome(&outcome, elapsed);
                    slots[index] = Some(AgentRun { outcome, elapsed });
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        pending = pending.len(),
                        timeout_ms = self.global_timeout.as_millis() as u64,
                        "global deadline reached, continuing with partial results"
                    );
                    break;
                }
            }
        }
        drop(pending);

        let mut runs: Vec<AgentRun> = slots
            .into_iter()
            .zip(&self.agents)
            .map(|(slot, agent)| {
                slot.unwrap_or_else(|| {
                    let outcome = Err(AgentFailure::new(
                        agent.kind(),
                        agent.id(),
                        FailureReason::Timeout,
                        "global deadline",
                    ));
                    let elapsed = started.elapsed();
                    log_outcome(&outcome, elapsed);
                    AgentRun { outcome, elapsed }
                })
            })
            .collect();

        runs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let cohort = CohortResult { runs };

        let succeeded = cohort.opinions().len();
        info!(
            agents = cohort.runs.len(),
            succeeded,
            failed = cohort.runs.len() - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "agent cohort finished"
        );

        if succeeded == 0 {
            return Err(PipelineError::TotalFailure {
                failures: cohort.failures().into_iter().cloned().collect(),
            });
        }

        Ok(cohort)
    }
}

fn log_outcome(outcome: &AgentOutcome, elapsed: Duration) {
    let elapsed_ms = elapsed.as_millis() as u64;
    match outcome {
        Ok(opinion) => debug!(
            agent = %opinion.agent_id,
            kind = %opinion.kind,
            labels = opinion.labels.len(),
            confidence = opinion.confidence,
            elapsed_ms,
            "agent produced opinion"
        ),
        Err(failure) => warn!(
            agent = %failure.agent_id,
            kind = %failure.kind,
            reason = %failure.reason,
            detail = %failure.detail,
            elapsed_ms,
            "agent failed"
        ),
    }
}
