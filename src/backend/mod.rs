//! Text-generation backend contract.
//!
//! Every stochastic model call made by an agent goes through
//! [`TextBackend`], so tests can substitute a scripted backend.

pub mod ollama;
#[cfg(test)]
pub mod stub;

pub use ollama::{OllamaBackend, OllamaConfig};

use crate::error::BackendError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// A text-generation engine.
#[async_trait]
pub trait TextBackend: Send + Sync {
    /// Complete `prompt`, producing at most `max_tokens` tokens within `timeout`.
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: usize,
        timeout: Duration,
    ) -> Result<String, BackendError>;

    /// Name used in logs and traces.
    fn name(&self) -> &str;
}

/// Share of the budget given to the first attempt; the retry gets the rest.
const FIRST_ATTEMPT_SHARE: f64 = 2.0 / 3.0;

/// Call the backend with at most one retry.
///
/// The first attempt gets two thirds of `budget`, the retry the remainder,
/// so the whole exchange never exceeds `budget`. Each attempt is also
/// bounded locally in case the backend ignores its timeout argument.
pub async fn complete_with_retry(
    backend: &dyn TextBackend,
    prompt: &str,
    max_tokens: usize,
    budget: Duration,
) -> Result<String, BackendError> {
    let first = budget.mul_f64(FIRST_ATTEMPT_SHARE);
    let retry = budget.saturating_sub(first);

    match bounded_call(backend, prompt, max_tokens, first).await {
        Ok(text) => Ok(text),
        Err(e) => {
            warn!(
                backend = backend.name(),
                error = %e,
                retry_ms = retry.as_millis() as u64,
                "backend call failed, retrying once"
            );
            if retry.is_zero() {
                return Err(e);
            }
            bounded_call(backend, prompt, max_tokens, retry).await
        }
    }
}

async fn bounded_call(
    backend: &dyn TextBackend,
    prompt: &str,
    max_tokens: usize,
    timeout: Duration,
) -> Result<String, BackendError> {
    debug!(
        backend = backend.name(),
        timeout_ms = timeout.as_millis() as u64,
        "calling backend"
    );
    match tokio::time::timeout(timeout, backend.complete(prompt, max_tokens, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}
