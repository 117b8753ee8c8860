//! Evidence retrieval.
//!
//! [`EvidenceAdapter`] wraps any [`EvidenceStore`] and enforces the
//! retrieval contract: at most `k` snippets, relevance-ordered, an empty
//! vector for an empty index, and an error (never substitute data) when
//! the store is down.

pub mod store;

pub use store::InMemoryEvidenceStore;

use crate::error::EvidenceError;
use crate::models::EvidenceSnippet;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A nearest-neighbour (or keyword) document index.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Return up to `k` snippets relevant to `query`.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<EvidenceSnippet>, EvidenceError>;
}

/// Contract-enforcing wrapper around an evidence store.
#[derive(Clone)]
pub struct EvidenceAdapter {
    store: Arc<dyn EvidenceStore>,
    timeout: Duration,
    min_relevance: f64,
}

impl EvidenceAdapter {
    pub fn new(store: Arc<dyn EvidenceStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            min_relevance: 0.0,
        }
    }

    /// Drop snippets scoring below `min_relevance`.
    pub fn with_min_relevance(mut self, min_relevance: f64) -> Self {
        self.min_relevance = min_relevance.clamp(0.0, 1.0);
        self
    }

    /// Retrieve at most `k` snippets for `query`, most relevant first.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<EvidenceSnippet>, EvidenceError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let raw = match tokio::time::timeout(self.timeout, self.store.search(query, k)).await {
            Ok(Ok(snippets)) => snippets,
            Ok(Err(e)) => {
                warn!(error = %e, "evidence store failed");
                return Err(e);
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "evidence store timed out");
                return Err(EvidenceError::Timeout(self.timeout));
            }
        };

        let mut snippets: Vec<EvidenceSnippet> = raw
            .into_iter()
            .filter(|s| s.relevance.is_finite())
            .map(|mut s| {
                s.relevance = s.relevance.clamp(0.0, 1.0);
                s
            })
            .filter(|s| s.relevance >= self.min_relevance)
            .collect();

        snippets.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });
        snippets.truncate(k);

        debug!("Retrieved {} evidence snippets", snippets.len());
        Ok(snippets)
    }
}
