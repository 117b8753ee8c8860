//! In-memory keyword evidence store.
//!
//! Documents are split into paragraphs at load time. A query is scored
//! against each paragraph as the fraction of its terms the paragraph
//! contains, which keeps relevance in [0, 1].

use super::EvidenceStore;
use crate::error::EvidenceError;
use crate::models::EvidenceSnippet;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Words too common to carry signal.
const STOPWORDS: &[&str] = &[
    "and", "the", "for", "with", "without", "from", "that", "this", "are", "was", "has", "have",
    "patient", "days", "day",
];

/// Maximum snippet length in characters.
const MAX_SNIPPET_CHARS: usize = 800;

#[derive(Debug, Clone)]
struct Passage {
    source: String,
    text: String,
    terms: HashSet<String>,
}

/// Keyword-overlap store backed by a vector of passages.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEvidenceStore {
    passages: Vec<Passage>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document; each blank-line separated paragraph becomes a passage.
    pub fn add_document(&mut self, source: &str, content: &str) {
        let paragraphs = content
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty());

        for (i, paragraph) in paragraphs.enumerate() {
            let text: String = paragraph.chars().take(MAX_SNIPPET_CHARS).collect();
            self.passages.push(Passage {
                source: format!("{}#{}", source, i + 1),
                terms: tokenize(&text),
                text,
            });
        }
    }

    /// Load every file with a matching extension below `dir`.
    pub fn load_dir(dir: &Path, extensions: &[String]) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow::anyhow!("Evidence directory not found: {}", dir.display()));
        }

        let mut store = Self::new();
        let mut files = 0usize;

        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_str().unwrap_or("")));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Cannot read evidence entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !extensions.iter().any(|allowed| allowed == ext) {
                continue;
            }

            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read evidence file: {}", path.display()))?;
            let rel_path = path.strip_prefix(dir).unwrap_or(path);
            store.add_document(&rel_path.to_string_lossy(), &content);
            files += 1;
        }

        info!(
            "Loaded {} evidence passages from {} files in {}",
            store.len(),
            files,
            dir.display()
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    fn score(&self, query_terms: &HashSet<String>) -> Vec<EvidenceSnippet> {
        if query_terms.is_empty() {
            return Vec::new();
        }

        self.passages
            .iter()
            .filter_map(|p| {
                let hits = query_terms.intersection(&p.terms).count();
                if hits == 0 {
                    return None;
                }
                Some(EvidenceSnippet {
                    text: p.text.clone(),
                    source: p.source.clone(),
                    relevance: hits as f64 / query_terms.len() as f64,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<EvidenceSnippet>, EvidenceError> {
        let terms = tokenize(query);
        let mut hits = self.score(&terms);

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });
        hits.truncate(k);

        debug!("Keyword search matched {} passages", hits.len());
        Ok(hits)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}
