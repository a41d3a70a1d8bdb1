//! Session-scoped associative (embedding) memory store.
//!
//! Recall ranks remembered entries by cosine similarity against the query
//! embedding, blended with recency and an importance score, rather than
//! similarity alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

/// Text embedding for the associative store.
/// Declared locally rather than depending on `crewflow-core::tools::Embedder`
/// so the memory stores remain usable without pulling in the orchestration
/// core; the two traits share the same contract by convention.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// Scores the importance of a freshly remembered item when the caller does
/// not supply an explicit `importance` field in `metadata`. Importance can
/// be LLM-inferred on write; absent an LLM handle at this layer, the
/// default scorer below approximates that with a length/keyword heuristic,
/// and callers that want true LLM inference can supply their own
/// `ImportanceScorer`.
pub trait ImportanceScorer: Send + Sync {
    fn score(&self, content: &str) -> f32;
}

/// Default heuristic: longer, more specific-looking content (contains a
/// path separator, a number, or punctuation beyond plain prose) scores
/// higher. Bounded to `[0.1, 1.0]` so nothing is ever recalled as fully
/// worthless.
pub struct HeuristicImportanceScorer;

impl ImportanceScorer for HeuristicImportanceScorer {
    fn score(&self, content: &str) -> f32 {
        let len_component = (content.len() as f32 / 400.0).min(0.6);
        let specificity = content
            .chars()
            .filter(|c| "/_.:=0123456789".contains(*c))
            .count() as f32;
        let specificity_component = (specificity / 20.0).min(0.4);
        (0.1 + len_component + specificity_component).min(1.0)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    content: String,
    metadata: Value,
    embedding: Vec<f32>,
    importance: f32,
    remembered_at: DateTime<Utc>,
}

#[derive(Default)]
struct ScopeMemory {
    entries: Vec<MemoryEntry>,
}

/// Weights combining the three recall signals: semantic similarity,
/// recency, and importance. Similarity dominates while recency and
/// importance act as tie-breakers.
#[derive(Debug, Clone, Copy)]
pub struct RecallWeights {
    pub similarity: f32,
    pub recency: f32,
    pub importance: f32,
}

impl Default for RecallWeights {
    fn default() -> Self {
        Self {
            similarity: 0.7,
            recency: 0.2,
            importance: 0.1,
        }
    }
}

/// `remember`/`recall` contract every associative store implements.
/// Implementations that disable memory entirely (`memory_enabled = false`
/// in `RunOptions`) should use [`NullAssociativeStore`] rather than
/// branching on a flag at every call site.
#[async_trait]
pub trait AssociativeStore: Send + Sync {
    async fn remember(&self, scope_path: &str, content: &str, metadata: Value);

    async fn recall(&self, scope_path: &str, query: &str, k: usize) -> Vec<(String, f32)>;

    /// Drop every entry under `scope_path`. Called when a run completes,
    /// since entries are partitioned by `project_id` and purged on
    /// completion rather than kept indefinitely.
    async fn purge(&self, scope_path: &str);
}

/// In-process associative store. Partitioned by `scope_path` (typically a
/// `project_id`); each scope has its own lock so writes to one project
/// never block recalls against another.
pub struct InMemoryAssociativeStore {
    embedder: Arc<dyn Embedder>,
    scorer: Arc<dyn ImportanceScorer>,
    half_life: Duration,
    weights: RecallWeights,
    scopes: RwLock<HashMap<String, Arc<Mutex<ScopeMemory>>>>,
}

impl InMemoryAssociativeStore {
    #[must_use]
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            scorer: Arc::new(HeuristicImportanceScorer),
            half_life: Duration::from_secs(6 * 3600),
            weights: RecallWeights::default(),
            scopes: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_half_life(mut self, half_life: Duration) -> Self {
        self.half_life = half_life;
        self
    }

    #[must_use]
    pub fn with_weights(mut self, weights: RecallWeights) -> Self {
        self.weights = weights;
        self
    }

    #[must_use]
    pub fn with_importance_scorer(mut self, scorer: Arc<dyn ImportanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    async fn scope(&self, scope_path: &str) -> Arc<Mutex<ScopeMemory>> {
        if let Some(existing) = self.scopes.read().await.get(scope_path) {
            return existing.clone();
        }
        let mut scopes = self.scopes.write().await;
        scopes
            .entry(scope_path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ScopeMemory::default())))
            .clone()
    }

    fn recency_factor(&self, remembered_at: DateTime<Utc>) -> f32 {
        let elapsed = (Utc::now() - remembered_at).num_milliseconds().max(0) as f64;
        let half_life_ms = self.half_life.as_millis().max(1) as f64;
        (0.5_f64.powf(elapsed / half_life_ms)) as f32
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl AssociativeStore for InMemoryAssociativeStore {
    #[instrument(skip(self, content, metadata))]
    async fn remember(&self, scope_path: &str, content: &str, metadata: Value) {
        let Ok(embedding) = self.embedder.embed(content).await else {
            tracing::warn!(scope_path, "embedder failed on remember; memory-disabled for this write");
            return;
        };
        let importance = metadata
            .get("importance")
            .and_then(Value::as_f64)
            .map_or_else(|| self.scorer.score(content), |v| v as f32);
        let entry = MemoryEntry {
            content: content.to_string(),
            metadata,
            embedding,
            importance,
            remembered_at: Utc::now(),
        };
        let scope = self.scope(scope_path).await;
        scope.lock().await.entries.push(entry);
    }

    #[instrument(skip(self, query))]
    async fn recall(&self, scope_path: &str, query: &str, k: usize) -> Vec<(String, f32)> {
        let Ok(query_embedding) = self.embedder.embed(query).await else {
            tracing::warn!(scope_path, "embedder failed on recall; memory-disabled for this call");
            return Vec::new();
        };
        let scope = self.scope(scope_path).await;
        let guard = scope.lock().await;
        let mut scored: Vec<(String, f32)> = guard
            .entries
            .iter()
            .map(|entry| {
                let similarity = cosine_similarity(&query_embedding, &entry.embedding);
                let recency = self.recency_factor(entry.remembered_at);
                let score = self.weights.similarity * similarity
                    + self.weights.recency * recency
                    + self.weights.importance * entry.importance;
                (entry.content.clone(), score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }

    #[instrument(skip(self))]
    async fn purge(&self, scope_path: &str) {
        self.scopes.write().await.remove(scope_path);
    }
}

/// No-op store used when `RunOptions::memory_enabled` is `false`: `recall`
/// always returns empty and `remember` is a no-op.
pub struct NullAssociativeStore;

#[async_trait]
impl AssociativeStore for NullAssociativeStore {
    async fn remember(&self, _scope_path: &str, _content: &str, _metadata: Value) {}

    async fn recall(&self, _scope_path: &str, _query: &str, _k: usize) -> Vec<(String, f32)> {
        Vec::new()
    }

    async fn purge(&self, _scope_path: &str) {}
}
