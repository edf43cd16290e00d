//! Context orchestrator - parallel layer fan-out with graceful degradation
//!
//! Reads fan out to every in-scope layer through a `JoinSet`, each wrapped
//! in its own timeout. A layer that fails, times out, or is short-circuited
//! by its breaker costs coverage, never the whole query; only the case
//! where no layer answers at all is surfaced to the engine facade.

use crate::context_engine::breaker::{BreakerRegistry, StoreKind};
use crate::layers::{LayerQuery, LayerRegistry, ScoredCandidate};
use crate::memory_db::schema::{MemoryLayer, QueryResult, RankedRecord};
use crate::scoring::{self, LayerWeights, RankWeights};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Free-text query with optional tag hints.
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    pub text: String,
    pub tags: Vec<String>,
}

impl ContextQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Which layers a query consults.
#[derive(Debug, Clone)]
pub struct ContextScope {
    pub layers: Vec<MemoryLayer>,
}

impl ContextScope {
    pub fn only(layers: impl IntoIterator<Item = MemoryLayer>) -> Self {
        Self {
            layers: layers.into_iter().collect(),
        }
    }
}

impl Default for ContextScope {
    fn default() -> Self {
        Self {
            layers: MemoryLayer::ALL.to_vec(),
        }
    }
}

/// Result size limits. Rank order survives truncation; the top item is
/// always delivered even when it alone exceeds the byte budget.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_items: 16,
            max_bytes: 16 * 1024,
        }
    }
}

/// Ranking and fan-out knobs, stable within a release.
#[derive(Debug, Clone)]
pub struct RetrievalTuning {
    pub rank_weights: RankWeights,
    pub layer_weights: LayerWeights,
    pub layer_timeout: Duration,
    pub per_layer_k: usize,
    pub min_similarity: f32,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            rank_weights: RankWeights::default(),
            layer_weights: LayerWeights::default(),
            layer_timeout: Duration::from_millis(200),
            per_layer_k: 16,
            min_similarity: 0.1,
        }
    }
}

pub struct Orchestrator {
    registry: Arc<LayerRegistry>,
    breakers: Arc<BreakerRegistry>,
    tuning: RetrievalTuning,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LayerRegistry>,
        breakers: Arc<BreakerRegistry>,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            registry,
            breakers,
            tuning,
        }
    }

    /// Assemble ranked context for one query. Degradation is reported in
    /// the result, never as an error; the all-layers-down case comes back
    /// as an empty degraded result for the facade to translate.
    pub async fn get_context(
        &self,
        query: &ContextQuery,
        scope: &ContextScope,
        budget: &ContextBudget,
    ) -> QueryResult {
        let now = Utc::now();
        let mut degraded = false;
        let mut degraded_reasons: Vec<String> = Vec::new();

        let mut tasks: JoinSet<(
            MemoryLayer,
            Result<crate::error::Result<crate::layers::LayerCandidates>, tokio::time::error::Elapsed>,
        )> = JoinSet::new();

        let mut launched: Vec<MemoryLayer> = Vec::new();
        for layer in &scope.layers {
            let layer = *layer;
            let module = match self.registry.get(layer) {
                Some(module) => module,
                None => {
                    degraded = true;
                    degraded_reasons.push(format!("layer {} is not registered", layer));
                    continue;
                }
            };
            // Open circuits are skipped outright; one elapsed-cooldown call
            // per layer goes through as the half-open trial.
            if !self.breakers.allow(layer, StoreKind::Structured) {
                degraded = true;
                degraded_reasons.push(format!("layer {} circuit open", layer));
                continue;
            }
            launched.push(layer);

            let layer_query = LayerQuery {
                text: query.text.clone(),
                tags: query.tags.clone(),
                k: self.tuning.per_layer_k,
                min_similarity: self.tuning.min_similarity,
                now,
            };
            let timeout = self.tuning.layer_timeout;
            tasks.spawn(async move {
                let outcome = tokio::time::timeout(timeout, module.retrieve(&layer_query)).await;
                (layer, outcome)
            });
        }

        let mut consulted: Vec<MemoryLayer> = Vec::new();
        let mut contributed: Vec<MemoryLayer> = Vec::new();
        let mut merged: HashMap<String, (MemoryLayer, ScoredCandidate)> = HashMap::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((layer, Ok(Ok(candidates)))) => {
                    consulted.push(layer);
                    if candidates.degraded {
                        degraded = true;
                        degraded_reasons.extend(candidates.degraded_reasons);
                    }
                    if !candidates.items.is_empty() {
                        contributed.push(layer);
                    }
                    for candidate in candidates.items {
                        match merged.entry(candidate.record.id.clone()) {
                            std::collections::hash_map::Entry::Occupied(mut slot) => {
                                if candidate.relevance > slot.get().1.relevance {
                                    slot.insert((layer, candidate));
                                }
                            }
                            std::collections::hash_map::Entry::Vacant(slot) => {
                                slot.insert((layer, candidate));
                            }
                        }
                    }
                }
                Ok((layer, Ok(Err(e)))) => {
                    degraded = true;
                    degraded_reasons.push(format!("layer {} failed: {}", layer, e));
                    self.breakers.on_failure(layer, StoreKind::Structured);
                }
                Ok((layer, Err(_elapsed))) => {
                    degraded = true;
                    degraded_reasons.push(format!(
                        "layer {} timed out after {:?}",
                        layer, self.tuning.layer_timeout
                    ));
                    // Timeouts count against the layer's structured breaker.
                    self.breakers.on_failure(layer, StoreKind::Structured);
                    warn!(layer = %layer, "layer retrieval timed out");
                }
                Err(join_error) => {
                    degraded = true;
                    degraded_reasons.push(format!("layer task failed: {}", join_error));
                }
            }
        }

        if consulted.is_empty() {
            let mut result = QueryResult::empty_degraded("all layers unavailable");
            result.degraded_reasons.extend(degraded_reasons);
            return result;
        }

        // Final ranking: recency, retrieval relevance, and the layer's own
        // importance boost, weighted and clamped.
        let scale_seconds = self.tuning.rank_weights.recency_scale_hours * 3_600.0;
        let mut ranked: Vec<RankedRecord> = merged
            .into_values()
            .map(|(layer, candidate)| {
                let age_seconds = (now - candidate.record.timestamp).num_seconds() as f32;
                let recency = scoring::recency_factor(age_seconds, scale_seconds);
                let score = scoring::rank_score(
                    &self.tuning.rank_weights,
                    recency,
                    candidate.relevance,
                    candidate.importance,
                );
                RankedRecord {
                    record: candidate.record,
                    score,
                    layer,
                    source: candidate.source,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut items: Vec<RankedRecord> = Vec::new();
        let mut total_bytes = 0usize;
        for item in ranked {
            if items.len() >= budget.max_items {
                break;
            }
            let cost = item.record.text.len();
            if !items.is_empty() && total_bytes + cost > budget.max_bytes {
                break;
            }
            total_bytes += cost;
            items.push(item);
        }

        consulted.sort_by_key(|layer| MemoryLayer::ALL.iter().position(|l| l == layer));
        contributed.sort_by_key(|layer| MemoryLayer::ALL.iter().position(|l| l == layer));
        let quality_score =
            scoring::context_quality(&contributed, &consulted, &self.tuning.layer_weights);

        debug!(
            launched = launched.len(),
            consulted = consulted.len(),
            items = items.len(),
            quality = quality_score,
            degraded,
            "context assembled"
        );

        QueryResult {
            items,
            quality_score,
            layers_consulted: consulted,
            degraded,
            degraded_reasons,
        }
    }
}
