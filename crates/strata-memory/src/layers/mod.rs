//! Layer modules - the five memory partitions behind one trait
//!
//! Each layer owns its enrichment rules (initiative joins, stakeholder
//! aggregates, framework detection, change capture) but delegates storage
//! and hybrid retrieval to a shared `LayerCore`. A layer whose specialized
//! tables fail keeps serving raw records and reports itself degraded.

pub mod conversation;
pub mod learning;
pub mod organizational;
pub mod stakeholder;
pub mod strategic;

pub use conversation::ConversationLayer;
pub use learning::LearningLayer;
pub use organizational::OrganizationalLayer;
pub use stakeholder::StakeholderLayer;
pub use strategic::StrategicLayer;

use crate::context_engine::breaker::{BreakerRegistry, StoreKind};
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ContextRecord, MemoryLayer, RecordFilter, RetrievalSource};
use crate::memory_db::StructuredStore;
use crate::vector_index::{Embedder, VectorIndex};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied event before normalization. Missing id/timestamp are
/// filled in; text and tags are validated.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub id: Option<String>,
    pub text: String,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Retrieval request as one layer sees it.
#[derive(Debug, Clone)]
pub struct LayerQuery {
    pub text: String,
    pub tags: Vec<String>,
    pub k: usize,
    pub min_similarity: f32,
    pub now: DateTime<Utc>,
}

/// One candidate before final ranking. Relevance comes from retrieval
/// (cosine or keyword overlap), importance from the layer's own boost.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub record: ContextRecord,
    pub relevance: f32,
    pub importance: f32,
    pub source: RetrievalSource,
}

/// A layer's answer to retrieve().
#[derive(Debug, Clone, Default)]
pub struct LayerCandidates {
    pub items: Vec<ScoredCandidate>,
    pub degraded: bool,
    pub degraded_reasons: Vec<String>,
}

impl LayerCandidates {
    fn degrade(&mut self, reason: impl Into<String>) {
        self.degraded = true;
        self.degraded_reasons.push(reason.into());
    }
}

/// Compact, human-readable summary of one layer's contents.
#[derive(Debug, Clone)]
pub struct LayerDigest {
    pub layer: MemoryLayer,
    pub headline: String,
    pub entries: Vec<String>,
}

#[async_trait]
pub trait LayerModule: Send + Sync {
    fn layer(&self) -> MemoryLayer;

    /// Validate, persist, and enrich one event. The canonical write must
    /// succeed; failures in the layer's specialized tables are logged and
    /// leave the stored record intact.
    async fn record(&self, draft: EventDraft) -> Result<ContextRecord>;

    async fn retrieve(&self, query: &LayerQuery) -> Result<LayerCandidates>;

    async fn summarize(&self) -> Result<LayerDigest>;
}

/// Shared machinery behind every layer: canonical store, vector index,
/// embedder, breaker registry, and a short-lived digest cache.
pub struct LayerCore {
    pub store: Arc<StructuredStore>,
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub breakers: Arc<BreakerRegistry>,
    pub sentiment_alpha: f32,
    digest_cache: Cache<MemoryLayer, LayerDigest>,
}

impl LayerCore {
    pub fn new(
        store: Arc<StructuredStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        breakers: Arc<BreakerRegistry>,
        sentiment_alpha: f32,
        digest_ttl: Duration,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            breakers,
            sentiment_alpha,
            digest_cache: Cache::builder()
                .max_capacity(8)
                .time_to_live(digest_ttl)
                .build(),
        }
    }

    /// Turn a draft into a canonical record for `layer`, or reject it.
    pub fn normalize(&self, layer: MemoryLayer, draft: EventDraft) -> Result<ContextRecord> {
        let text = draft.text.trim().to_string();
        if text.is_empty() {
            return Err(MemoryError::validation("event text must not be empty"));
        }
        if let Some(ref id) = draft.id {
            if id.trim().is_empty() {
                return Err(MemoryError::validation("event id must not be blank"));
            }
        }
        let mut tags: Vec<String> = Vec::new();
        for tag in draft.tags {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() {
                continue;
            }
            if tag.contains('"') {
                return Err(MemoryError::validation(format!(
                    "tag {:?} must not contain quotes",
                    tag
                )));
            }
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Ok(ContextRecord {
            id: draft.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            layer,
            timestamp: draft.timestamp.unwrap_or_else(Utc::now),
            text,
            tags,
            metadata: draft.metadata,
        })
    }

    /// Canonical write with breaker bookkeeping on the structured store.
    pub fn persist(&self, record: &ContextRecord) -> Result<()> {
        match self.store.records.put(record) {
            Ok(_) => {
                self.breakers.on_success(record.layer, StoreKind::Structured);
                Ok(())
            }
            Err(e) => {
                if !matches!(e, MemoryError::Validation(_)) {
                    self.breakers.on_failure(record.layer, StoreKind::Structured);
                }
                Err(e)
            }
        }
    }

    /// The hybrid retrieval every layer uses: semantic candidates when the
    /// vector circuit allows, keyword/tag candidates from the structured
    /// store, merged per id keeping the higher relevance. A record found by
    /// both paths carries `Hybrid` provenance.
    pub fn hybrid_retrieve(
        &self,
        layer: MemoryLayer,
        query: &LayerQuery,
        importance: impl Fn(&ContextRecord) -> f32,
    ) -> Result<LayerCandidates> {
        let mut out = LayerCandidates::default();
        let mut merged: HashMap<String, ScoredCandidate> = HashMap::new();

        if self.breakers.allow(layer, StoreKind::Vector) {
            let embedding = self.embedder.embed(&query.text);
            match self.index.search(&embedding, query.k, query.min_similarity) {
                Ok(hits) => {
                    self.breakers.on_success(layer, StoreKind::Vector);
                    for (id, similarity) in hits {
                        match self.store.records.get(&id) {
                            // The index spans all layers; keep only ours.
                            Ok(Some(record)) if record.layer == layer => {
                                merged.insert(
                                    record.id.clone(),
                                    ScoredCandidate {
                                        record,
                                        relevance: similarity,
                                        importance: 0.0,
                                        source: RetrievalSource::Semantic,
                                    },
                                );
                            }
                            // Stale index entry or foreign layer.
                            Ok(_) => continue,
                            Err(e) => {
                                self.breakers.on_failure(layer, StoreKind::Structured);
                                out.degrade(format!("structured read failed: {}", e));
                            }
                        }
                    }
                }
                Err(e) => {
                    self.breakers.on_failure(layer, StoreKind::Vector);
                    out.degrade(format!("vector search failed: {}", e));
                }
            }
        } else {
            out.degrade(format!("vector circuit open for layer {}", layer));
        }

        match self.keyword_candidates(layer, query) {
            Ok(hits) => {
                self.breakers.on_success(layer, StoreKind::Structured);
                for (record, relevance) in hits {
                    match merged.entry(record.id.clone()) {
                        Entry::Occupied(mut slot) => {
                            let existing = slot.get_mut();
                            existing.source = RetrievalSource::Hybrid;
                            if relevance > existing.relevance {
                                existing.relevance = relevance;
                            }
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(ScoredCandidate {
                                record,
                                relevance,
                                importance: 0.0,
                                source: RetrievalSource::Keyword,
                            });
                        }
                    }
                }
            }
            Err(e) => {
                self.breakers.on_failure(layer, StoreKind::Structured);
                out.degrade(format!("keyword query failed: {}", e));
            }
        }

        let mut items: Vec<ScoredCandidate> = merged.into_values().collect();
        for item in &mut items {
            item.importance = importance(&item.record).clamp(0.0, 1.0);
        }
        items.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.truncate(query.k);
        out.items = items;
        Ok(out)
    }

    fn keyword_candidates(
        &self,
        layer: MemoryLayer,
        query: &LayerQuery,
    ) -> Result<Vec<(ContextRecord, f32)>> {
        let terms = significant_terms(&query.text);
        let mut seen: HashMap<String, ContextRecord> = HashMap::new();
        for term in &terms {
            let filter = RecordFilter {
                layer: Some(layer),
                text_like: Some(term.clone()),
                ..Default::default()
            };
            for record in self.store.records.query(&filter, query.k, 0)? {
                seen.entry(record.id.clone()).or_insert(record);
            }
        }
        if !query.tags.is_empty() {
            let filter = RecordFilter {
                layer: Some(layer),
                tags_any: query.tags.clone(),
                ..Default::default()
            };
            for record in self.store.records.query(&filter, query.k, 0)? {
                seen.entry(record.id.clone()).or_insert(record);
            }
        }
        Ok(seen
            .into_values()
            .map(|record| {
                let relevance = keyword_relevance(&terms, &query.tags, &record);
                (record, relevance)
            })
            .collect())
    }

    /// Build-or-reuse wrapper around the digest cache.
    pub fn cached_digest(
        &self,
        layer: MemoryLayer,
        build: impl FnOnce() -> Result<LayerDigest>,
    ) -> Result<LayerDigest> {
        if let Some(digest) = self.digest_cache.get(&layer) {
            return Ok(digest);
        }
        let digest = build()?;
        self.digest_cache.insert(layer, digest.clone());
        Ok(digest)
    }
}

/// Layer modules keyed by their `MemoryLayer` tag.
pub struct LayerRegistry {
    modules: HashMap<MemoryLayer, Arc<dyn LayerModule>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// All five built-in layers over one shared core.
    pub fn with_default_layers(core: Arc<LayerCore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ConversationLayer::new(core.clone())));
        registry.register(Arc::new(StrategicLayer::new(core.clone())));
        registry.register(Arc::new(StakeholderLayer::new(core.clone())));
        registry.register(Arc::new(LearningLayer::new(core.clone())));
        registry.register(Arc::new(OrganizationalLayer::new(core)));
        registry
    }

    pub fn register(&mut self, module: Arc<dyn LayerModule>) {
        self.modules.insert(module.layer(), module);
    }

    pub fn get(&self, layer: MemoryLayer) -> Option<Arc<dyn LayerModule>> {
        self.modules.get(&layer).cloned()
    }

    /// Registered layers in canonical order.
    pub fn layers(&self) -> Vec<MemoryLayer> {
        MemoryLayer::ALL
            .iter()
            .copied()
            .filter(|layer| self.modules.contains_key(layer))
            .collect()
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "what", "when",
    "how", "our", "has", "have", "about", "into",
];

/// Up to four lowercase query terms worth matching in SQL.
fn significant_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        let term = raw.to_lowercase();
        if term.len() < 3 || STOPWORDS.contains(&term.as_str()) || terms.contains(&term) {
            continue;
        }
        terms.push(term);
        if terms.len() == 4 {
            break;
        }
    }
    terms
}

/// Fraction of query terms present in the record text, with a small bonus
/// when a query tag matches.
fn keyword_relevance(terms: &[String], tags: &[String], record: &ContextRecord) -> f32 {
    let text = record.text.to_lowercase();
    let mut score = 0.0;
    if !terms.is_empty() {
        let matched = terms.iter().filter(|t| text.contains(t.as_str())).count();
        score = matched as f32 / terms.len() as f32;
    }
    if !tags.is_empty() && tags.iter().any(|t| record.tags.contains(t)) {
        score = (score + 0.2).min(1.0);
    }
    score
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::context_engine::breaker::BreakerConfig;
    use crate::vector_index::HashingEmbedder;

    pub(crate) fn core() -> Arc<LayerCore> {
        let store = Arc::new(StructuredStore::open_in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
        let index =
            Arc::new(VectorIndex::open_in_memory(64, embedder.model_name()).unwrap());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        Arc::new(LayerCore::new(
            store,
            index,
            embedder,
            breakers,
            0.3,
            Duration::from_secs(30),
        ))
    }

    /// Store a record and index its embedding synchronously.
    pub(crate) fn seed(core: &LayerCore, record: &ContextRecord) {
        core.store.records.put(record).unwrap();
        core.index
            .insert(&record.id, &core.embedder.embed(&record.text))
            .unwrap();
    }

    pub(crate) fn query(text: &str) -> LayerQuery {
        LayerQuery {
            text: text.to_string(),
            tags: Vec::new(),
            k: 8,
            min_similarity: 0.05,
            now: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::breaker::BreakerState;

    #[test]
    fn test_normalize_fills_id_and_timestamp() {
        let core = testutil::core();
        let record = core
            .normalize(MemoryLayer::Conversation, EventDraft::text("hello there"))
            .unwrap();
        assert!(!record.id.is_empty());
        assert_eq!(record.layer, MemoryLayer::Conversation);
        assert!(record.tags.is_empty());
    }

    #[test]
    fn test_normalize_rejects_empty_text_and_blank_id() {
        let core = testutil::core();
        assert!(matches!(
            core.normalize(MemoryLayer::Conversation, EventDraft::text("   ")),
            Err(MemoryError::Validation(_))
        ));
        let mut draft = EventDraft::text("ok");
        draft.id = Some("  ".to_string());
        assert!(matches!(
            core.normalize(MemoryLayer::Conversation, draft),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn test_normalize_cleans_tags() {
        let core = testutil::core();
        let draft = EventDraft::text("note")
            .with_tag(" Planning ")
            .with_tag("planning")
            .with_tag("");
        let record = core.normalize(MemoryLayer::Strategic, draft).unwrap();
        assert_eq!(record.tags, vec!["planning"]);

        let bad = EventDraft::text("note").with_tag("a\"b");
        assert!(matches!(
            core.normalize(MemoryLayer::Strategic, bad),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn test_significant_terms_skips_stopwords() {
        let terms = significant_terms("What is the plan for the database migration?");
        assert_eq!(terms, vec!["plan", "database", "migration"]);
    }

    #[test]
    fn test_hybrid_merge_marks_double_hits() {
        let core = testutil::core();
        let record = core
            .normalize(
                MemoryLayer::Conversation,
                EventDraft::text("database migration plan for the quarter"),
            )
            .unwrap();
        testutil::seed(&core, &record);

        let hits = core
            .hybrid_retrieve(MemoryLayer::Conversation, &testutil::query("database migration"), |_| 0.5)
            .unwrap();
        assert_eq!(hits.items.len(), 1);
        assert_eq!(hits.items[0].source, RetrievalSource::Hybrid);
        assert!(hits.items[0].relevance > 0.5);
        assert!(!hits.degraded);
    }

    #[test]
    fn test_open_vector_circuit_degrades_to_keyword() {
        let core = testutil::core();
        let record = core
            .normalize(
                MemoryLayer::Conversation,
                EventDraft::text("capacity planning session notes"),
            )
            .unwrap();
        testutil::seed(&core, &record);
        core.breakers
            .force_open(MemoryLayer::Conversation, StoreKind::Vector);

        let hits = core
            .hybrid_retrieve(MemoryLayer::Conversation, &testutil::query("capacity planning"), |_| 0.5)
            .unwrap();
        assert!(hits.degraded);
        assert_eq!(hits.items.len(), 1);
        assert_eq!(hits.items[0].source, RetrievalSource::Keyword);
        assert_eq!(
            core.breakers.state(MemoryLayer::Conversation, StoreKind::Vector),
            BreakerState::Open
        );
    }

    #[test]
    fn test_registry_lists_registered_layers_in_order() {
        let registry = LayerRegistry::with_default_layers(testutil::core());
        assert_eq!(registry.layers(), MemoryLayer::ALL.to_vec());
        assert!(registry.get(MemoryLayer::Learning).is_some());
    }
}
