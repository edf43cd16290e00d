//! Engine facade - one explicit instance wiring stores, layers, and workers
//!
//! `ContextEngine` owns the three stores, the layer registry, the retrieval
//! orchestrator, and the background indexer. There are no globals; callers
//! hold the instance and drop it (after `shutdown`) to release everything.

use crate::analytics::AnalyticsStore;
use crate::config::EngineConfig;
use crate::context_engine::breaker::{BreakerRegistry, BreakerState, StoreKind};
use crate::context_engine::indexer::{BackgroundIndexer, IndexJob};
use crate::context_engine::orchestrator::{
    ContextBudget, ContextQuery, ContextScope, Orchestrator, RetrievalTuning,
};
use crate::error::{MemoryError, Result};
use crate::layers::{EventDraft, LayerCore, LayerDigest, LayerRegistry};
use crate::memory_db::schema::{
    ContextRecord, DatabaseStats, Initiative, MemoryLayer, QueryResult, RecordFilter,
    StakeholderProfile,
};
use crate::memory_db::StructuredStore;
use crate::scoring;
use crate::vector_index::{Embedder, HashingEmbedder, IndexStats, VectorIndex};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Outcome of a full derived-store rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub records_indexed: usize,
    pub aggregates_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub layer: MemoryLayer,
    pub store: StoreKind,
    pub state: BreakerState,
}

/// Point-in-time operational snapshot across the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub database: DatabaseStats,
    pub index: IndexStats,
    pub pending_index_jobs: usize,
    pub breakers: Vec<BreakerStatus>,
}

pub struct ContextEngine {
    config: EngineConfig,
    store: Arc<StructuredStore>,
    index: Arc<VectorIndex>,
    analytics: Arc<AnalyticsStore>,
    embedder: Arc<dyn Embedder>,
    breakers: Arc<BreakerRegistry>,
    registry: Arc<LayerRegistry>,
    orchestrator: Orchestrator,
    indexer: Mutex<BackgroundIndexer>,
}

impl ContextEngine {
    /// Open the three store files under `config.data_dir` and spawn the
    /// background indexer. Must be called within a Tokio runtime.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(MemoryError::storage)?;
        let store = Arc::new(StructuredStore::open(&config.data_dir.join("memory.db"))?);
        let embedder: Arc<dyn Embedder> =
            Arc::new(HashingEmbedder::new(config.embedding_dimension));
        let index = Arc::new(VectorIndex::open(
            &config.data_dir.join("vector_index.db"),
            config.embedding_dimension,
            embedder.model_name(),
        )?);
        let analytics = Arc::new(AnalyticsStore::open(&config.data_dir.join("analytics.db"))?);
        Self::assemble(config, store, index, analytics, embedder)
    }

    /// Fully in-memory engine for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(EngineConfig::default())
    }

    pub fn open_in_memory_with(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(StructuredStore::open_in_memory()?);
        let embedder: Arc<dyn Embedder> =
            Arc::new(HashingEmbedder::new(config.embedding_dimension));
        let index = Arc::new(VectorIndex::open_in_memory(
            config.embedding_dimension,
            embedder.model_name(),
        )?);
        let analytics = Arc::new(AnalyticsStore::open_in_memory()?);
        Self::assemble(config, store, index, analytics, embedder)
    }

    fn assemble(
        config: EngineConfig,
        store: Arc<StructuredStore>,
        index: Arc<VectorIndex>,
        analytics: Arc<AnalyticsStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let core = Arc::new(LayerCore::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            breakers.clone(),
            config.sentiment_alpha,
            Duration::from_secs(config.digest_ttl_seconds),
        ));
        let registry = Arc::new(LayerRegistry::with_default_layers(core));
        let orchestrator = Orchestrator::new(
            registry.clone(),
            breakers.clone(),
            RetrievalTuning {
                rank_weights: config.rank_weights.clone(),
                layer_weights: config.layer_weights.clone(),
                layer_timeout: Duration::from_millis(config.layer_timeout_ms),
                per_layer_k: config.per_layer_k,
                min_similarity: config.min_similarity,
            },
        );
        let indexer = BackgroundIndexer::start(
            index.clone(),
            analytics.clone(),
            embedder.clone(),
            breakers.clone(),
            config.queue_depth,
            config.indexer_workers,
        );
        info!(
            workers = config.indexer_workers,
            dimension = config.embedding_dimension,
            "context engine ready"
        );
        Ok(Self {
            config,
            store,
            index,
            analytics,
            embedder,
            breakers,
            registry,
            orchestrator,
            indexer: Mutex::new(indexer),
        })
    }

    /// Record one event into `layer`. Returns once the canonical write has
    /// committed; embedding and analytics follow in the background.
    pub async fn record_event(&self, layer: MemoryLayer, draft: EventDraft) -> Result<String> {
        let module = self.registry.get(layer).ok_or_else(|| {
            MemoryError::validation(format!("layer {} is not registered", layer))
        })?;
        let record = module.record(draft).await?;
        self.indexer.lock().await.enqueue(IndexJob {
            record_id: record.id.clone(),
            layer,
            text: record.text.clone(),
            timestamp: record.timestamp,
        });
        Ok(record.id)
    }

    /// Assemble ranked context for a query. Partial layer failures surface
    /// as `degraded` metadata on the result; only the loss of every layer in
    /// scope is a hard error.
    pub async fn get_context(
        &self,
        query: ContextQuery,
        scope: ContextScope,
        budget: ContextBudget,
    ) -> Result<QueryResult> {
        if scope.layers.is_empty() {
            return Err(MemoryError::validation("scope must name at least one layer"));
        }
        let result = self.orchestrator.get_context(&query, &scope, &budget).await;
        if result.degraded && result.layers_consulted.is_empty() {
            return Err(MemoryError::AllLayersUnavailable);
        }
        Ok(result)
    }

    pub fn get_record(&self, record_id: &str) -> Result<Option<ContextRecord>> {
        self.store.records.get(record_id)
    }

    /// Remove one record from the canonical store and the vector index.
    pub fn delete_record(&self, record_id: &str) -> Result<bool> {
        let deleted = self.store.records.delete(record_id)?;
        if deleted {
            if let Err(e) = self.index.remove(record_id) {
                warn!(record_id, "index removal failed: {}", e);
            }
        }
        Ok(deleted)
    }

    /// Compact summary of one layer's contents, cached briefly.
    pub async fn layer_digest(&self, layer: MemoryLayer) -> Result<LayerDigest> {
        let module = self.registry.get(layer).ok_or_else(|| {
            MemoryError::validation(format!("layer {} is not registered", layer))
        })?;
        module.summarize().await
    }

    /// Health recomputed against the wall clock rather than read back from
    /// the stored snapshot, so a quiet initiative decays between writes.
    pub fn initiative_health(&self, initiative_id: &str) -> Result<f32> {
        let initiative = self.store.initiatives.get(initiative_id)?.ok_or_else(|| {
            MemoryError::validation(format!("unknown initiative {:?}", initiative_id))
        })?;

        let filter = RecordFilter {
            layer: Some(MemoryLayer::Strategic),
            ..Default::default()
        };
        let related: Vec<ContextRecord> = self
            .store
            .records
            .query(&filter, 256, 0)?
            .into_iter()
            .filter(|r| {
                r.metadata
                    .get("initiative_id")
                    .map(|id| id == initiative_id)
                    .unwrap_or(false)
            })
            .collect();
        let mut dependencies = Vec::new();
        for dep_id in &initiative.dependencies {
            if let Some(dep) = self.store.initiatives.get(dep_id)? {
                dependencies.push(dep);
            }
        }
        Ok(scoring::initiative_health(
            &initiative,
            &related,
            &dependencies,
            Utc::now(),
            &self.config.health_weights,
        ))
    }

    pub fn list_at_risk_initiatives(&self, threshold: f32) -> Result<Vec<Initiative>> {
        self.store.initiatives.list_at_risk(threshold)
    }

    pub fn stakeholder_profile(&self, stakeholder_id: &str) -> Result<Option<StakeholderProfile>> {
        self.store.stakeholders.get_profile(stakeholder_id)
    }

    /// Close the learning loop for one applied framework.
    pub fn record_decision_outcome(&self, pattern_id: &str, score: f32) -> Result<()> {
        self.store.signals.record_outcome(pattern_id, score)
    }

    /// Close the prediction loop for one organizational change.
    pub fn observe_change_outcome(&self, change_id: &str, score: f32) -> Result<()> {
        self.store.signals.observe_change_outcome(change_id, score)
    }

    /// Records-per-day counts for one layer over the trailing window.
    pub fn activity_trend(&self, layer: MemoryLayer, days: u32) -> Result<Vec<(String, i64)>> {
        self.analytics.activity_trend(layer, days, Utc::now())
    }

    /// Drop and repopulate both derived stores from the canonical records.
    pub fn rebuild_indexes(&self) -> Result<RebuildReport> {
        let records = self.store.records.all()?;
        let records_indexed = self.index.rebuild_from(&records, &*self.embedder)?;
        let aggregates_written = self.analytics.rebuild_from(&self.store)?;
        info!(records_indexed, aggregates_written, "derived stores rebuilt");
        Ok(RebuildReport {
            records_indexed,
            aggregates_written,
        })
    }

    /// Retention sweep plus vacuum upkeep on the canonical store. Vectors
    /// for purged records stay until the next rebuild; search filters them
    /// out as stale.
    pub fn run_maintenance(&self) -> Result<usize> {
        let purged = self.store.cleanup_old_records(self.config.retention_days)?;
        self.store.run_maintenance()?;
        if purged > 0 {
            info!(purged, "retention sweep removed aged-out records");
        }
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let database = self.store.get_stats()?;
        let index = self.index.stats()?;
        let pending_index_jobs = self.indexer.lock().await.pending_jobs();
        let breakers = self
            .breakers
            .snapshot()
            .into_iter()
            .map(|((layer, store), state)| BreakerStatus { layer, store, state })
            .collect();
        Ok(EngineStats {
            database,
            index,
            pending_index_jobs,
            breakers,
        })
    }

    /// Drain queued index work and stop the workers. The engine stays
    /// readable afterwards; new writes skip background indexing.
    pub async fn shutdown(&self) {
        self.indexer.lock().await.shutdown().await;
        info!("context engine shut down");
    }

    /// Breaker registry handle for operators and tests.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
