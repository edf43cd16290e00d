//! Engine configuration, loadable from the environment.

use crate::context_engine::breaker::BreakerConfig;
use crate::error::{MemoryError, Result};
use crate::scoring::{HealthWeights, LayerWeights, RankWeights};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub embedding_dimension: usize,
    pub indexer_workers: usize,
    pub queue_depth: usize,
    pub layer_timeout_ms: u64,
    pub per_layer_k: usize,
    pub min_similarity: f32,
    pub sentiment_alpha: f32,
    pub digest_ttl_seconds: u64,
    pub retention_days: i32,
    pub rank_weights: RankWeights,
    pub health_weights: HealthWeights,
    pub layer_weights: LayerWeights,
    pub breaker: BreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata-memory"),
            embedding_dimension: 384,
            indexer_workers: auto_detect_workers(),
            queue_depth: 256,
            layer_timeout_ms: 200,
            per_layer_k: 16,
            min_similarity: 0.1,
            sentiment_alpha: 0.3,
            digest_ttl_seconds: 60,
            retention_days: 365,
            rank_weights: RankWeights::default(),
            health_weights: HealthWeights::default(),
            layer_weights: LayerWeights::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `STRATA_*` environment variables, falling
    /// back to defaults. Ranking weights are code-level tuning and are not
    /// exposed through the environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let data_dir = PathBuf::from(
            env::var("STRATA_DATA_DIR").unwrap_or_else(|_| "./strata-memory".into()),
        );

        // "auto" sizes the worker pool from the CPU count.
        let indexer_workers = match env::var("STRATA_INDEXER_WORKERS") {
            Ok(raw) if raw == "auto" => auto_detect_workers(),
            Ok(raw) => raw
                .parse()
                .map_err(|e| MemoryError::validation(format!("STRATA_INDEXER_WORKERS: {}", e)))?,
            Err(_) => auto_detect_workers(),
        };

        let config = Self {
            data_dir,
            embedding_dimension: env_parse("STRATA_EMBEDDING_DIMENSION", 384)?,
            indexer_workers,
            queue_depth: env_parse("STRATA_QUEUE_DEPTH", 256)?,
            layer_timeout_ms: env_parse("STRATA_LAYER_TIMEOUT_MS", 200)?,
            per_layer_k: env_parse("STRATA_PER_LAYER_K", 16)?,
            min_similarity: env_parse("STRATA_MIN_SIMILARITY", 0.1)?,
            sentiment_alpha: env_parse("STRATA_SENTIMENT_ALPHA", 0.3)?,
            digest_ttl_seconds: env_parse("STRATA_DIGEST_TTL_SECONDS", 60)?,
            retention_days: env_parse("STRATA_RETENTION_DAYS", 365)?,
            rank_weights: RankWeights::default(),
            health_weights: HealthWeights::default(),
            layer_weights: LayerWeights::default(),
            breaker: BreakerConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension < 8 {
            return Err(MemoryError::validation(
                "embedding_dimension must be at least 8",
            ));
        }
        if self.layer_timeout_ms == 0 {
            return Err(MemoryError::validation("layer_timeout_ms must be positive"));
        }
        if self.per_layer_k == 0 {
            return Err(MemoryError::validation("per_layer_k must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(MemoryError::validation(
                "min_similarity must be between 0.0 and 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.sentiment_alpha) || self.sentiment_alpha == 0.0 {
            return Err(MemoryError::validation(
                "sentiment_alpha must be in (0.0, 1.0]",
            ));
        }
        if self.retention_days <= 0 {
            return Err(MemoryError::validation("retention_days must be positive"));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Data Dir: {}", self.data_dir.display());
        info!("- Embedding Dimension: {}", self.embedding_dimension);
        info!("- Indexer Workers: {}", self.indexer_workers);
        info!("- Queue Depth: {}", self.queue_depth);
        info!("- Layer Timeout: {}ms", self.layer_timeout_ms);
        info!("- Per-Layer K: {}", self.per_layer_k);
        info!("- Min Similarity: {}", self.min_similarity);
        info!("- Digest TTL: {}s", self.digest_ttl_seconds);
        info!("- Retention: {} days", self.retention_days);
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| MemoryError::validation(format!("invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

fn auto_detect_workers() -> usize {
    let cores = num_cpus::get();
    match cores {
        0..=2 => 1,
        3..=8 => 2,
        _ => 4,
    }
}
