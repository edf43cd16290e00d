//! Vector index - rebuildable ANN retrieval over record embeddings
//!
//! Lives in its own SQLite file so losing or corrupting it never touches
//! canonical data; `rebuild_from` restores it from the structured store.
//! Similarity metric is cosine. The HNSW graph keys on an internal i64
//! vector id; `IdMapping` translates to and from record ids, and search
//! silently skips graph nodes whose mapping was removed.

pub mod embedder;

pub use embedder::{Embedder, HashingEmbedder};

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::ContextRecord;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rayon::prelude::*;
use rusqlite::params;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

const VECTOR_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS vector_rows (
    vector_id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    model TEXT NOT NULL,
    generated_at TIMESTAMP NOT NULL
);
";

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub total_embeddings: usize,
    pub dimension: usize,
    pub index_type: String,
}

/// Two-way record id <-> vector id translation.
#[derive(Default)]
struct IdMapping {
    forward: HashMap<String, i64>,
    reverse: HashMap<i64, String>,
}

impl IdMapping {
    fn insert(&mut self, record_id: String, vector_id: i64) {
        if let Some(old) = self.forward.insert(record_id.clone(), vector_id) {
            self.reverse.remove(&old);
        }
        self.reverse.insert(vector_id, record_id);
    }

    fn remove_record(&mut self, record_id: &str) -> Option<i64> {
        let vector_id = self.forward.remove(record_id)?;
        self.reverse.remove(&vector_id);
        Some(vector_id)
    }
}

/// The mapping/cache pair and the ANN graph are never locked at the same
/// time. Search snapshots candidate ids from the graph before resolving them
/// through the pair; writers release the pair before touching the graph.
pub struct VectorIndex {
    pool: Arc<Pool<SqliteConnectionManager>>,
    ann_index: RwLock<Option<HNSWIndex<f32, i64>>>,
    embedding_cache: RwLock<HashMap<i64, Vec<f32>>>,
    mapping: RwLock<IdMapping>,
    dimension: usize,
    model: String,
}

impl VectorIndex {
    pub fn open(db_path: &Path, dimension: usize, model: &str) -> Result<Self> {
        info!("Opening vector index at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(MemoryError::index)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| MemoryError::index(format!("failed to create connection pool: {}", e)))?;
        Self::from_pool(Arc::new(pool), dimension, model)
    }

    pub fn open_in_memory(dimension: usize, model: &str) -> Result<Self> {
        let uri = format!(
            "file:strata-vec-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let manager = SqliteConnectionManager::file(&uri).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(2)
            .min_idle(Some(1))
            .build(manager)
            .map_err(|e| MemoryError::index(format!("failed to create connection pool: {}", e)))?;
        Self::from_pool(Arc::new(pool), dimension, model)
    }

    fn from_pool(
        pool: Arc<Pool<SqliteConnectionManager>>,
        dimension: usize,
        model: &str,
    ) -> Result<Self> {
        {
            let conn = pool
                .get()
                .map_err(|e| MemoryError::index(format!("pool: {}", e)))?;
            conn.execute_batch(VECTOR_SCHEMA_SQL)
                .map_err(MemoryError::index)?;
        }
        let index = Self {
            pool,
            ann_index: RwLock::new(None),
            embedding_cache: RwLock::new(HashMap::new()),
            mapping: RwLock::new(IdMapping::default()),
            dimension,
            model: model.to_string(),
        };
        if let Err(e) = index.initialize_index() {
            // Linear fallback remains available; a rebuild restores the graph.
            warn!("ANN index initialization failed, using linear search: {}", e);
        }
        Ok(index)
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| MemoryError::index(format!("failed to get connection from pool: {}", e)))
    }

    /// Load every stored embedding into the HNSW graph, the cache, and the
    /// id mapping.
    fn initialize_index(&self) -> Result<()> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT vector_id, record_id, embedding FROM vector_rows WHERE model = ?1")
            .map_err(MemoryError::index)?;
        let mut rows = stmt.query([&self.model]).map_err(MemoryError::index)?;

        let params = HNSWParams {
            n_neighbor: 16,
            ef_build: 100,
            ef_search: 50,
            ..Default::default()
        };
        let mut index = HNSWIndex::<f32, i64>::new(self.dimension, &params);

        let mut new_mapping = IdMapping::default();
        let mut new_cache = HashMap::new();

        while let Some(row) = rows.next().map_err(MemoryError::index)? {
            let vector_id: i64 = row.get(0).map_err(MemoryError::index)?;
            let record_id: String = row.get(1).map_err(MemoryError::index)?;
            let embedding_bytes: Vec<u8> = row.get(2).map_err(MemoryError::index)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| MemoryError::index(format!("deserialization error: {}", e)))?;

            let _ = index.add(&embedding, vector_id);
            new_mapping.insert(record_id, vector_id);
            new_cache.insert(vector_id, embedding);
        }

        index
            .build(Metric::CosineSimilarity)
            .map_err(|e| MemoryError::index(format!("failed to build index: {}", e)))?;

        let count = new_cache.len();
        {
            let mut mapping = self.mapping.write().unwrap();
            let mut cache = self.embedding_cache.write().unwrap();
            *mapping = new_mapping;
            *cache = new_cache;
        }
        *self.ann_index.write().unwrap() = Some(index);
        info!("ANN index initialized with {} embeddings", count);
        Ok(())
    }

    /// Insert or replace the embedding for a record. Zero-norm embeddings
    /// (empty text) are skipped; the record stays reachable by keyword.
    pub fn insert(&self, record_id: &str, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(MemoryError::validation(format!(
                "embedding dimension {} does not match index dimension {}",
                embedding.len(),
                self.dimension
            )));
        }
        if embedding.iter().all(|x| *x == 0.0) {
            debug!(record_id = %record_id, "skipping zero-norm embedding");
            return Ok(());
        }

        let embedding_bytes = bincode::serialize(&embedding.to_vec())
            .map_err(|e| MemoryError::index(format!("serialization error: {}", e)))?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO vector_rows (record_id, embedding, model, generated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record_id,
                embedding_bytes,
                &self.model,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .map_err(MemoryError::index)?;
        let vector_id = conn.last_insert_rowid();
        drop(conn);

        {
            let mut mapping = self.mapping.write().unwrap();
            let mut cache = self.embedding_cache.write().unwrap();
            if let Some(old) = mapping.remove_record(record_id) {
                cache.remove(&old);
            }
            mapping.insert(record_id.to_string(), vector_id);
            cache.insert(vector_id, embedding.to_vec());
        }

        if let Some(ref mut index) = *self.ann_index.write().unwrap() {
            let _ = index.add(embedding, vector_id);
            index
                .build(Metric::CosineSimilarity)
                .map_err(|e| MemoryError::index(format!("failed to rebuild index: {}", e)))?;
        }
        Ok(())
    }

    /// Nearest records by cosine similarity, best first. Results below
    /// `threshold` are dropped.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimension {
            return Err(MemoryError::validation(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let candidates: Option<Vec<i64>> = {
            let index_guard = self.ann_index.read().unwrap();
            index_guard
                .as_ref()
                // Overfetch to survive stale graph nodes left by removals.
                .map(|index| index.search(query, k.saturating_mul(2).max(k + 4)))
        };

        if let Some(candidates) = candidates {
            let mapping = self.mapping.read().unwrap();
            let cache = self.embedding_cache.read().unwrap();
            let mut scored: Vec<(String, f32)> = Vec::new();
            for vector_id in &candidates {
                let record_id = match mapping.reverse.get(vector_id) {
                    Some(id) => id.clone(),
                    None => continue,
                };
                if let Some(embedding) = cache.get(vector_id) {
                    let sim = cosine_similarity(query, embedding);
                    if sim >= threshold {
                        scored.push((record_id, sim));
                    }
                }
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);
            return Ok(scored);
        }
        warn!("ANN index not available, falling back to linear search");
        self.search_linear(query, k, threshold)
    }

    fn search_linear(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(String, f32)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT record_id, embedding FROM vector_rows WHERE model = ?1")
            .map_err(MemoryError::index)?;
        let mut rows = stmt.query([&self.model]).map_err(MemoryError::index)?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next().map_err(MemoryError::index)? {
            let record_id: String = row.get(0).map_err(MemoryError::index)?;
            let embedding_bytes: Vec<u8> = row.get(1).map_err(MemoryError::index)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| MemoryError::index(format!("deserialization error: {}", e)))?;

            let sim = cosine_similarity(query, &embedding);
            if sim >= threshold {
                matches.push((record_id, sim));
            }
        }
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(k);
        Ok(matches)
    }

    /// Drop a record's embedding. The HNSW graph keeps a stale node until
    /// the next rebuild; search filters it through the mapping.
    pub fn remove(&self, record_id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn
            .execute("DELETE FROM vector_rows WHERE record_id = ?1", [record_id])
            .map_err(MemoryError::index)?;
        drop(conn);

        let mut mapping = self.mapping.write().unwrap();
        let mut cache = self.embedding_cache.write().unwrap();
        if let Some(vector_id) = mapping.remove_record(record_id) {
            cache.remove(&vector_id);
        }
        Ok(deleted > 0)
    }

    /// Re-embed every record and replace the whole index in one pass.
    /// Returns the number of records indexed.
    pub fn rebuild_from(&self, records: &[ContextRecord], embedder: &dyn Embedder) -> Result<usize> {
        if embedder.dimension() != self.dimension {
            return Err(MemoryError::validation(format!(
                "embedder dimension {} does not match index dimension {}",
                embedder.dimension(),
                self.dimension
            )));
        }
        info!("Rebuilding vector index from {} records", records.len());

        let embedded: Vec<(String, Vec<f32>)> = records
            .par_iter()
            .map(|r| (r.id.clone(), embedder.embed(&r.text)))
            .filter(|(_, e)| e.iter().any(|x| *x != 0.0))
            .collect();

        let mut conn = self.get_conn()?;
        let tx = conn.transaction().map_err(MemoryError::index)?;
        tx.execute("DELETE FROM vector_rows", [])
            .map_err(MemoryError::index)?;
        let now = chrono::Utc::now().to_rfc3339();
        for (record_id, embedding) in &embedded {
            let embedding_bytes = bincode::serialize(embedding)
                .map_err(|e| MemoryError::index(format!("serialization error: {}", e)))?;
            tx.execute(
                "INSERT INTO vector_rows (record_id, embedding, model, generated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record_id, embedding_bytes, &self.model, &now],
            )
            .map_err(MemoryError::index)?;
        }
        tx.commit().map_err(MemoryError::index)?;
        drop(conn);

        self.initialize_index()?;
        Ok(embedded.len())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let conn = self.get_conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM vector_rows", [], |row| row.get(0))
            .map_err(MemoryError::index)?;

        let index_type = if self.ann_index.read().unwrap().is_some() {
            "HNSW".to_string()
        } else {
            "Linear".to_string()
        };

        Ok(IndexStats {
            total_embeddings: count as usize,
            dimension: self.dimension,
            index_type,
        })
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_insert_and_search_ranks_by_cosine() {
        let index = VectorIndex::open_in_memory(4, "test").unwrap();
        index.insert("north", &unit(4, 0)).unwrap();
        index.insert("east", &unit(4, 1)).unwrap();
        index.insert("mixed", &[0.7, 0.7, 0.0, 0.0]).unwrap();

        let hits = index.search(&unit(4, 0), 3, 0.1).unwrap();
        assert_eq!(hits[0].0, "north");
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].0, "mixed");
        // "east" is orthogonal and filtered by the threshold
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_reinsert_replaces_embedding() {
        let index = VectorIndex::open_in_memory(4, "test").unwrap();
        index.insert("r", &unit(4, 0)).unwrap();
        index.insert("r", &unit(4, 1)).unwrap();

        let hits = index.search(&unit(4, 1), 2, 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "r");
        assert_eq!(index.stats().unwrap().total_embeddings, 1);
    }

    #[test]
    fn test_remove_hides_record_from_search() {
        let index = VectorIndex::open_in_memory(4, "test").unwrap();
        index.insert("keep", &unit(4, 0)).unwrap();
        index.insert("drop", &unit(4, 1)).unwrap();

        assert!(index.remove("drop").unwrap());
        assert!(!index.remove("drop").unwrap());

        let hits = index.search(&unit(4, 1), 2, 0.0).unwrap();
        assert!(hits.iter().all(|(id, _)| id != "drop"));
    }

    #[test]
    fn test_empty_index_searches_clean() {
        let index = VectorIndex::open_in_memory(4, "test").unwrap();
        let hits = index.search(&unit(4, 0), 5, 0.0).unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.stats().unwrap().index_type, "HNSW");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = VectorIndex::open_in_memory(4, "test").unwrap();
        assert!(matches!(
            index.insert("bad", &[1.0, 0.0]),
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            index.search(&[1.0, 0.0], 3, 0.0),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_vector_is_skipped() {
        let index = VectorIndex::open_in_memory(4, "test").unwrap();
        index.insert("empty", &[0.0; 4]).unwrap();
        assert_eq!(index.stats().unwrap().total_embeddings, 0);
    }

    #[test]
    fn test_rebuild_from_records_matches_fresh_inserts() {
        use crate::memory_db::schema::MemoryLayer;
        let embedder = HashingEmbedder::new(64);
        let index = VectorIndex::open_in_memory(64, embedder.model_name()).unwrap();

        let make = |id: &str, text: &str| ContextRecord {
            id: id.to_string(),
            layer: MemoryLayer::Conversation,
            timestamp: chrono::Utc::now(),
            text: text.to_string(),
            tags: vec![],
            metadata: Default::default(),
        };
        let records = vec![
            make("a", "database migration rollout"),
            make("b", "stakeholder alignment meeting"),
            make("c", "migration plan for the database"),
        ];
        for r in &records {
            index.insert(&r.id, &embedder.embed(&r.text)).unwrap();
        }
        let query = embedder.embed("database migration");
        let before: Vec<String> = index
            .search(&query, 2, 0.0)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let indexed = index.rebuild_from(&records, &embedder).unwrap();
        assert_eq!(indexed, 3);

        let after: Vec<String> = index
            .search(&query, 2, 0.0)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(before, after);
    }
}
