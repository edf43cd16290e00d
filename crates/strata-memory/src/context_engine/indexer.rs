//! Background indexer - embeddings and activity rollups off the write path
//!
//! Writes return as soon as the structured store commits; embedding and
//! analytics work rides a bounded queue behind them. A full queue drops the
//! newest job rather than blocking the caller: the record is already
//! durable and stays keyword-retrievable until the next index rebuild.

use crate::analytics::AnalyticsStore;
use crate::context_engine::breaker::{BreakerRegistry, StoreKind};
use crate::error::MemoryError;
use crate::memory_db::schema::MemoryLayer;
use crate::vector_index::{Embedder, VectorIndex};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One unit of deferred work for a freshly stored record.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub record_id: String,
    pub layer: MemoryLayer,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

pub struct BackgroundIndexer {
    sender: Option<mpsc::Sender<IndexJob>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl BackgroundIndexer {
    /// Spawn `worker_count` workers over a queue of `queue_depth` jobs.
    pub fn start(
        index: Arc<VectorIndex>,
        analytics: Arc<AnalyticsStore>,
        embedder: Arc<dyn Embedder>,
        breakers: Arc<BreakerRegistry>,
        queue_depth: usize,
        worker_count: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for worker_id in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let index = index.clone();
            let analytics = analytics.clone();
            let embedder = embedder.clone();
            let breakers = breakers.clone();
            let pending = pending.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // Lock only to receive; processing runs unlocked.
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else { break };
                    process_job(&index, &analytics, &*embedder, &breakers, job);
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                debug!(worker_id, "indexer worker drained");
            }));
        }

        Self {
            sender: Some(sender),
            workers,
            pending,
        }
    }

    /// Non-blocking enqueue. Returns false when the job was dropped.
    pub fn enqueue(&self, job: IndexJob) -> bool {
        let Some(sender) = &self.sender else {
            warn!(record_id = %job.record_id, "indexer is shut down, dropping index job");
            return false;
        };
        match sender.try_send(job) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    record_id = %job.record_id,
                    layer = %job.layer,
                    "index queue full, dropping index job"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(record_id = %job.record_id, "index queue closed, dropping index job");
                false
            }
        }
    }

    /// Jobs accepted but not yet processed.
    pub fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting work, then wait until queued jobs are finished.
    pub async fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("indexer worker failed during shutdown: {}", e);
            }
        }
    }
}

fn process_job(
    index: &VectorIndex,
    analytics: &AnalyticsStore,
    embedder: &dyn Embedder,
    breakers: &BreakerRegistry,
    job: IndexJob,
) {
    if breakers.allow(job.layer, StoreKind::Vector) {
        let embedding = embedder.embed(&job.text);
        match index.insert(&job.record_id, &embedding) {
            Ok(()) => breakers.on_success(job.layer, StoreKind::Vector),
            Err(e) => {
                if !matches!(e, MemoryError::Validation(_)) {
                    breakers.on_failure(job.layer, StoreKind::Vector);
                }
                warn!(record_id = %job.record_id, "embedding insert failed: {}", e);
            }
        }
    } else {
        debug!(record_id = %job.record_id, "vector circuit open, skipping embedding");
    }

    if breakers.allow(job.layer, StoreKind::Analytics) {
        match analytics.record_activity(job.layer, job.timestamp) {
            Ok(()) => breakers.on_success(job.layer, StoreKind::Analytics),
            Err(e) => {
                breakers.on_failure(job.layer, StoreKind::Analytics);
                warn!(layer = %job.layer, "activity rollup failed: {}", e);
            }
        }
    } else {
        debug!(layer = %job.layer, "analytics circuit open, skipping rollup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::breaker::BreakerConfig;
    use crate::vector_index::HashingEmbedder;

    fn fixture(
        queue_depth: usize,
        worker_count: usize,
    ) -> (BackgroundIndexer, Arc<VectorIndex>, Arc<AnalyticsStore>, Arc<BreakerRegistry>) {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
        let index = Arc::new(VectorIndex::open_in_memory(64, embedder.model_name()).unwrap());
        let analytics = Arc::new(AnalyticsStore::open_in_memory().unwrap());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let indexer = BackgroundIndexer::start(
            index.clone(),
            analytics.clone(),
            embedder,
            breakers.clone(),
            queue_depth,
            worker_count,
        );
        (indexer, index, analytics, breakers)
    }

    fn job(id: &str, text: &str) -> IndexJob {
        IndexJob {
            record_id: id.to_string(),
            layer: MemoryLayer::Conversation,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jobs_index_embeddings_and_activity() {
        let (mut indexer, index, analytics, _) = fixture(8, 2);
        assert!(indexer.enqueue(job("a", "quarterly budget review notes")));
        assert!(indexer.enqueue(job("b", "incident postmortem follow-ups")));
        indexer.shutdown().await;

        assert_eq!(indexer.pending_jobs(), 0);
        assert_eq!(index.stats().unwrap().total_embeddings, 2);
        let trend = analytics
            .activity_trend(MemoryLayer::Conversation, 1, Utc::now())
            .unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].1, 2);
    }

    // Single-threaded runtime: workers cannot run between enqueue calls,
    // so the queue fills deterministically.
    #[tokio::test]
    async fn test_full_queue_drops_newest_job() {
        let (mut indexer, index, _, _) = fixture(1, 1);
        assert!(indexer.enqueue(job("kept", "retained for indexing")));
        assert!(!indexer.enqueue(job("dropped", "no room for this one")));
        assert_eq!(indexer.pending_jobs(), 1);

        indexer.shutdown().await;
        assert_eq!(indexer.pending_jobs(), 0);
        assert_eq!(index.stats().unwrap().total_embeddings, 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_refused() {
        let (mut indexer, _, _, _) = fixture(4, 1);
        indexer.shutdown().await;
        assert!(!indexer.enqueue(job("late", "arrives after shutdown")));
        assert_eq!(indexer.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_open_vector_circuit_skips_embedding_but_not_rollup() {
        let (mut indexer, index, analytics, breakers) = fixture(4, 1);
        breakers.force_open(MemoryLayer::Conversation, StoreKind::Vector);

        assert!(indexer.enqueue(job("a", "planning sync recap")));
        indexer.shutdown().await;

        assert_eq!(index.stats().unwrap().total_embeddings, 0);
        let trend = analytics
            .activity_trend(MemoryLayer::Conversation, 1, Utc::now())
            .unwrap();
        assert_eq!(trend[0].1, 1);
    }
}
