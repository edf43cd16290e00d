//! Strategic layer - initiative-linked memory
//!
//! Events carrying `metadata["initiative_id"]` upsert the referenced
//! initiative and recompute its health score from progress, freshness,
//! dependency completion, and engagement. Metadata that parses is applied;
//! metadata that does not parse rejects the whole event before anything is
//! written.

use super::{EventDraft, LayerCandidates, LayerCore, LayerDigest, LayerModule, LayerQuery};
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ContextRecord, Initiative, InitiativeStatus, MemoryLayer, RecordFilter};
use crate::scoring::{self, HealthWeights};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct StrategicLayer {
    core: Arc<LayerCore>,
    health_weights: HealthWeights,
}

impl StrategicLayer {
    pub fn new(core: Arc<LayerCore>) -> Self {
        Self {
            core,
            health_weights: HealthWeights::default(),
        }
    }

    /// Reject malformed join metadata before the canonical write.
    fn validate_metadata(record: &ContextRecord) -> Result<()> {
        if let Some(status) = record.metadata.get("initiative_status") {
            if InitiativeStatus::parse(status).is_none() {
                return Err(MemoryError::validation(format!(
                    "unknown initiative status {:?}",
                    status
                )));
            }
        }
        if let Some(progress) = record.metadata.get("progress") {
            let value: f32 = progress.parse().map_err(|_| {
                MemoryError::validation(format!("progress {:?} is not a number", progress))
            })?;
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::validation(format!(
                    "progress {} outside 0.0..=1.0",
                    value
                )));
            }
        }
        Ok(())
    }

    /// Strategic records attached to one initiative, newest first.
    fn related_records(&self, initiative_id: &str) -> Result<Vec<ContextRecord>> {
        let filter = RecordFilter {
            layer: Some(MemoryLayer::Strategic),
            ..Default::default()
        };
        let records = self.core.store.records.query(&filter, 256, 0)?;
        Ok(records
            .into_iter()
            .filter(|r| {
                r.metadata
                    .get("initiative_id")
                    .map(|id| id == initiative_id)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Apply the record's metadata to the initiative and store a freshly
    /// derived health score.
    fn refresh_initiative(&self, record: &ContextRecord, initiative_id: &str) -> Result<()> {
        let store = &self.core.store;
        let mut initiative = store.initiatives.get(initiative_id)?.unwrap_or(Initiative {
            id: initiative_id.to_string(),
            name: initiative_id.to_string(),
            status: InitiativeStatus::Proposed,
            progress: 0.0,
            health_score: 0.5,
            dependencies: Vec::new(),
            last_updated: record.timestamp,
        });

        if let Some(name) = record.metadata.get("initiative_name") {
            initiative.name = name.clone();
        }
        if let Some(status) = record.metadata.get("initiative_status") {
            if let Some(parsed) = InitiativeStatus::parse(status) {
                initiative.status = parsed;
            }
        }
        if let Some(progress) = record.metadata.get("progress") {
            if let Ok(value) = progress.parse::<f32>() {
                initiative.progress = value.clamp(0.0, 1.0);
            }
        }
        if let Some(deps) = record.metadata.get("depends_on") {
            initiative.dependencies = deps
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if record.timestamp > initiative.last_updated {
            initiative.last_updated = record.timestamp;
        }

        let related = self.related_records(initiative_id)?;
        let mut dependencies = Vec::new();
        for dep_id in &initiative.dependencies {
            if let Some(dep) = store.initiatives.get(dep_id)? {
                dependencies.push(dep);
            }
        }
        // Health is a snapshot against the wall clock, so a backdated event
        // still yields a score that reflects how stale the work is today.
        initiative.health_score = scoring::initiative_health(
            &initiative,
            &related,
            &dependencies,
            Utc::now(),
            &self.health_weights,
        );
        store.initiatives.upsert(&initiative)?;
        debug!(
            initiative_id = %initiative.id,
            health = initiative.health_score,
            "initiative refreshed"
        );
        Ok(())
    }
}

#[async_trait]
impl LayerModule for StrategicLayer {
    fn layer(&self) -> MemoryLayer {
        MemoryLayer::Strategic
    }

    async fn record(&self, draft: EventDraft) -> Result<ContextRecord> {
        let record = self.core.normalize(MemoryLayer::Strategic, draft)?;
        Self::validate_metadata(&record)?;
        self.core.persist(&record)?;

        if let Some(initiative_id) = record.metadata.get("initiative_id").cloned() {
            // Initiative-store rejections (terminal state, dependency cycle)
            // freeze the initiative but keep the stored record.
            if let Err(e) = self.refresh_initiative(&record, &initiative_id) {
                warn!(
                    initiative_id = %initiative_id,
                    error = %e,
                    "initiative refresh failed, record kept"
                );
            }
        }
        Ok(record)
    }

    async fn retrieve(&self, query: &LayerQuery) -> Result<LayerCandidates> {
        let mut join_failure = None;
        let health: HashMap<String, f32> = match self.core.store.initiatives.list_all() {
            Ok(list) => list.into_iter().map(|i| (i.id, i.health_score)).collect(),
            Err(e) => {
                join_failure = Some(format!("initiative join failed: {}", e));
                HashMap::new()
            }
        };

        // Work on struggling initiatives surfaces first.
        let mut candidates =
            self.core
                .hybrid_retrieve(MemoryLayer::Strategic, query, |record| {
                    record
                        .metadata
                        .get("initiative_id")
                        .and_then(|id| health.get(id))
                        .map(|h| 0.5 + 0.5 * (1.0 - h))
                        .unwrap_or(0.5)
                })?;
        if let Some(reason) = join_failure {
            candidates.degraded = true;
            candidates.degraded_reasons.push(reason);
        }
        Ok(candidates)
    }

    async fn summarize(&self) -> Result<LayerDigest> {
        self.core.cached_digest(MemoryLayer::Strategic, || {
            let initiatives = self.core.store.initiatives.list_all()?;
            let count = |status: InitiativeStatus| {
                initiatives.iter().filter(|i| i.status == status).count()
            };
            let entries = initiatives
                .iter()
                .take(12)
                .map(|i| {
                    format!(
                        "{} [{}] progress {:.0}%, health {:.2}",
                        i.name,
                        i.status.as_str(),
                        i.progress * 100.0,
                        i.health_score
                    )
                })
                .collect();
            Ok(LayerDigest {
                layer: MemoryLayer::Strategic,
                headline: format!(
                    "{} initiatives: {} active, {} at risk, {} completed",
                    initiatives.len(),
                    count(InitiativeStatus::Active),
                    count(InitiativeStatus::AtRisk),
                    count(InitiativeStatus::Completed)
                ),
                entries,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testutil;
    use chrono::{Duration, Utc};

    fn draft_for(initiative: &str, text: &str) -> EventDraft {
        EventDraft::text(text).with_meta("initiative_id", initiative)
    }

    #[tokio::test]
    async fn test_record_creates_initiative_with_health() {
        let layer = StrategicLayer::new(testutil::core());
        layer
            .record(
                draft_for("init-1", "kicked off the data platform initiative")
                    .with_meta("initiative_name", "Data Platform")
                    .with_meta("initiative_status", "active")
                    .with_meta("progress", "0.25"),
            )
            .await
            .unwrap();

        let initiative = layer.core.store.initiatives.get("init-1").unwrap().unwrap();
        assert_eq!(initiative.name, "Data Platform");
        assert_eq!(initiative.status, InitiativeStatus::Active);
        assert!((initiative.progress - 0.25).abs() < 1e-6);
        assert!(initiative.health_score > 0.0 && initiative.health_score <= 1.0);
    }

    #[tokio::test]
    async fn test_malformed_progress_rejects_whole_event() {
        let layer = StrategicLayer::new(testutil::core());
        let result = layer
            .record(
                draft_for("init-1", "update").with_meta("progress", "forty percent"),
            )
            .await;
        assert!(matches!(result, Err(MemoryError::Validation(_))));

        // Nothing was written.
        let stats = layer.core.store.get_stats().unwrap();
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.total_initiatives, 0);
    }

    #[tokio::test]
    async fn test_terminal_initiative_keeps_record_but_stays_frozen() {
        let layer = StrategicLayer::new(testutil::core());
        layer
            .record(
                draft_for("done", "wrapped up")
                    .with_meta("initiative_status", "completed")
                    .with_meta("progress", "1.0"),
            )
            .await
            .unwrap();

        let record = layer
            .record(
                draft_for("done", "trying to reopen")
                    .with_meta("initiative_status", "active")
                    .with_meta("progress", "0.1"),
            )
            .await
            .unwrap();

        // Record stored, initiative untouched.
        assert!(layer.core.store.records.get(&record.id).unwrap().is_some());
        let initiative = layer.core.store.initiatives.get("done").unwrap().unwrap();
        assert_eq!(initiative.status, InitiativeStatus::Completed);
        assert!((initiative.progress - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_health_improves_with_recent_activity() {
        let core = testutil::core();
        let layer = StrategicLayer::new(core.clone());
        let base = Utc::now();

        let mut stale = draft_for("init-a", "early planning for rollout");
        stale.timestamp = Some(base - Duration::days(30));
        layer.record(stale).await.unwrap();
        let after_t1 = core.store.initiatives.get("init-a").unwrap().unwrap();

        for days_ago in [2i64, 0] {
            let mut fresh = draft_for("init-a", "rollout progressing");
            fresh.timestamp = Some(base - Duration::days(days_ago));
            layer.record(fresh).await.unwrap();
        }
        let after_t3 = core.store.initiatives.get("init-a").unwrap().unwrap();
        assert!(after_t3.health_score > after_t1.health_score);
    }

    #[tokio::test]
    async fn test_retrieve_boosts_at_risk_initiatives() {
        let core = testutil::core();
        let layer = StrategicLayer::new(core.clone());

        let healthy = core
            .normalize(
                MemoryLayer::Strategic,
                draft_for("ok", "migration going well"),
            )
            .unwrap();
        let risky = core
            .normalize(
                MemoryLayer::Strategic,
                draft_for("shaky", "migration slipping badly"),
            )
            .unwrap();
        testutil::seed(&core, &healthy);
        testutil::seed(&core, &risky);
        for (id, health) in [("ok", 0.9f32), ("shaky", 0.2)] {
            core.store
                .initiatives
                .upsert(&Initiative {
                    id: id.to_string(),
                    name: id.to_string(),
                    status: InitiativeStatus::Active,
                    progress: 0.5,
                    health_score: health,
                    dependencies: vec![],
                    last_updated: Utc::now(),
                })
                .unwrap();
        }

        let hits = layer.retrieve(&testutil::query("migration")).await.unwrap();
        let risky_hit = hits.items.iter().find(|c| c.record.id == risky.id).unwrap();
        let healthy_hit = hits.items.iter().find(|c| c.record.id == healthy.id).unwrap();
        assert!(risky_hit.importance > healthy_hit.importance);
    }

    #[tokio::test]
    async fn test_digest_summarizes_portfolio() {
        let layer = StrategicLayer::new(testutil::core());
        layer
            .record(
                draft_for("a", "alpha work")
                    .with_meta("initiative_status", "active")
                    .with_meta("initiative_name", "Alpha"),
            )
            .await
            .unwrap();
        layer
            .record(
                draft_for("b", "beta wrapped")
                    .with_meta("initiative_status", "completed")
                    .with_meta("initiative_name", "Beta"),
            )
            .await
            .unwrap();

        let digest = layer.summarize().await.unwrap();
        assert!(digest.headline.starts_with("2 initiatives"));
        assert!(digest.headline.contains("1 active"));
        assert!(digest.headline.contains("1 completed"));
        assert_eq!(digest.entries.len(), 2);
    }
}
