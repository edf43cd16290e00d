//! Stakeholder layer - relationship memory
//!
//! Events carrying `metadata["stakeholder_id"]` append to that profile's
//! interaction history and fold the event's sentiment into the
//! relationship-quality moving average. Sentiment comes from an explicit
//! `metadata["sentiment"]` override or from the event tags.

use super::{EventDraft, LayerCandidates, LayerCore, LayerDigest, LayerModule, LayerQuery};
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ContextRecord, MemoryLayer};
use crate::scoring;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct StakeholderLayer {
    core: Arc<LayerCore>,
}

impl StakeholderLayer {
    pub fn new(core: Arc<LayerCore>) -> Self {
        Self { core }
    }

    fn validate_metadata(record: &ContextRecord) -> Result<()> {
        if let Some(sentiment) = record.metadata.get("sentiment") {
            let value: f32 = sentiment.parse().map_err(|_| {
                MemoryError::validation(format!("sentiment {:?} is not a number", sentiment))
            })?;
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::validation(format!(
                    "sentiment {} outside 0.0..=1.0",
                    value
                )));
            }
        }
        Ok(())
    }

    fn update_profile(&self, record: &ContextRecord, stakeholder_id: &str) -> Result<f32> {
        let store = &self.core.store;
        let display_name = record
            .metadata
            .get("display_name")
            .map(String::as_str)
            .unwrap_or(stakeholder_id);
        store.stakeholders.ensure_profile(stakeholder_id, display_name)?;

        let sentiment = record
            .metadata
            .get("sentiment")
            .and_then(|s| s.parse::<f32>().ok())
            .unwrap_or_else(|| scoring::sentiment_from_tags(&record.tags));
        let quality = store.stakeholders.record_interaction(
            stakeholder_id,
            &record.id,
            record.timestamp,
            sentiment,
            self.core.sentiment_alpha,
        )?;
        store.stakeholders.merge_style(stakeholder_id, &record.tags)?;
        Ok(quality)
    }
}

#[async_trait]
impl LayerModule for StakeholderLayer {
    fn layer(&self) -> MemoryLayer {
        MemoryLayer::Stakeholder
    }

    async fn record(&self, draft: EventDraft) -> Result<ContextRecord> {
        let record = self.core.normalize(MemoryLayer::Stakeholder, draft)?;
        Self::validate_metadata(&record)?;
        self.core.persist(&record)?;

        if let Some(stakeholder_id) = record.metadata.get("stakeholder_id").cloned() {
            match self.update_profile(&record, &stakeholder_id) {
                Ok(quality) => debug!(
                    stakeholder_id = %stakeholder_id,
                    quality,
                    "interaction recorded"
                ),
                Err(e) => warn!(
                    stakeholder_id = %stakeholder_id,
                    error = %e,
                    "profile update failed, record kept"
                ),
            }
        }
        Ok(record)
    }

    async fn retrieve(&self, query: &LayerQuery) -> Result<LayerCandidates> {
        let mut join_failure = None;
        let quality: HashMap<String, f32> = match self.core.store.stakeholders.list_profiles() {
            Ok(profiles) => profiles
                .into_iter()
                .map(|p| (p.id, p.relationship_quality))
                .collect(),
            Err(e) => {
                join_failure = Some(format!("stakeholder join failed: {}", e));
                HashMap::new()
            }
        };

        let mut candidates =
            self.core
                .hybrid_retrieve(MemoryLayer::Stakeholder, query, |record| {
                    record
                        .metadata
                        .get("stakeholder_id")
                        .and_then(|id| quality.get(id))
                        .copied()
                        .unwrap_or(0.5)
                })?;
        if let Some(reason) = join_failure {
            candidates.degraded = true;
            candidates.degraded_reasons.push(reason);
        }
        Ok(candidates)
    }

    async fn summarize(&self) -> Result<LayerDigest> {
        self.core.cached_digest(MemoryLayer::Stakeholder, || {
            let profiles = self.core.store.stakeholders.list_profiles()?;
            let entries = profiles
                .iter()
                .take(12)
                .map(|p| {
                    let last = p
                        .last_interaction
                        .map(|at| format!(", last seen {}", at.format("%Y-%m-%d")))
                        .unwrap_or_default();
                    format!(
                        "{}: quality {:.2}, {} interactions{}",
                        p.display_name,
                        p.relationship_quality,
                        p.interaction_history.len(),
                        last
                    )
                })
                .collect();
            Ok(LayerDigest {
                layer: MemoryLayer::Stakeholder,
                headline: format!("{} stakeholder profiles", profiles.len()),
                entries,
            })
        })
    }
}
