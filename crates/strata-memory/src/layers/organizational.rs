//! Organizational layer - structural change tracking
//!
//! Events carrying `metadata["change_type"]` capture or extend an
//! `OrganizationalChange`. Repeat events with the same `change_id` grow the
//! change's milestone timeline; the predicted impact can be revised until
//! an outcome is observed.

use super::{EventDraft, LayerCandidates, LayerCore, LayerDigest, LayerModule, LayerQuery};
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ChangeType, ContextRecord, MemoryLayer, OrganizationalChange};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct OrganizationalLayer {
    core: Arc<LayerCore>,
}

impl OrganizationalLayer {
    pub fn new(core: Arc<LayerCore>) -> Self {
        Self { core }
    }

    fn validate_metadata(record: &ContextRecord) -> Result<()> {
        if let Some(kind) = record.metadata.get("change_type") {
            if ChangeType::parse(kind).is_none() {
                return Err(MemoryError::validation(format!(
                    "unknown change type {:?}",
                    kind
                )));
            }
        }
        if let Some(impact) = record.metadata.get("predicted_impact") {
            let value: f32 = impact.parse().map_err(|_| {
                MemoryError::validation(format!(
                    "predicted_impact {:?} is not a number",
                    impact
                ))
            })?;
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::validation(format!(
                    "predicted_impact {} outside 0.0..=1.0",
                    value
                )));
            }
        }
        Ok(())
    }

    fn capture_change(
        &self,
        record: &ContextRecord,
        change_id: &str,
        change_type: ChangeType,
    ) -> Result<()> {
        let store = &self.core.store;
        let impact_areas: Vec<String> = record
            .metadata
            .get("impact_areas")
            .map(|areas| {
                areas
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| record.tags.clone());
        let predicted = record
            .metadata
            .get("predicted_impact")
            .and_then(|s| s.parse::<f32>().ok());

        let change = match store.signals.get_change(change_id)? {
            Some(mut existing) => {
                existing.timeline.push(record.timestamp);
                for area in impact_areas {
                    if !existing.impact_areas.contains(&area) {
                        existing.impact_areas.push(area);
                    }
                }
                // Prediction revisions stop once an outcome is on record.
                if let (Some(value), None) = (predicted, existing.observed_outcome) {
                    existing.predicted_impact = value;
                }
                existing
            }
            None => OrganizationalChange {
                id: change_id.to_string(),
                change_type,
                impact_areas,
                predicted_impact: predicted.unwrap_or(0.5),
                observed_outcome: None,
                timeline: vec![record.timestamp],
            },
        };
        store.signals.put_change(&change)?;
        debug!(
            change_id = %change_id,
            change_type = change_type.as_str(),
            milestones = change.timeline.len(),
            "organizational change captured"
        );
        Ok(())
    }
}

#[async_trait]
impl LayerModule for OrganizationalLayer {
    fn layer(&self) -> MemoryLayer {
        MemoryLayer::Organizational
    }

    async fn record(&self, draft: EventDraft) -> Result<ContextRecord> {
        let mut record = self.core.normalize(MemoryLayer::Organizational, draft)?;
        Self::validate_metadata(&record)?;

        let change_type = record
            .metadata
            .get("change_type")
            .and_then(|kind| ChangeType::parse(kind));
        if change_type.is_some() && !record.metadata.contains_key("change_id") {
            record
                .metadata
                .insert("change_id".to_string(), record.id.clone());
        }

        self.core.persist(&record)?;

        if let Some(change_type) = change_type {
            let change_id = record
                .metadata
                .get("change_id")
                .cloned()
                .unwrap_or_else(|| record.id.clone());
            if let Err(e) = self.capture_change(&record, &change_id, change_type) {
                warn!(
                    change_id = %change_id,
                    error = %e,
                    "change capture failed, record kept"
                );
            }
        }
        Ok(record)
    }

    async fn retrieve(&self, query: &LayerQuery) -> Result<LayerCandidates> {
        let mut join_failure = None;
        let impact: HashMap<String, f32> = match self.core.store.signals.list_changes() {
            Ok(changes) => changes
                .into_iter()
                .map(|c| (c.id, c.predicted_impact))
                .collect(),
            Err(e) => {
                join_failure = Some(format!("change join failed: {}", e));
                HashMap::new()
            }
        };

        let mut candidates =
            self.core
                .hybrid_retrieve(MemoryLayer::Organizational, query, |record| {
                    record
                        .metadata
                        .get("change_id")
                        .and_then(|id| impact.get(id))
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
        self.core.cached_digest(MemoryLayer::Organizational, || {
            let mut changes = self.core.store.signals.list_changes()?;
            // Most recently touched changes first.
            changes.sort_by(|a, b| b.timeline.last().cmp(&a.timeline.last()));
            let entries = changes
                .iter()
                .take(12)
                .map(|c| {
                    let observed = c
                        .observed_outcome
                        .map(|o| format!(", observed {:.2}", o))
                        .unwrap_or_default();
                    format!(
                        "{} [{}]: predicted {:.2}{}, {} milestones",
                        c.id,
                        c.change_type.as_str(),
                        c.predicted_impact,
                        observed,
                        c.timeline.len()
                    )
                })
                .collect();
            Ok(LayerDigest {
                layer: MemoryLayer::Organizational,
                headline: format!("{} organizational changes tracked", changes.len()),
                entries,
            })
        })
    }
}
