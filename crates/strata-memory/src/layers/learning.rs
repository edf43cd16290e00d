//! Learning layer - decision patterns and framework effectiveness
//!
//! Events are scanned for mentions of known decision frameworks. A match
//! stores a `DecisionPattern` whose outcome can be filled in later exactly
//! once, building the effectiveness table the digest reports.

use super::{EventDraft, LayerCandidates, LayerCore, LayerDigest, LayerModule, LayerQuery};
use crate::error::Result;
use crate::memory_db::schema::{ContextRecord, DecisionPattern, MemoryLayer};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

lazy_static! {
    /// Framework tag and its detection pattern; first match wins.
    static ref FRAMEWORK_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("swot", Regex::new(r"(?i)\bswot\b").unwrap()),
        ("okr", Regex::new(r"(?i)\bokrs?\b|objectives and key results").unwrap()),
        ("smart", Regex::new(r"(?i)\bsmart (goals?|objectives?|criteria)\b").unwrap()),
        ("rice", Regex::new(r"(?i)\brice (score|scoring|framework)\b").unwrap()),
        ("moscow", Regex::new(r"(?i)\bmoscow\b").unwrap()),
        ("premortem", Regex::new(r"(?i)\bpre.?mortem\b").unwrap()),
        ("five_whys", Regex::new(r"(?i)\b(five|5) whys\b").unwrap()),
        ("first_principles", Regex::new(r"(?i)\bfirst principles\b").unwrap()),
        ("five_forces", Regex::new(r"(?i)\bfive forces\b").unwrap()),
        ("eisenhower", Regex::new(r"(?i)\beisenhower\b").unwrap()),
    ];
}

/// First framework whose pattern matches the text.
pub fn detect_framework(text: &str) -> Option<&'static str> {
    FRAMEWORK_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(tag, _)| *tag)
}

pub struct LearningLayer {
    core: Arc<LayerCore>,
}

impl LearningLayer {
    pub fn new(core: Arc<LayerCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl LayerModule for LearningLayer {
    fn layer(&self) -> MemoryLayer {
        MemoryLayer::Learning
    }

    async fn record(&self, draft: EventDraft) -> Result<ContextRecord> {
        let mut record = self.core.normalize(MemoryLayer::Learning, draft)?;

        // Explicit metadata wins over text detection.
        let framework = record
            .metadata
            .get("framework")
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .or_else(|| detect_framework(&record.text).map(String::from));

        let pattern = framework.map(|tag| {
            let pattern_id = uuid::Uuid::new_v4().to_string();
            record.metadata.insert("framework".to_string(), tag.clone());
            record
                .metadata
                .insert("pattern_id".to_string(), pattern_id.clone());
            DecisionPattern {
                id: pattern_id,
                framework_tag: tag,
                context_record_id: record.id.clone(),
                outcome_score: None,
                applied_at: record.timestamp,
            }
        });

        self.core.persist(&record)?;

        if let Some(pattern) = pattern {
            match self.core.store.signals.put_pattern(&pattern) {
                Ok(()) => debug!(
                    framework = %pattern.framework_tag,
                    pattern_id = %pattern.id,
                    "decision pattern captured"
                ),
                Err(e) => warn!(
                    framework = %pattern.framework_tag,
                    error = %e,
                    "pattern capture failed, record kept"
                ),
            }
        }
        Ok(record)
    }

    async fn retrieve(&self, query: &LayerQuery) -> Result<LayerCandidates> {
        let mut join_failure = None;
        // record id -> observed outcome, for the importance boost.
        let outcomes: HashMap<String, f32> = match self.core.store.signals.list_patterns(None) {
            Ok(patterns) => patterns
                .into_iter()
                .filter_map(|p| p.outcome_score.map(|score| (p.context_record_id, score)))
                .collect(),
            Err(e) => {
                join_failure = Some(format!("pattern join failed: {}", e));
                HashMap::new()
            }
        };

        let mut candidates = self
            .core
            .hybrid_retrieve(MemoryLayer::Learning, query, |record| {
                outcomes.get(&record.id).copied().unwrap_or(0.5)
            })?;
        if let Some(reason) = join_failure {
            candidates.degraded = true;
            candidates.degraded_reasons.push(reason);
        }
        Ok(candidates)
    }

    async fn summarize(&self) -> Result<LayerDigest> {
        self.core.cached_digest(MemoryLayer::Learning, || {
            let rows = self.core.store.signals.framework_effectiveness()?;
            let entries = rows
                .iter()
                .map(|(tag, mean, observed, applied)| {
                    format!(
                        "{}: mean outcome {:.2} ({} observed of {} applied)",
                        tag, mean, observed, applied
                    )
                })
                .collect();
            Ok(LayerDigest {
                layer: MemoryLayer::Learning,
                headline: format!("{} frameworks tracked", rows.len()),
                entries,
            })
        })
    }
}
