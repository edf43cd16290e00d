//! Conversation layer - raw dialogue history

use super::{EventDraft, LayerCandidates, LayerCore, LayerDigest, LayerModule, LayerQuery};
use crate::error::Result;
use crate::memory_db::schema::{ContextRecord, MemoryLayer, RecordFilter};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

pub struct ConversationLayer {
    core: Arc<LayerCore>,
}

impl ConversationLayer {
    pub fn new(core: Arc<LayerCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl LayerModule for ConversationLayer {
    fn layer(&self) -> MemoryLayer {
        MemoryLayer::Conversation
    }

    async fn record(&self, draft: EventDraft) -> Result<ContextRecord> {
        let record = self.core.normalize(MemoryLayer::Conversation, draft)?;
        self.core.persist(&record)?;
        Ok(record)
    }

    async fn retrieve(&self, query: &LayerQuery) -> Result<LayerCandidates> {
        self.core
            .hybrid_retrieve(MemoryLayer::Conversation, query, |_| 0.5)
    }

    async fn summarize(&self) -> Result<LayerDigest> {
        self.core.cached_digest(MemoryLayer::Conversation, || {
            let now = Utc::now();
            let last_day = self.core.store.records.query(
                &RecordFilter {
                    layer: Some(MemoryLayer::Conversation),
                    since: Some(now - Duration::hours(24)),
                    ..Default::default()
                },
                1_000,
                0,
            )?;
            let last_week = self.core.store.records.query(
                &RecordFilter {
                    layer: Some(MemoryLayer::Conversation),
                    since: Some(now - Duration::days(7)),
                    ..Default::default()
                },
                10_000,
                0,
            )?;
            let entries = last_week
                .iter()
                .take(3)
                .map(|r| {
                    let mut line: String = r.text.chars().take(72).collect();
                    if r.text.chars().count() > 72 {
                        line.push('…');
                    }
                    format!("{} {}", r.timestamp.format("%Y-%m-%d"), line)
                })
                .collect();
            Ok(LayerDigest {
                layer: MemoryLayer::Conversation,
                headline: format!(
                    "{} conversation records in the last 24h, {} in the last 7 days",
                    last_day.len(),
                    last_week.len()
                ),
                entries,
            })
        })
    }
}
