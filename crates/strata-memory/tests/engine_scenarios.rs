//! End-to-end scenarios across the engine facade.
//!
//! These exercise the full stack: layer modules over the structured store,
//! background indexing, hybrid retrieval, breaker degradation, and rebuilds.

use chrono::{Duration, Utc};
use strata_memory::context_engine::{ContextBudget, ContextQuery, ContextScope, StoreKind};
use strata_memory::{ContextEngine, EngineConfig, EventDraft, MemoryLayer};
use tempfile::TempDir;

fn small_config() -> EngineConfig {
    EngineConfig {
        embedding_dimension: 64,
        indexer_workers: 1,
        ..Default::default()
    }
}

fn engine() -> ContextEngine {
    ContextEngine::open_in_memory_with(small_config()).unwrap()
}

#[tokio::test]
async fn test_same_caller_id_writes_one_row() {
    let engine = engine();
    let draft = || {
        let mut d = EventDraft::text("weekly sync with the infra team");
        d.id = Some("evt-sync-7".to_string());
        d
    };

    let first = engine
        .record_event(MemoryLayer::Conversation, draft())
        .await
        .unwrap();
    let second = engine
        .record_event(MemoryLayer::Conversation, draft())
        .await
        .unwrap();
    assert_eq!(first, "evt-sync-7");
    assert_eq!(first, second);

    engine.shutdown().await;
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.database.total_records, 1);
    assert_eq!(stats.index.total_embeddings, 1);
}

#[tokio::test]
async fn test_forced_open_layer_is_skipped_not_fatal() {
    let engine = engine();
    engine
        .record_event(
            MemoryLayer::Conversation,
            EventDraft::text("vendor contract renewal chat"),
        )
        .await
        .unwrap();
    engine
        .record_event(
            MemoryLayer::Strategic,
            EventDraft::text("vendor contract strategy review")
                .with_meta("initiative_id", "init-vendor"),
        )
        .await
        .unwrap();

    engine
        .breakers()
        .force_open(MemoryLayer::Strategic, StoreKind::Structured);

    let result = engine
        .get_context(
            ContextQuery::text("vendor contract"),
            ContextScope::default(),
            ContextBudget::default(),
        )
        .await
        .unwrap();

    assert!(result.degraded);
    assert!(!result.layers_consulted.contains(&MemoryLayer::Strategic));
    assert!(result.layers_consulted.contains(&MemoryLayer::Conversation));
    assert!(result
        .items
        .iter()
        .any(|item| item.record.layer == MemoryLayer::Conversation));
    assert!(result
        .items
        .iter()
        .all(|item| item.record.layer != MemoryLayer::Strategic));
    assert!(result.quality_score > 0.0);
}

#[tokio::test]
async fn test_rebuild_preserves_top_k() {
    let engine = engine();
    let texts = [
        "database migration rollout plan",
        "database migration risks and mitigations",
        "migration of the billing database schema",
        "notes about the holiday party",
        "lunch menu for thursday",
    ];
    for (i, text) in texts.iter().enumerate() {
        let mut draft = EventDraft::text(*text);
        draft.id = Some(format!("rec-{}", i));
        engine
            .record_event(MemoryLayer::Conversation, draft)
            .await
            .unwrap();
    }
    engine.shutdown().await;

    let query = || {
        engine.get_context(
            ContextQuery::text("database migration"),
            ContextScope::only([MemoryLayer::Conversation]),
            ContextBudget {
                max_items: 3,
                max_bytes: 64 * 1024,
            },
        )
    };

    let before: Vec<String> = query()
        .await
        .unwrap()
        .items
        .iter()
        .map(|item| item.record.id.clone())
        .collect();
    assert_eq!(before.len(), 3);

    engine.rebuild_indexes().unwrap();

    let after: Vec<String> = query()
        .await
        .unwrap()
        .items
        .iter()
        .map(|item| item.record.id.clone())
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_health_reflects_recent_activity() {
    let engine = engine();
    let now = Utc::now();

    let mut kickoff = EventDraft::text("initiative kickoff and scoping")
        .with_meta("initiative_id", "init-e2e")
        .with_meta("initiative_status", "active")
        .with_meta("progress", "0.5");
    kickoff.timestamp = Some(now - Duration::days(30));
    engine
        .record_event(MemoryLayer::Strategic, kickoff)
        .await
        .unwrap();
    let stale_health = engine.initiative_health("init-e2e").unwrap();

    for (age_minutes, text) in [
        (90i64, "mid-cycle review for the initiative"),
        (5, "fresh progress update"),
    ] {
        let mut draft = EventDraft::text(text)
            .with_meta("initiative_id", "init-e2e")
            .with_meta("progress", "0.5");
        draft.timestamp = Some(now - Duration::minutes(age_minutes));
        engine
            .record_event(MemoryLayer::Strategic, draft)
            .await
            .unwrap();
    }
    let fresh_health = engine.initiative_health("init-e2e").unwrap();

    assert!(
        fresh_health > stale_health,
        "fresh {} should beat stale {}",
        fresh_health,
        stale_health
    );
    engine.shutdown().await;
}

#[test]
fn test_health_scoring_is_deterministic() {
    use strata_memory::scoring::{self, HealthWeights};
    use strata_memory::{Initiative, InitiativeStatus};

    let now = Utc::now();
    let initiative = Initiative {
        id: "init-det".to_string(),
        name: "Determinism check".to_string(),
        status: InitiativeStatus::Active,
        progress: 0.6,
        health_score: 0.5,
        dependencies: Vec::new(),
        last_updated: now - Duration::days(3),
    };
    let weights = HealthWeights::default();

    let a = scoring::initiative_health(&initiative, &[], &[], now, &weights);
    let b = scoring::initiative_health(&initiative, &[], &[], now, &weights);
    assert_eq!(a, b);
    assert!((0.0..=1.0).contains(&a));
}

#[tokio::test]
async fn test_relationship_quality_tracks_latest_sentiment() {
    let engine = engine();
    let now = Utc::now();

    let mut first = EventDraft::text("great planning session, very aligned")
        .with_meta("stakeholder_id", "maria")
        .with_meta("display_name", "Maria")
        .with_meta("sentiment", "0.9");
    first.timestamp = Some(now - Duration::hours(1));
    let first_id = engine
        .record_event(MemoryLayer::Stakeholder, first)
        .await
        .unwrap();
    let after_first = engine
        .stakeholder_profile("maria")
        .unwrap()
        .unwrap()
        .relationship_quality;

    let mut second = EventDraft::text("tense disagreement over the roadmap")
        .with_meta("stakeholder_id", "maria")
        .with_meta("sentiment", "0.1");
    second.timestamp = Some(now);
    let second_id = engine
        .record_event(MemoryLayer::Stakeholder, second)
        .await
        .unwrap();

    let profile = engine.stakeholder_profile("maria").unwrap().unwrap();
    assert!(profile.relationship_quality < after_first);
    // First interaction seeds the average at 0.9; the second folds 0.1 in
    // at alpha 0.3: 0.9 + 0.3 * (0.1 - 0.9) = 0.66.
    assert!((profile.relationship_quality - 0.66).abs() < 1e-3);
    assert_eq!(profile.interaction_history, vec![first_id, second_id]);
    assert!(profile.last_interaction.is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_reopen_preserves_records_and_index() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        data_dir: dir.path().join("memory"),
        ..small_config()
    };

    let id;
    {
        let engine = ContextEngine::open(config.clone()).unwrap();
        id = engine
            .record_event(
                MemoryLayer::Conversation,
                EventDraft::text("persistent architecture decision record"),
            )
            .await
            .unwrap();
        engine.shutdown().await;
    }

    let engine = ContextEngine::open(config).unwrap();
    assert!(engine.get_record(&id).unwrap().is_some());
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.database.total_records, 1);
    assert_eq!(stats.index.total_embeddings, 1);

    let result = engine
        .get_context(
            ContextQuery::text("architecture decision"),
            ContextScope::only([MemoryLayer::Conversation]),
            ContextBudget::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].record.id, id);
    engine.shutdown().await;
}
