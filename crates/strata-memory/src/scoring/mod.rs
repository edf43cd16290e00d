//! Quality and health scoring
//!
//! Every function here is pure and deterministic: time enters as an explicit
//! argument, weights come from configuration, and identical inputs always
//! produce identical scores.

use crate::memory_db::schema::{ContextRecord, Initiative, InitiativeStatus, MemoryLayer};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref POSITIVE_SENTIMENT: Regex = Regex::new(
        r"(?i)aligned|agreed|praise|productive|resolved|success|support|thanks|win|breakthrough"
    )
    .unwrap();
    static ref NEGATIVE_SENTIMENT: Regex = Regex::new(
        r"(?i)blocked|complaint|conflict|escalat|frustrat|missed|risk|slip|tension|churn"
    )
    .unwrap();
}

/// Weights for the initiative health formula. Defaults sum to 1.0 and are
/// stable within a release.
#[derive(Debug, Clone)]
pub struct HealthWeights {
    pub progress_weight: f32,
    pub update_recency_weight: f32,
    pub dependency_weight: f32,
    pub engagement_weight: f32,
    /// Recency scale for strategic work, in days.
    pub recency_scale_days: f32,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            progress_weight: 0.35,
            update_recency_weight: 0.30,
            dependency_weight: 0.20,
            engagement_weight: 0.15,
            recency_scale_days: 7.0,
        }
    }
}

/// Weights for candidate ranking in context assembly.
#[derive(Debug, Clone)]
pub struct RankWeights {
    pub recency_weight: f32,
    pub relevance_weight: f32,
    pub importance_weight: f32,
    /// Recency scale for retrieval, in hours.
    pub recency_scale_hours: f32,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            recency_weight: 0.25,
            relevance_weight: 0.55,
            importance_weight: 0.20,
            recency_scale_hours: 24.0,
        }
    }
}

/// Per-layer weights used for the context quality (coverage) score.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub conversation: f32,
    pub strategic: f32,
    pub stakeholder: f32,
    pub learning: f32,
    pub organizational: f32,
}

impl Default for LayerWeights {
    fn default() -> Self {
        Self {
            conversation: 0.8,
            strategic: 1.2,
            stakeholder: 1.0,
            learning: 0.9,
            organizational: 0.9,
        }
    }
}

impl LayerWeights {
    pub fn weight_for(&self, layer: MemoryLayer) -> f32 {
        match layer {
            MemoryLayer::Conversation => self.conversation,
            MemoryLayer::Strategic => self.strategic,
            MemoryLayer::Stakeholder => self.stakeholder,
            MemoryLayer::Learning => self.learning,
            MemoryLayer::Organizational => self.organizational,
        }
    }
}

/// Hyperbolic recency decay: 1.0 at zero age, 0.5 at one scale unit.
/// Future-dated inputs count as fresh.
pub fn recency_factor(age_seconds: f32, scale_seconds: f32) -> f32 {
    if age_seconds <= 0.0 {
        return 1.0;
    }
    1.0 / (1.0 + age_seconds / scale_seconds.max(1.0))
}

/// Weighted ranking score for one retrieval candidate.
pub fn rank_score(weights: &RankWeights, recency: f32, relevance: f32, importance: f32) -> f32 {
    let score = recency * weights.recency_weight
        + relevance * weights.relevance_weight
        + importance * weights.importance_weight;
    score.clamp(0.0, 1.0)
}

/// Initiative health: progress, freshness of the latest relevant write,
/// dependency completion, and engagement recency, combined by weight and
/// clamped to 0.0..=1.0.
pub fn initiative_health(
    initiative: &Initiative,
    related: &[ContextRecord],
    dependencies: &[Initiative],
    now: DateTime<Utc>,
    weights: &HealthWeights,
) -> f32 {
    let scale_seconds = weights.recency_scale_days * 86_400.0;

    // Freshest of the initiative row itself and any related record.
    let latest_update = related
        .iter()
        .map(|r| r.timestamp)
        .chain(std::iter::once(initiative.last_updated))
        .max()
        .unwrap_or(initiative.last_updated);
    let update_age = (now - latest_update).num_seconds() as f32;
    let update_recency = recency_factor(update_age, scale_seconds);

    // Fraction of declared dependencies already completed. Dependencies that
    // are declared but not yet stored count as open.
    let dependency_term = if initiative.dependencies.is_empty() {
        1.0
    } else {
        let completed = initiative
            .dependencies
            .iter()
            .filter(|dep_id| {
                dependencies
                    .iter()
                    .any(|d| &d.id == *dep_id && d.status == InitiativeStatus::Completed)
            })
            .count();
        completed as f32 / initiative.dependencies.len() as f32
    };

    // Engagement: recency of the newest related record alone. No recorded
    // activity means no observed engagement.
    let engagement_term = related
        .iter()
        .map(|r| r.timestamp)
        .max()
        .map(|latest| recency_factor((now - latest).num_seconds() as f32, scale_seconds))
        .unwrap_or(0.0);

    let score = initiative.progress * weights.progress_weight
        + update_recency * weights.update_recency_weight
        + dependency_term * weights.dependency_weight
        + engagement_term * weights.engagement_weight;
    score.clamp(0.0, 1.0)
}

/// Exponential moving average for relationship quality. `alpha` is the
/// weight of the newest observation.
pub fn relationship_quality_update(current: f32, sentiment: f32, alpha: f32) -> f32 {
    let alpha = alpha.clamp(0.0, 1.0);
    ((1.0 - alpha) * current + alpha * sentiment).clamp(0.0, 1.0)
}

/// Deterministic tag sentiment: 0.5 is neutral, positive and negative tag
/// matches pull the score toward 1.0 and 0.0 respectively.
pub fn sentiment_from_tags(tags: &[String]) -> f32 {
    let mut positive = 0usize;
    let mut negative = 0usize;
    for tag in tags {
        if POSITIVE_SENTIMENT.is_match(tag) {
            positive += 1;
        }
        if NEGATIVE_SENTIMENT.is_match(tag) {
            negative += 1;
        }
    }
    if positive + negative == 0 {
        return 0.5;
    }
    let balance = (positive as f32 - negative as f32) / (positive + negative) as f32;
    (0.5 + 0.5 * balance).clamp(0.0, 1.0)
}

/// Coverage quality for an assembled context: the weight of layers that
/// contributed items over the weight of layers that answered at all. Layers
/// that failed or timed out appear in neither set.
pub fn context_quality(
    contributed: &[MemoryLayer],
    consulted: &[MemoryLayer],
    weights: &LayerWeights,
) -> f32 {
    let consulted_weight: f32 = consulted.iter().map(|l| weights.weight_for(*l)).sum();
    if consulted_weight <= 0.0 {
        return 0.0;
    }
    let contributed_weight: f32 = contributed.iter().map(|l| weights.weight_for(*l)).sum();
    (contributed_weight / consulted_weight).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn record_at(id: &str, ts: DateTime<Utc>) -> ContextRecord {
        ContextRecord {
            id: id.to_string(),
            layer: MemoryLayer::Strategic,
            timestamp: ts,
            text: "update".to_string(),
            tags: vec![],
            metadata: BTreeMap::new(),
        }
    }

    fn initiative_at(ts: DateTime<Utc>) -> Initiative {
        Initiative {
            id: "init".to_string(),
            name: "migration".to_string(),
            status: InitiativeStatus::Active,
            progress: 0.5,
            health_score: 0.5,
            dependencies: vec![],
            last_updated: ts,
        }
    }

    #[test]
    fn test_recency_factor_decays_monotonically() {
        let fresh = recency_factor(0.0, 3600.0);
        let hour = recency_factor(3600.0, 3600.0);
        let day = recency_factor(86_400.0, 3600.0);
        assert_eq!(fresh, 1.0);
        assert!((hour - 0.5).abs() < 1e-6);
        assert!(day < hour);
        // Clock skew: future timestamps count as fresh
        assert_eq!(recency_factor(-60.0, 3600.0), 1.0);
    }

    #[test]
    fn test_health_is_deterministic() {
        let now = Utc::now();
        let init = initiative_at(now - Duration::days(2));
        let related = vec![record_at("r", now - Duration::days(1))];
        let weights = HealthWeights::default();

        let a = initiative_health(&init, &related, &[], now, &weights);
        let b = initiative_health(&init, &related, &[], now, &weights);
        assert_eq!(a, b);
    }

    #[test]
    fn test_recent_update_raises_health() {
        let now = Utc::now();
        let weights = HealthWeights::default();
        let init = initiative_at(now - Duration::days(30));

        let t1_only = vec![record_at("t1", now - Duration::days(21))];
        let with_t3 = vec![
            record_at("t1", now - Duration::days(21)),
            record_at("t2", now - Duration::days(7)),
            record_at("t3", now - Duration::hours(2)),
        ];

        let stale = initiative_health(&init, &t1_only, &[], now, &weights);
        let fresh = initiative_health(&init, &with_t3, &[], now, &weights);
        assert!(fresh > stale);
    }

    #[test]
    fn test_open_dependencies_lower_health() {
        let now = Utc::now();
        let weights = HealthWeights::default();

        let mut blocked = initiative_at(now);
        blocked.dependencies = vec!["dep-a".to_string(), "dep-b".to_string()];

        let mut dep_a = initiative_at(now);
        dep_a.id = "dep-a".to_string();
        dep_a.status = InitiativeStatus::Completed;
        let mut dep_b = initiative_at(now);
        dep_b.id = "dep-b".to_string();
        dep_b.status = InitiativeStatus::Active;

        let half_done = initiative_health(&blocked, &[], &[dep_a.clone(), dep_b], now, &weights);

        let mut dep_b_done = dep_a.clone();
        dep_b_done.id = "dep-b".to_string();
        let all_done = initiative_health(&blocked, &[], &[dep_a, dep_b_done], now, &weights);

        assert!(all_done > half_done);
    }

    #[test]
    fn test_quality_ema_moves_toward_sentiment() {
        let current = 0.5;
        let updated = relationship_quality_update(current, 0.9, 0.3);
        assert!(updated > current);
        assert!(updated < 0.9);

        let downward = relationship_quality_update(updated, 0.1, 0.3);
        assert!(downward < updated);
    }

    #[test]
    fn test_sentiment_from_tags() {
        let neutral = sentiment_from_tags(&["planning".to_string()]);
        assert_eq!(neutral, 0.5);

        let positive = sentiment_from_tags(&["aligned".to_string(), "productive".to_string()]);
        assert_eq!(positive, 1.0);

        let negative = sentiment_from_tags(&["escalation".to_string()]);
        assert_eq!(negative, 0.0);

        let mixed = sentiment_from_tags(&["aligned".to_string(), "blocked".to_string()]);
        assert_eq!(mixed, 0.5);
    }

    #[test]
    fn test_context_quality_penalizes_empty_layers() {
        let weights = LayerWeights::default();
        let consulted = [MemoryLayer::Conversation, MemoryLayer::Strategic];

        let full = context_quality(&consulted, &consulted, &weights);
        assert!((full - 1.0).abs() < 1e-6);

        let partial = context_quality(&[MemoryLayer::Conversation], &consulted, &weights);
        assert!(partial < 1.0);
        assert!(partial > 0.0);

        // Failed layers appear in neither list and do not dilute the score.
        let none = context_quality(&[], &[], &weights);
        assert_eq!(none, 0.0);
    }

    #[test]
    fn test_rank_score_clamped_and_weighted() {
        let weights = RankWeights::default();
        let top = rank_score(&weights, 1.0, 1.0, 1.0);
        assert!(top <= 1.0);

        let relevant = rank_score(&weights, 0.0, 1.0, 0.0);
        let recent = rank_score(&weights, 1.0, 0.0, 0.0);
        assert!(relevant > recent);
    }
}
