//! Database schema definitions for the layered memory system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The five partitions of strategic memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLayer {
    Conversation,
    Strategic,
    Stakeholder,
    Learning,
    Organizational,
}

impl MemoryLayer {
    pub const ALL: [MemoryLayer; 5] = [
        MemoryLayer::Conversation,
        MemoryLayer::Strategic,
        MemoryLayer::Stakeholder,
        MemoryLayer::Learning,
        MemoryLayer::Organizational,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLayer::Conversation => "conversation",
            MemoryLayer::Strategic => "strategic",
            MemoryLayer::Stakeholder => "stakeholder",
            MemoryLayer::Learning => "learning",
            MemoryLayer::Organizational => "organizational",
        }
    }

    pub fn parse(s: &str) -> Option<MemoryLayer> {
        match s {
            "conversation" => Some(MemoryLayer::Conversation),
            "strategic" => Some(MemoryLayer::Strategic),
            "stakeholder" => Some(MemoryLayer::Stakeholder),
            "learning" => Some(MemoryLayer::Learning),
            "organizational" => Some(MemoryLayer::Organizational),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical unit of memory. The embedding is not part of the canonical
/// record; it lives in the vector index keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: String,
    pub layer: MemoryLayer,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Initiative lifecycle. Completed and Abandoned are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiativeStatus {
    Proposed,
    Active,
    AtRisk,
    Completed,
    Abandoned,
}

impl InitiativeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitiativeStatus::Proposed => "proposed",
            InitiativeStatus::Active => "active",
            InitiativeStatus::AtRisk => "at_risk",
            InitiativeStatus::Completed => "completed",
            InitiativeStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<InitiativeStatus> {
        match s {
            "proposed" => Some(InitiativeStatus::Proposed),
            "active" => Some(InitiativeStatus::Active),
            "at_risk" => Some(InitiativeStatus::AtRisk),
            "completed" => Some(InitiativeStatus::Completed),
            "abandoned" => Some(InitiativeStatus::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InitiativeStatus::Completed | InitiativeStatus::Abandoned)
    }
}

/// Tracked strategic initiative. `dependencies` holds initiative ids and the
/// resulting graph must stay acyclic; writes that would close a cycle are
/// rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initiative {
    pub id: String,
    pub name: String,
    pub status: InitiativeStatus,
    pub progress: f32,
    pub health_score: f32,
    pub dependencies: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Stakeholder profile. `interaction_history` holds ContextRecord ids in
/// insert order and only ever grows; `relationship_quality` is a moving
/// aggregate, never written directly by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeholderProfile {
    pub id: String,
    pub display_name: String,
    pub communication_style: Vec<String>,
    pub relationship_quality: f32,
    pub interaction_history: Vec<String>,
    pub last_interaction: Option<DateTime<Utc>>,
}

/// One application of a strategic framework, for effectiveness tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPattern {
    pub id: String,
    pub framework_tag: String,
    pub context_record_id: String,
    pub outcome_score: Option<f32>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Restructure,
    Leadership,
    Process,
    Tooling,
    Policy,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Restructure => "restructure",
            ChangeType::Leadership => "leadership",
            ChangeType::Process => "process",
            ChangeType::Tooling => "tooling",
            ChangeType::Policy => "policy",
        }
    }

    pub fn parse(s: &str) -> Option<ChangeType> {
        match s {
            "restructure" => Some(ChangeType::Restructure),
            "leadership" => Some(ChangeType::Leadership),
            "process" => Some(ChangeType::Process),
            "tooling" => Some(ChangeType::Tooling),
            "policy" => Some(ChangeType::Policy),
            _ => None,
        }
    }
}

/// Observed or predicted organizational change. `timeline` milestones are
/// kept sorted ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationalChange {
    pub id: String,
    pub change_type: ChangeType,
    pub impact_areas: Vec<String>,
    pub predicted_impact: f32,
    pub observed_outcome: Option<f32>,
    pub timeline: Vec<DateTime<Utc>>,
}

/// Filter for structured record queries. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub layer: Option<MemoryLayer>,
    pub tags_any: Vec<String>,
    pub tags_all: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub text_like: Option<String>,
}

/// How a ranked record was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetrievalSource {
    Semantic,
    Keyword,
    Hybrid,
}

/// One scored retrieval candidate with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct RankedRecord {
    pub record: ContextRecord,
    pub score: f32,
    pub layer: MemoryLayer,
    pub source: RetrievalSource,
}

/// Assembled answer to a context query. `degraded` is set whenever any layer
/// in scope failed, timed out, or was short-circuited by its breaker.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub items: Vec<RankedRecord>,
    pub quality_score: f32,
    pub layers_consulted: Vec<MemoryLayer>,
    pub degraded: bool,
    pub degraded_reasons: Vec<String>,
}

impl QueryResult {
    pub fn empty_degraded(reason: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            quality_score: 0.0,
            layers_consulted: Vec::new(),
            degraded: true,
            degraded_reasons: vec![reason.into()],
        }
    }
}

/// Row counts and file size for the canonical store.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    pub total_initiatives: i64,
    pub total_stakeholders: i64,
    pub total_interactions: i64,
    pub total_patterns: i64,
    pub total_changes: i64,
    pub database_size_bytes: i64,
}

/// Full current schema, used directly for in-memory stores. On-disk stores
/// reach the same shape through the numbered migrations.
pub const SCHEMA_SQL: &str = "
-- Canonical context records
CREATE TABLE IF NOT EXISTS context_records (
    id TEXT PRIMARY KEY,
    layer TEXT NOT NULL,
    timestamp TIMESTAMP NOT NULL,
    text TEXT NOT NULL,
    tags TEXT NOT NULL,
    metadata TEXT NOT NULL
);
-- Initiatives table
CREATE TABLE IF NOT EXISTS initiatives (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0.0,
    health_score REAL NOT NULL DEFAULT 0.5,
    last_updated TIMESTAMP NOT NULL
);
-- Initiative dependency edges (directed, acyclic)
CREATE TABLE IF NOT EXISTS initiative_deps (
    initiative_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (initiative_id, depends_on),
    FOREIGN KEY (initiative_id) REFERENCES initiatives(id) ON DELETE CASCADE
);
-- Stakeholder profiles
CREATE TABLE IF NOT EXISTS stakeholders (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    communication_style TEXT NOT NULL,
    relationship_quality REAL NOT NULL DEFAULT 0.5,
    last_interaction TIMESTAMP
);
-- Append-only interaction history (INSERT only, never updated or deleted)
CREATE TABLE IF NOT EXISTS stakeholder_interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stakeholder_id TEXT NOT NULL,
    record_id TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (stakeholder_id) REFERENCES stakeholders(id) ON DELETE CASCADE
);
-- Decision pattern applications
CREATE TABLE IF NOT EXISTS decision_patterns (
    id TEXT PRIMARY KEY,
    framework_tag TEXT NOT NULL,
    context_record_id TEXT NOT NULL,
    outcome_score REAL,
    applied_at TIMESTAMP NOT NULL
);
-- Organizational changes
CREATE TABLE IF NOT EXISTS organizational_changes (
    id TEXT PRIMARY KEY,
    change_type TEXT NOT NULL,
    impact_areas TEXT NOT NULL,
    predicted_impact REAL NOT NULL,
    observed_outcome REAL,
    timeline TEXT NOT NULL
);
-- Indexes for the hot query paths
CREATE INDEX IF NOT EXISTS idx_records_layer ON context_records (layer);
CREATE INDEX IF NOT EXISTS idx_records_timestamp ON context_records (timestamp);
CREATE INDEX IF NOT EXISTS idx_deps_initiative ON initiative_deps (initiative_id);
CREATE INDEX IF NOT EXISTS idx_interactions_stakeholder ON stakeholder_interactions (stakeholder_id);
CREATE INDEX IF NOT EXISTS idx_patterns_framework ON decision_patterns (framework_tag);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_round_trip() {
        for layer in MemoryLayer::ALL {
            assert_eq!(MemoryLayer::parse(layer.as_str()), Some(layer));
        }
        assert_eq!(MemoryLayer::parse("episodic"), None);
    }

    #[test]
    fn test_status_round_trip_and_terminal() {
        let all = [
            InitiativeStatus::Proposed,
            InitiativeStatus::Active,
            InitiativeStatus::AtRisk,
            InitiativeStatus::Completed,
            InitiativeStatus::Abandoned,
        ];
        for status in all {
            assert_eq!(InitiativeStatus::parse(status.as_str()), Some(status));
        }
        assert!(InitiativeStatus::Completed.is_terminal());
        assert!(InitiativeStatus::Abandoned.is_terminal());
        assert!(!InitiativeStatus::AtRisk.is_terminal());
    }

    #[test]
    fn test_change_type_rejects_unknown_values() {
        assert_eq!(ChangeType::parse("leadership"), Some(ChangeType::Leadership));
        assert_eq!(ChangeType::parse("merger"), None);
    }

    #[test]
    fn test_empty_degraded_result_shape() {
        let result = QueryResult::empty_degraded("all layers unavailable");
        assert!(result.items.is_empty());
        assert!(result.degraded);
        assert_eq!(result.quality_score, 0.0);
        assert_eq!(result.degraded_reasons.len(), 1);
    }
}
