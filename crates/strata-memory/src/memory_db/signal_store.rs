//! Decision patterns and organizational change signals

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ChangeType, DecisionPattern, OrganizationalChange};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;

pub struct SignalStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SignalStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| MemoryError::storage(format!("failed to get connection from pool: {}", e)))
    }

    pub fn put_pattern(&self, pattern: &DecisionPattern) -> Result<()> {
        if let Some(score) = pattern.outcome_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(MemoryError::validation(format!(
                    "outcome_score {} outside 0.0..=1.0",
                    score
                )));
            }
        }
        if pattern.framework_tag.is_empty() {
            return Err(MemoryError::validation("framework_tag must not be empty"));
        }
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO decision_patterns
             (id, framework_tag, context_record_id, outcome_score, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &pattern.id,
                &pattern.framework_tag,
                &pattern.context_record_id,
                pattern.outcome_score.map(|s| s as f64),
                pattern.applied_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fill in the observed outcome. Each pattern gets exactly one
    /// observation; re-scoring an already observed pattern is rejected.
    pub fn record_outcome(&self, pattern_id: &str, score: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&score) {
            return Err(MemoryError::validation(format!(
                "outcome_score {} outside 0.0..=1.0",
                score
            )));
        }
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE decision_patterns SET outcome_score = ?1
             WHERE id = ?2 AND outcome_score IS NULL",
            params![score as f64, pattern_id],
        )?;
        if updated == 0 {
            return Err(MemoryError::validation(format!(
                "pattern {} missing or already observed",
                pattern_id
            )));
        }
        Ok(())
    }

    pub fn get_pattern(&self, id: &str) -> Result<Option<DecisionPattern>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, framework_tag, context_record_id, outcome_score, applied_at
             FROM decision_patterns WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_pattern(row)?)),
            None => Ok(None),
        }
    }

    /// Patterns, optionally restricted to one framework, newest first.
    pub fn list_patterns(&self, framework_tag: Option<&str>) -> Result<Vec<DecisionPattern>> {
        let conn = self.get_conn()?;
        let mut patterns = Vec::new();
        match framework_tag {
            Some(tag) => {
                let mut stmt = conn.prepare(
                    "SELECT id, framework_tag, context_record_id, outcome_score, applied_at
                     FROM decision_patterns WHERE framework_tag = ?1 ORDER BY applied_at DESC",
                )?;
                let mut rows = stmt.query([tag])?;
                while let Some(row) = rows.next()? {
                    patterns.push(row_to_pattern(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, framework_tag, context_record_id, outcome_score, applied_at
                     FROM decision_patterns ORDER BY applied_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    patterns.push(row_to_pattern(row)?);
                }
            }
        }
        Ok(patterns)
    }

    /// Per-framework (mean observed outcome, observation count, application
    /// count), best mean first. Unobserved applications count only toward
    /// applications.
    pub fn framework_effectiveness(&self) -> Result<Vec<(String, f32, i64, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT framework_tag,
                    COALESCE(AVG(outcome_score), 0.0),
                    COUNT(outcome_score),
                    COUNT(*)
             FROM decision_patterns
             GROUP BY framework_tag
             ORDER BY AVG(outcome_score) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let mean: f64 = row.get(1)?;
            Ok((row.get(0)?, mean as f32, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Milestones are kept sorted ascending regardless of input order.
    pub fn put_change(&self, change: &OrganizationalChange) -> Result<()> {
        if !(0.0..=1.0).contains(&change.predicted_impact) {
            return Err(MemoryError::validation(format!(
                "predicted_impact {} outside 0.0..=1.0",
                change.predicted_impact
            )));
        }
        let mut timeline = change.timeline.clone();
        timeline.sort();
        let timeline_json = serde_json::to_string(
            &timeline.iter().map(|t| t.to_rfc3339()).collect::<Vec<_>>(),
        )
        .map_err(|e| MemoryError::storage(format!("unserializable timeline: {}", e)))?;
        let areas_json = serde_json::to_string(&change.impact_areas)
            .map_err(|e| MemoryError::storage(format!("unserializable impact areas: {}", e)))?;

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO organizational_changes
             (id, change_type, impact_areas, predicted_impact, observed_outcome, timeline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &change.id,
                change.change_type.as_str(),
                areas_json,
                change.predicted_impact as f64,
                change.observed_outcome.map(|s| s as f64),
                timeline_json,
            ],
        )?;
        Ok(())
    }

    pub fn observe_change_outcome(&self, change_id: &str, score: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&score) {
            return Err(MemoryError::validation(format!(
                "observed_outcome {} outside 0.0..=1.0",
                score
            )));
        }
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE organizational_changes SET observed_outcome = ?1 WHERE id = ?2",
            params![score as f64, change_id],
        )?;
        if updated == 0 {
            return Err(MemoryError::validation(format!(
                "unknown organizational change: {}",
                change_id
            )));
        }
        Ok(())
    }

    pub fn get_change(&self, id: &str) -> Result<Option<OrganizationalChange>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, change_type, impact_areas, predicted_impact, observed_outcome, timeline
             FROM organizational_changes WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_change(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_changes(&self) -> Result<Vec<OrganizationalChange>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, change_type, impact_areas, predicted_impact, observed_outcome, timeline
             FROM organizational_changes ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(row_to_change(row)?);
        }
        Ok(changes)
    }
}

fn row_to_pattern(row: &Row) -> Result<DecisionPattern> {
    let applied_at_str: String = row.get(4)?;
    let applied_at = chrono::DateTime::parse_from_rfc3339(&applied_at_str)
        .map_err(|e| MemoryError::storage(format!("failed to parse timestamp: {}", e)))?
        .with_timezone(&chrono::Utc);
    let outcome: Option<f64> = row.get(3)?;

    Ok(DecisionPattern {
        id: row.get(0)?,
        framework_tag: row.get(1)?,
        context_record_id: row.get(2)?,
        outcome_score: outcome.map(|s| s as f32),
        applied_at,
    })
}

fn row_to_change(row: &Row) -> Result<OrganizationalChange> {
    let type_str: String = row.get(1)?;
    let change_type = ChangeType::parse(&type_str).ok_or_else(|| {
        MemoryError::storage(format!("unknown change type in database: {}", type_str))
    })?;

    let areas_json: String = row.get(2)?;
    let impact_areas: Vec<String> = serde_json::from_str(&areas_json)
        .map_err(|e| MemoryError::storage(format!("corrupt impact areas: {}", e)))?;

    let timeline_json: String = row.get(5)?;
    let timeline_strs: Vec<String> = serde_json::from_str(&timeline_json)
        .map_err(|e| MemoryError::storage(format!("corrupt timeline: {}", e)))?;
    let mut timeline = Vec::with_capacity(timeline_strs.len());
    for s in &timeline_strs {
        timeline.push(
            chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| MemoryError::storage(format!("failed to parse timestamp: {}", e)))?
                .with_timezone(&chrono::Utc),
        );
    }

    let predicted: f64 = row.get(3)?;
    let observed: Option<f64> = row.get(4)?;

    Ok(OrganizationalChange {
        id: row.get(0)?,
        change_type,
        impact_areas,
        predicted_impact: predicted as f32,
        observed_outcome: observed.map(|s| s as f32),
        timeline,
    })
}
