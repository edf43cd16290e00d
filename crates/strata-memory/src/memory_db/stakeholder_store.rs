//! Stakeholder profiles and their append-only interaction history
//!
//! `stakeholder_interactions` rows are only ever inserted. Relationship
//! quality is a moving aggregate folded in by `record_interaction`; there is
//! no API that writes it directly.

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::StakeholderProfile;
use crate::scoring;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::debug;

pub struct StakeholderStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl StakeholderStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| MemoryError::storage(format!("failed to get connection from pool: {}", e)))
    }

    /// Create the profile if it does not exist yet and return its current
    /// state. Existing profiles are left untouched.
    pub fn ensure_profile(&self, id: &str, display_name: &str) -> Result<StakeholderProfile> {
        if id.is_empty() {
            return Err(MemoryError::validation("stakeholder id must not be empty"));
        }
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO stakeholders
             (id, display_name, communication_style, relationship_quality, last_interaction)
             VALUES (?1, ?2, '[]', 0.5, NULL)",
            params![id, display_name],
        )?;
        drop(conn);
        self.get_profile(id)?
            .ok_or_else(|| MemoryError::storage(format!("profile {} vanished after insert", id)))
    }

    /// Append one interaction and fold its sentiment into the relationship
    /// quality. The first interaction seeds the moving average at its own
    /// sentiment. Returns the updated quality.
    pub fn record_interaction(
        &self,
        stakeholder_id: &str,
        record_id: &str,
        at: DateTime<Utc>,
        sentiment: f32,
        alpha: f32,
    ) -> Result<f32> {
        let mut conn = self.get_conn()?;
        // Read-then-write: take the write lock up front so concurrent appends
        // queue instead of failing on lock upgrade.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<f64> = {
            let mut stmt =
                tx.prepare("SELECT relationship_quality FROM stakeholders WHERE id = ?1")?;
            let mut rows = stmt.query([stakeholder_id])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let current = current.ok_or_else(|| {
            MemoryError::validation(format!("unknown stakeholder: {}", stakeholder_id))
        })? as f32;

        let prior_interactions: i64 = tx.query_row(
            "SELECT COUNT(*) FROM stakeholder_interactions WHERE stakeholder_id = ?1",
            [stakeholder_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO stakeholder_interactions (stakeholder_id, record_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![stakeholder_id, record_id, at.to_rfc3339()],
        )?;

        let quality = if prior_interactions == 0 {
            sentiment.clamp(0.0, 1.0)
        } else {
            scoring::relationship_quality_update(current, sentiment, alpha)
        };

        tx.execute(
            "UPDATE stakeholders SET relationship_quality = ?1, last_interaction = ?2
             WHERE id = ?3",
            params![quality as f64, at.to_rfc3339(), stakeholder_id],
        )?;
        tx.commit()?;

        debug!(
            stakeholder_id = %stakeholder_id,
            quality = quality,
            "interaction recorded"
        );
        Ok(quality)
    }

    /// Union new style tags into the profile, preserving first-seen order.
    pub fn merge_style(&self, id: &str, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let style_json: Option<String> = {
            let mut stmt = tx.prepare("SELECT communication_style FROM stakeholders WHERE id = ?1")?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let style_json = style_json
            .ok_or_else(|| MemoryError::validation(format!("unknown stakeholder: {}", id)))?;
        let mut style: Vec<String> = serde_json::from_str(&style_json)
            .map_err(|e| MemoryError::storage(format!("corrupt style column: {}", e)))?;

        for tag in tags {
            if !style.contains(tag) {
                style.push(tag.clone());
            }
        }
        let merged = serde_json::to_string(&style)
            .map_err(|e| MemoryError::storage(format!("unserializable style: {}", e)))?;
        tx.execute(
            "UPDATE stakeholders SET communication_style = ?1 WHERE id = ?2",
            params![merged, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<StakeholderProfile>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, communication_style, relationship_quality, last_interaction
             FROM stakeholders WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        let mut profile = match rows.next()? {
            Some(row) => row_to_profile(row)?,
            None => return Ok(None),
        };
        profile.interaction_history = self.interaction_history(&conn, id)?;
        Ok(Some(profile))
    }

    pub fn list_profiles(&self) -> Result<Vec<StakeholderProfile>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, communication_style, relationship_quality, last_interaction
             FROM stakeholders ORDER BY display_name",
        )?;
        let mut rows = stmt.query([])?;
        let mut profiles = Vec::new();
        while let Some(row) = rows.next()? {
            profiles.push(row_to_profile(row)?);
        }
        for profile in &mut profiles {
            profile.interaction_history = self.interaction_history(&conn, &profile.id)?;
        }
        Ok(profiles)
    }

    /// Interaction record ids in insert order.
    fn interaction_history(
        &self,
        conn: &rusqlite::Connection,
        stakeholder_id: &str,
    ) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT record_id FROM stakeholder_interactions
             WHERE stakeholder_id = ?1 ORDER BY id ASC",
        )?;
        let history = stmt
            .query_map([stakeholder_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(history)
    }
}

fn row_to_profile(row: &Row) -> Result<StakeholderProfile> {
    let style_json: String = row.get(2)?;
    let communication_style: Vec<String> = serde_json::from_str(&style_json)
        .map_err(|e| MemoryError::storage(format!("corrupt style column: {}", e)))?;

    let quality: f64 = row.get(3)?;

    let last_interaction_str: Option<String> = row.get(4)?;
    let last_interaction = match last_interaction_str {
        Some(s) => Some(
            chrono::DateTime::parse_from_rfc3339(&s)
                .map_err(|e| MemoryError::storage(format!("failed to parse timestamp: {}", e)))?
                .with_timezone(&chrono::Utc),
        ),
        None => None,
    };

    Ok(StakeholderProfile {
        id: row.get(0)?,
        display_name: row.get(1)?,
        communication_style,
        relationship_quality: quality as f32,
        interaction_history: Vec::new(),
        last_interaction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::StructuredStore;

    #[test]
    fn test_ensure_profile_is_idempotent() {
        let store = StructuredStore::open_in_memory().unwrap();
        let first = store.stakeholders.ensure_profile("sh-1", "Jordan").unwrap();
        assert_eq!(first.relationship_quality, 0.5);

        store
            .stakeholders
            .record_interaction("sh-1", "rec-1", Utc::now(), 0.9, 0.3)
            .unwrap();

        // A later ensure must not reset the aggregate.
        let again = store.stakeholders.ensure_profile("sh-1", "Jordan").unwrap();
        assert!(again.relationship_quality > 0.5);
        assert_eq!(again.interaction_history, vec!["rec-1".to_string()]);
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let store = StructuredStore::open_in_memory().unwrap();
        store.stakeholders.ensure_profile("sh-1", "Jordan").unwrap();

        let base = Utc::now();
        for (i, rec) in ["a", "b", "c"].iter().enumerate() {
            store
                .stakeholders
                .record_interaction(
                    "sh-1",
                    rec,
                    base + chrono::Duration::minutes(i as i64),
                    0.5,
                    0.3,
                )
                .unwrap();
        }

        let profile = store.stakeholders.get_profile("sh-1").unwrap().unwrap();
        assert_eq!(
            profile.interaction_history,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(profile.last_interaction.is_some());
    }

    #[test]
    fn test_first_interaction_seeds_quality() {
        let store = StructuredStore::open_in_memory().unwrap();
        store.stakeholders.ensure_profile("sh-1", "Jordan").unwrap();

        let quality = store
            .stakeholders
            .record_interaction("sh-1", "rec-1", Utc::now(), 0.9, 0.3)
            .unwrap();
        assert!((quality - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_quality_moves_toward_later_sentiment_without_losing_history() {
        let store = StructuredStore::open_in_memory().unwrap();
        store.stakeholders.ensure_profile("sh-1", "Jordan").unwrap();

        let t0 = Utc::now();
        let after_first = store
            .stakeholders
            .record_interaction("sh-1", "rec-1", t0, 0.8, 0.3)
            .unwrap();
        let after_second = store
            .stakeholders
            .record_interaction("sh-1", "rec-2", t0 + chrono::Duration::hours(1), 0.2, 0.3)
            .unwrap();

        assert!(after_second < after_first);
        assert!(after_second > 0.2);

        let profile = store.stakeholders.get_profile("sh-1").unwrap().unwrap();
        assert_eq!(profile.interaction_history.len(), 2);
    }

    #[test]
    fn test_interaction_requires_known_stakeholder() {
        let store = StructuredStore::open_in_memory().unwrap();
        let result = store
            .stakeholders
            .record_interaction("ghost", "rec-1", Utc::now(), 0.5, 0.3);
        assert!(matches!(result, Err(MemoryError::Validation(_))));
    }

    #[test]
    fn test_merge_style_unions_without_duplicates() {
        let store = StructuredStore::open_in_memory().unwrap();
        store.stakeholders.ensure_profile("sh-1", "Jordan").unwrap();

        store
            .stakeholders
            .merge_style("sh-1", &["direct".to_string(), "data-driven".to_string()])
            .unwrap();
        store
            .stakeholders
            .merge_style("sh-1", &["direct".to_string(), "async".to_string()])
            .unwrap();

        let profile = store.stakeholders.get_profile("sh-1").unwrap().unwrap();
        assert_eq!(
            profile.communication_style,
            vec![
                "direct".to_string(),
                "data-driven".to_string(),
                "async".to_string()
            ]
        );
    }
}
