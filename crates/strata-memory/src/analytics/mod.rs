//! Analytics store - derived aggregates in a sidecar SQLite file
//!
//! Everything in here is recomputable from the structured store, so a lost
//! or corrupt analytics file is an inconvenience, not data loss. Callers
//! treat `AnalyticsUnavailable` as a soft failure: log it and move on.

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::MemoryLayer;
use crate::memory_db::StructuredStore;
use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const ANALYTICS_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS aggregates (
    key TEXT PRIMARY KEY,
    value REAL NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE TABLE IF NOT EXISTS layer_activity (
    layer TEXT NOT NULL,
    day TEXT NOT NULL,
    record_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (layer, day)
);
";

pub struct AnalyticsStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl AnalyticsStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Opening analytics store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(MemoryError::analytics)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder().max_size(4).build(manager).map_err(|e| {
            MemoryError::analytics(format!("failed to create connection pool: {}", e))
        })?;
        Self::from_pool(Arc::new(pool))
    }

    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:strata-analytics-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let manager = SqliteConnectionManager::file(&uri).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(2)
            .min_idle(Some(1))
            .build(manager)
            .map_err(|e| {
                MemoryError::analytics(format!("failed to create connection pool: {}", e))
            })?;
        Self::from_pool(Arc::new(pool))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Result<Self> {
        {
            let conn = pool
                .get()
                .map_err(|e| MemoryError::analytics(format!("pool: {}", e)))?;
            conn.execute_batch(ANALYTICS_SCHEMA_SQL)
                .map_err(MemoryError::analytics)?;
        }
        Ok(Self { pool })
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            MemoryError::analytics(format!("failed to get connection from pool: {}", e))
        })
    }

    pub fn upsert_aggregate(&self, key: &str, value: f64) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO aggregates (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )
        .map_err(MemoryError::analytics)?;
        Ok(())
    }

    pub fn get_aggregate(&self, key: &str) -> Result<Option<f64>> {
        let conn = self.get_conn()?;
        match conn.query_row("SELECT value FROM aggregates WHERE key = ?1", [key], |row| {
            row.get(0)
        }) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::analytics(e)),
        }
    }

    /// All aggregates whose key starts with `prefix`, sorted by key.
    /// An empty prefix returns everything.
    pub fn aggregates_with_prefix(&self, prefix: &str) -> Result<Vec<(String, f64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM aggregates WHERE key LIKE ?1 || '%' ORDER BY key ASC")
            .map_err(MemoryError::analytics)?;
        let rows = stmt
            .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(MemoryError::analytics)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(MemoryError::analytics)?);
        }
        Ok(out)
    }

    /// Count one record written to `layer` on the day of `at`.
    pub fn record_activity(&self, layer: MemoryLayer, at: DateTime<Utc>) -> Result<()> {
        let day = at.format("%Y-%m-%d").to_string();
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO layer_activity (layer, day, record_count) VALUES (?1, ?2, 1)
             ON CONFLICT(layer, day) DO UPDATE SET record_count = record_count + 1",
            params![layer.as_str(), day],
        )
        .map_err(MemoryError::analytics)?;
        Ok(())
    }

    /// Per-day write counts for `layer` over the trailing `days` days,
    /// oldest first. Days with no writes are absent.
    pub fn activity_trend(
        &self,
        layer: MemoryLayer,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>> {
        let cutoff = (now - Duration::days(days as i64))
            .format("%Y-%m-%d")
            .to_string();
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT day, record_count FROM layer_activity
                 WHERE layer = ?1 AND day >= ?2 ORDER BY day ASC",
            )
            .map_err(MemoryError::analytics)?;
        let rows = stmt
            .query_map(params![layer.as_str(), cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(MemoryError::analytics)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(MemoryError::analytics)?);
        }
        Ok(out)
    }

    /// Recompute every aggregate and the activity table from the canonical
    /// store. Returns the number of aggregate keys written.
    pub fn rebuild_from(&self, store: &StructuredStore) -> Result<usize> {
        let records = store.records.all()?;
        let initiatives = store.initiatives.list_all()?;
        let stakeholders = store.stakeholders.list_profiles()?;
        let effectiveness = store.signals.framework_effectiveness()?;

        let mut aggregates: Vec<(String, f64)> = Vec::new();
        aggregates.push(("records.total".to_string(), records.len() as f64));
        for layer in MemoryLayer::ALL {
            let count = records.iter().filter(|r| r.layer == layer).count();
            aggregates.push((format!("records.{}", layer.as_str()), count as f64));
        }

        aggregates.push(("initiatives.total".to_string(), initiatives.len() as f64));
        if !initiatives.is_empty() {
            let mean = initiatives.iter().map(|i| i.health_score as f64).sum::<f64>()
                / initiatives.len() as f64;
            aggregates.push(("initiatives.health_mean".to_string(), mean));
        }
        let at_risk = initiatives
            .iter()
            .filter(|i| i.status == crate::memory_db::schema::InitiativeStatus::AtRisk)
            .count();
        aggregates.push(("initiatives.at_risk".to_string(), at_risk as f64));

        aggregates.push(("stakeholders.total".to_string(), stakeholders.len() as f64));
        if !stakeholders.is_empty() {
            let mean = stakeholders
                .iter()
                .map(|s| s.relationship_quality as f64)
                .sum::<f64>()
                / stakeholders.len() as f64;
            aggregates.push(("stakeholders.quality_mean".to_string(), mean));
        }

        for (tag, mean_outcome, observed, applied) in &effectiveness {
            aggregates.push((format!("framework.{}.mean_outcome", tag), *mean_outcome as f64));
            aggregates.push((format!("framework.{}.observed", tag), *observed as f64));
            aggregates.push((format!("framework.{}.applied", tag), *applied as f64));
        }

        let mut activity: BTreeMap<(String, String), i64> = BTreeMap::new();
        for record in &records {
            let key = (
                record.layer.as_str().to_string(),
                record.timestamp.format("%Y-%m-%d").to_string(),
            );
            *activity.entry(key).or_insert(0) += 1;
        }

        let written = aggregates.len();
        let now = Utc::now().to_rfc3339();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().map_err(MemoryError::analytics)?;
        tx.execute("DELETE FROM aggregates", [])
            .map_err(MemoryError::analytics)?;
        tx.execute("DELETE FROM layer_activity", [])
            .map_err(MemoryError::analytics)?;
        for (key, value) in aggregates {
            tx.execute(
                "INSERT INTO aggregates (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, &now],
            )
            .map_err(MemoryError::analytics)?;
        }
        for ((layer, day), count) in activity {
            tx.execute(
                "INSERT INTO layer_activity (layer, day, record_count) VALUES (?1, ?2, ?3)",
                params![layer, day, count],
            )
            .map_err(MemoryError::analytics)?;
        }
        tx.commit().map_err(MemoryError::analytics)?;

        info!("Rebuilt analytics: {} aggregate keys", written);
        Ok(written)
    }
}
