//! Initiative persistence with an explicit dependency graph
//!
//! Dependencies are stored as directed edges in `initiative_deps` and the
//! graph is validated to stay acyclic on every write, so object-level
//! ownership cycles cannot form.

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{Initiative, InitiativeStatus};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct InitiativeStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl InitiativeStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| MemoryError::storage(format!("failed to get connection from pool: {}", e)))
    }

    /// Create or update an initiative together with its dependency edges.
    /// Rejected when the initiative is already in a terminal state or when
    /// the new edges would close a cycle.
    pub fn upsert(&self, initiative: &Initiative) -> Result<()> {
        if !(0.0..=1.0).contains(&initiative.progress) {
            return Err(MemoryError::validation(format!(
                "progress {} outside 0.0..=1.0",
                initiative.progress
            )));
        }
        if !(0.0..=1.0).contains(&initiative.health_score) {
            return Err(MemoryError::validation(format!(
                "health_score {} outside 0.0..=1.0",
                initiative.health_score
            )));
        }
        if initiative.dependencies.iter().any(|d| d == &initiative.id) {
            return Err(MemoryError::validation(format!(
                "initiative {} cannot depend on itself",
                initiative.id
            )));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing_status: Option<String> = {
            let mut stmt = tx.prepare("SELECT status FROM initiatives WHERE id = ?1")?;
            let mut rows = stmt.query([&initiative.id])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        if let Some(status_str) = existing_status {
            let status = InitiativeStatus::parse(&status_str).ok_or_else(|| {
                MemoryError::storage(format!("unknown status in database: {}", status_str))
            })?;
            if status.is_terminal() {
                return Err(MemoryError::validation(format!(
                    "initiative {} is {} and immutable",
                    initiative.id, status_str
                )));
            }
        }

        // Cycle check over the edge set as it would look after this write.
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT initiative_id, depends_on FROM initiative_deps WHERE initiative_id != ?1",
            )?;
            let mut rows = stmt.query([&initiative.id])?;
            while let Some(row) = rows.next()? {
                let from: String = row.get(0)?;
                let to: String = row.get(1)?;
                edges.entry(from).or_default().push(to);
            }
        }
        edges.insert(initiative.id.clone(), initiative.dependencies.clone());
        if has_cycle_through(&edges, &initiative.id) {
            return Err(MemoryError::validation(format!(
                "dependencies of initiative {} would create a cycle",
                initiative.id
            )));
        }

        tx.execute(
            "INSERT OR REPLACE INTO initiatives
             (id, name, status, progress, health_score, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &initiative.id,
                &initiative.name,
                initiative.status.as_str(),
                initiative.progress as f64,
                initiative.health_score as f64,
                initiative.last_updated.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "DELETE FROM initiative_deps WHERE initiative_id = ?1",
            [&initiative.id],
        )?;
        for dep in &initiative.dependencies {
            tx.execute(
                "INSERT OR IGNORE INTO initiative_deps (initiative_id, depends_on) VALUES (?1, ?2)",
                params![&initiative.id, dep],
            )?;
        }
        tx.commit()?;
        debug!(
            initiative_id = %initiative.id,
            status = initiative.status.as_str(),
            "initiative upserted"
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Initiative>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, status, progress, health_score, last_updated
             FROM initiatives WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        let mut initiative = match rows.next()? {
            Some(row) => row_to_initiative(row)?,
            None => return Ok(None),
        };
        initiative.dependencies = self.dependencies_of(&conn, id)?;
        Ok(Some(initiative))
    }

    /// All initiatives, dependencies included.
    pub fn list_all(&self) -> Result<Vec<Initiative>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, status, progress, health_score, last_updated
             FROM initiatives ORDER BY last_updated DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut initiatives = Vec::new();
        while let Some(row) = rows.next()? {
            initiatives.push(row_to_initiative(row)?);
        }
        for initiative in &mut initiatives {
            initiative.dependencies = self.dependencies_of(&conn, &initiative.id)?;
        }
        Ok(initiatives)
    }

    /// Non-terminal initiatives with health below the threshold, worst first.
    pub fn list_at_risk(&self, threshold: f32) -> Result<Vec<Initiative>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, status, progress, health_score, last_updated
             FROM initiatives
             WHERE health_score < ?1 AND status NOT IN ('completed', 'abandoned')
             ORDER BY health_score ASC",
        )?;
        let mut rows = stmt.query([threshold as f64])?;
        let mut initiatives = Vec::new();
        while let Some(row) = rows.next()? {
            initiatives.push(row_to_initiative(row)?);
        }
        for initiative in &mut initiatives {
            initiative.dependencies = self.dependencies_of(&conn, &initiative.id)?;
        }
        Ok(initiatives)
    }

    /// Store a freshly derived health score. Terminal initiatives are frozen.
    pub fn set_health(&self, id: &str, health_score: f32, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        if !(0.0..=1.0).contains(&health_score) {
            return Err(MemoryError::validation(format!(
                "health_score {} outside 0.0..=1.0",
                health_score
            )));
        }
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE initiatives SET health_score = ?1, last_updated = ?2
             WHERE id = ?3 AND status NOT IN ('completed', 'abandoned')",
            params![health_score as f64, now.to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(MemoryError::validation(format!(
                "initiative {} missing or terminal",
                id
            )));
        }
        Ok(())
    }

    fn dependencies_of(
        &self,
        conn: &rusqlite::Connection,
        id: &str,
    ) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT depends_on FROM initiative_deps WHERE initiative_id = ?1 ORDER BY depends_on",
        )?;
        let deps = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(deps)
    }
}

/// Depth-first search from `start` over the dependency edges; true when a
/// path leads back to `start`.
fn has_cycle_through(edges: &HashMap<String, Vec<String>>, start: &str) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = edges
        .get(start)
        .map(|deps| deps.iter().map(|s| s.as_str()).collect())
        .unwrap_or_default();

    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(node) {
            stack.extend(next.iter().map(|s| s.as_str()));
        }
    }
    false
}

fn row_to_initiative(row: &Row) -> Result<Initiative> {
    let status_str: String = row.get(2)?;
    let status = InitiativeStatus::parse(&status_str).ok_or_else(|| {
        MemoryError::storage(format!("unknown status in database: {}", status_str))
    })?;

    let last_updated_str: String = row.get(5)?;
    let last_updated = chrono::DateTime::parse_from_rfc3339(&last_updated_str)
        .map_err(|e| MemoryError::storage(format!("failed to parse timestamp: {}", e)))?
        .with_timezone(&chrono::Utc);

    let progress: f64 = row.get(3)?;
    let health_score: f64 = row.get(4)?;

    Ok(Initiative {
        id: row.get(0)?,
        name: row.get(1)?,
        status,
        progress: progress as f32,
        health_score: health_score as f32,
        dependencies: Vec::new(),
        last_updated,
    })
}
