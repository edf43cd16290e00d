//! Database migration system

use rusqlite::{Connection, OptionalExtension, Result};
use std::path::Path;
use tracing::{error, info, warn};

use crate::memory_db::schema;

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    /// Create a new migration manager
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Initialize database with current schema
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing memory database schema...");

        // Create schema version table if it doesn't exist
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)?;

        Ok(())
    }

    /// Apply all pending migrations
    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        let migrations = get_migrations();

        for (version, migration_sql) in migrations.iter() {
            if *version > current_version {
                info!("Applying migration {}...", version);

                let tx = self.conn.transaction()?;

                if let Err(e) = tx.execute_batch(migration_sql) {
                    error!("Failed to apply migration {}: {}", version, e);
                    return Err(e);
                }

                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [version],
                )?;

                tx.commit()?;

                info!("Migration {} applied successfully", version);
            }
        }

        Ok(())
    }

    /// Retention sweep. Only conversation-layer records age out; strategic,
    /// stakeholder, learning, and organizational memory is retained
    /// indefinitely.
    pub fn cleanup_old_records(&mut self, older_than_days: i32) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days as i64);
        let cutoff_str = cutoff.to_rfc3339();

        let deleted = self.conn.execute(
            "DELETE FROM context_records WHERE layer = 'conversation' AND timestamp < ?1",
            [&cutoff_str],
        )?;

        info!("Cleaned up {} old conversation records", deleted);

        if deleted > 0 {
            self.conn.execute_batch("VACUUM")?;
            info!("Database vacuum completed");
        }

        Ok(deleted)
    }

    /// Get current schema version
    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }

    /// Check if a specific migration has been applied
    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

/// Get all migration SQL scripts
fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_add_decision_signals.sql")),
        (3, include_str!("migrations/003_add_retrieval_indexes.sql")),
    ]
}

/// Get row counts and file size from a connection. Read-only, safe to call
/// while writers hold the pool.
pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn get_table_count(conn: &Connection, table_name: &str) -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| {
            row.get(0)
        })
        .or_else(|e| {
            warn!("Failed to get count from table {}: {}", table_name, e);
            Ok(0)
        })
    }

    let total_records = get_table_count(conn, "context_records")?;
    let total_initiatives = get_table_count(conn, "initiatives")?;
    let total_stakeholders = get_table_count(conn, "stakeholders")?;
    let total_interactions = get_table_count(conn, "stakeholder_interactions")?;
    let total_patterns = get_table_count(conn, "decision_patterns")?;
    let total_changes = get_table_count(conn, "organizational_changes")?;

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        total_records,
        total_initiatives,
        total_stakeholders,
        total_interactions,
        total_patterns,
        total_changes,
        database_size_bytes,
    })
}

/// Get database statistics with connection creation
pub fn get_database_stats_from_path(db_path: &Path) -> Result<schema::DatabaseStats> {
    let conn = Connection::open(db_path)?;
    get_database_stats(&conn)
}

/// Run database maintenance tasks
pub fn run_maintenance(conn: &mut Connection) -> Result<()> {
    info!("Running database maintenance...");

    conn.execute_batch("ANALYZE")?;
    conn.execute_batch("PRAGMA incremental_vacuum(100)")?;
    conn.execute_batch("PRAGMA integrity_check")?;

    info!("Database maintenance completed");
    Ok(())
}
