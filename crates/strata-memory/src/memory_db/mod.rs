//! Structured store - canonical SQLite storage for records, initiatives,
//! stakeholders, and decision signals

pub mod schema;
pub mod migration;
pub mod record_store;
pub mod initiative_store;
pub mod stakeholder_store;
pub mod signal_store;

pub use schema::*;
pub use migration::MigrationManager;
pub use record_store::RecordStore;
pub use initiative_store::InitiativeStore;
pub use stakeholder_store::StakeholderStore;
pub use signal_store::SignalStore;

use crate::error::{MemoryError, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Canonical store. Owns the connection pool and exposes one sub-store per
/// entity family. Everything else in the engine treats this store as the
/// source of truth; the vector index and analytics store are derived from it.
pub struct StructuredStore {
    pub records: RecordStore,
    pub initiatives: InitiativeStore,
    pub stakeholders: StakeholderStore,
    pub signals: SignalStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl StructuredStore {
    /// Open (or create) the canonical database at the given path and bring
    /// its schema up to date.
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Opening structured store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(MemoryError::storage)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| MemoryError::storage(format!("failed to create connection pool: {}", e)))?;

        {
            let mut conn = pool.get()?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        let pool = Arc::new(pool);
        info!("Structured store initialized successfully");
        Ok(Self::from_pool(pool))
    }

    /// Open a private in-memory store. A named shared-cache URI keeps every
    /// pooled connection on the same database.
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:strata-mem-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let manager = SqliteConnectionManager::file(&uri)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        // The shared in-memory database lives as long as one connection stays
        // open, so the pool keeps an idle connection around.
        let pool = Pool::builder()
            .max_size(5)
            .min_idle(Some(1))
            .build(manager)
            .map_err(|e| MemoryError::storage(format!("failed to create connection pool: {}", e)))?;
        {
            let conn = pool.get()?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        let pool = Arc::new(pool);
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self {
            records: RecordStore::new(Arc::clone(&pool)),
            initiatives: InitiativeStore::new(Arc::clone(&pool)),
            stakeholders: StakeholderStore::new(Arc::clone(&pool)),
            signals: SignalStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    /// Row counts and file size.
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Age out old conversation records. Returns the number deleted.
    pub fn cleanup_old_records(&self, older_than_days: i32) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let mut migrator = migration::MigrationManager::new(&mut conn);
        Ok(migrator.cleanup_old_records(older_than_days)?)
    }

    /// Run ANALYZE / vacuum / integrity maintenance.
    pub fn run_maintenance(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        Ok(migration::run_maintenance(&mut conn)?)
    }
}

impl Drop for StructuredStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_shares_one_database_across_connections() {
        let store = StructuredStore::open_in_memory().unwrap();
        // Writes through one sub-store must be visible to stats taken over a
        // different pooled connection.
        let record = ContextRecord {
            id: "rec-1".to_string(),
            layer: MemoryLayer::Conversation,
            timestamp: chrono::Utc::now(),
            text: "pool visibility check".to_string(),
            tags: vec![],
            metadata: Default::default(),
        };
        store.records.put(&record).unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_records, 1);
    }

    #[test]
    fn test_open_on_disk_applies_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = StructuredStore::open(&path).unwrap();
            assert_eq!(store.get_stats().unwrap().total_records, 0);
        }
        // Reopening an existing database must be a no-op migration-wise.
        let store = StructuredStore::open(&path).unwrap();
        assert_eq!(store.get_stats().unwrap().total_records, 0);
    }

    #[test]
    fn test_cleanup_spares_non_conversation_layers() {
        let store = StructuredStore::open_in_memory().unwrap();
        let old = chrono::Utc::now() - chrono::Duration::days(400);
        for (id, layer) in [
            ("old-conv", MemoryLayer::Conversation),
            ("old-strat", MemoryLayer::Strategic),
        ] {
            store
                .records
                .put(&ContextRecord {
                    id: id.to_string(),
                    layer,
                    timestamp: old,
                    text: "aged".to_string(),
                    tags: vec![],
                    metadata: Default::default(),
                })
                .unwrap();
        }

        let deleted = store.cleanup_old_records(365).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.records.get("old-conv").unwrap().is_none());
        assert!(store.records.get("old-strat").unwrap().is_some());
    }
}
