//! Canonical ContextRecord persistence

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ContextRecord, MemoryLayer, RecordFilter};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row, TransactionBehavior};
use std::sync::Arc;

pub struct RecordStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl RecordStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| MemoryError::storage(format!("failed to get connection from pool: {}", e)))
    }

    /// Write a record. Idempotent on `id`: replaying the same write leaves a
    /// single row. The record's layer is immutable; re-putting an existing id
    /// under a different layer is rejected before anything is written.
    pub fn put(&self, record: &ContextRecord) -> Result<String> {
        let tags_json = serde_json::to_string(&record.tags)
            .map_err(|e| MemoryError::validation(format!("unserializable tags: {}", e)))?;
        let metadata_json = serde_json::to_string(&record.metadata)
            .map_err(|e| MemoryError::validation(format!("unserializable metadata: {}", e)))?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing_layer: Option<String> = {
            let mut stmt = tx.prepare("SELECT layer FROM context_records WHERE id = ?1")?;
            let mut rows = stmt.query([&record.id])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        if let Some(layer_str) = existing_layer {
            if layer_str != record.layer.as_str() {
                return Err(MemoryError::validation(format!(
                    "record {} already exists in layer {}, layer is immutable",
                    record.id, layer_str
                )));
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO context_records (id, layer, timestamp, text, tags, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &record.id,
                record.layer.as_str(),
                record.timestamp.to_rfc3339(),
                &record.text,
                tags_json,
                metadata_json,
            ],
        )?;
        tx.commit()?;
        Ok(record.id.clone())
    }

    pub fn get(&self, id: &str) -> Result<Option<ContextRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, layer, timestamp, text, tags, metadata
             FROM context_records WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_record(row)?))
        } else {
            Ok(None)
        }
    }

    /// Filtered query, newest first. Tag filters match against the JSON tag
    /// array, which is exact for tags because they are stored quoted.
    pub fn query(
        &self,
        filter: &RecordFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ContextRecord>> {
        let mut sql = String::from(
            "SELECT id, layer, timestamp, text, tags, metadata
             FROM context_records WHERE 1=1",
        );
        let mut where_params: Vec<String> = Vec::new();

        if let Some(layer) = filter.layer {
            sql.push_str(" AND layer = ?");
            where_params.push(layer.as_str().to_string());
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            where_params.push(since.to_rfc3339());
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND timestamp <= ?");
            where_params.push(until.to_rfc3339());
        }
        if let Some(ref needle) = filter.text_like {
            sql.push_str(" AND text LIKE ?");
            where_params.push(format!("%{}%", needle));
        }
        for tag in &filter.tags_all {
            sql.push_str(" AND tags LIKE ?");
            where_params.push(format!("%\"{}\"%", tag));
        }
        if !filter.tags_any.is_empty() {
            let clauses = vec!["tags LIKE ?"; filter.tags_any.len()].join(" OR ");
            sql.push_str(&format!(" AND ({})", clauses));
            for tag in &filter.tags_any {
                where_params.push(format!("%\"{}\"%", tag));
            }
        }

        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;

        let limit_i64 = limit as i64;
        let offset_i64 = offset as i64;
        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for p in &where_params {
            params.push(p);
        }
        params.push(&limit_i64);
        params.push(&offset_i64);

        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    /// Explicit forget/redaction path. Returns whether a row was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM context_records WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Every record, oldest first. Used by index and analytics rebuilds.
    pub fn all(&self) -> Result<Vec<ContextRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, layer, timestamp, text, tags, metadata
             FROM context_records ORDER BY timestamp ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &Row) -> Result<ContextRecord> {
    let layer_str: String = row.get(1)?;
    let layer = MemoryLayer::parse(&layer_str).ok_or_else(|| {
        MemoryError::storage(format!("unknown layer value in database: {}", layer_str))
    })?;

    let timestamp_str: String = row.get(2)?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp_str)
        .map_err(|e| MemoryError::storage(format!("failed to parse timestamp: {}", e)))?
        .with_timezone(&chrono::Utc);

    let tags_json: String = row.get(4)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| MemoryError::storage(format!("corrupt tags column: {}", e)))?;

    let metadata_json: String = row.get(5)?;
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| MemoryError::storage(format!("corrupt metadata column: {}", e)))?;

    Ok(ContextRecord {
        id: row.get(0)?,
        layer,
        timestamp,
        text: row.get(3)?,
        tags,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::StructuredStore;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(id: &str, layer: MemoryLayer, text: &str, tags: &[&str]) -> ContextRecord {
        ContextRecord {
            id: id.to_string(),
            layer,
            timestamp: Utc::now(),
            text: text.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = StructuredStore::open_in_memory().unwrap();
        let rec = record("r1", MemoryLayer::Strategic, "quarterly planning", &[]);

        store.records.put(&rec).unwrap();
        store.records.put(&rec).unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_records, 1);
    }

    #[test]
    fn test_put_replaces_content_for_same_id() {
        let store = StructuredStore::open_in_memory().unwrap();
        let mut rec = record("r1", MemoryLayer::Conversation, "first draft", &[]);
        store.records.put(&rec).unwrap();

        rec.text = "second draft".to_string();
        store.records.put(&rec).unwrap();

        let fetched = store.records.get("r1").unwrap().unwrap();
        assert_eq!(fetched.text, "second draft");
    }

    #[test]
    fn test_layer_is_immutable() {
        let store = StructuredStore::open_in_memory().unwrap();
        let rec = record("r1", MemoryLayer::Conversation, "hello", &[]);
        store.records.put(&rec).unwrap();

        let mut moved = rec.clone();
        moved.layer = MemoryLayer::Strategic;
        match store.records.put(&moved) {
            Err(MemoryError::Validation(msg)) => assert!(msg.contains("immutable")),
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }

        // Original row untouched
        let fetched = store.records.get("r1").unwrap().unwrap();
        assert_eq!(fetched.layer, MemoryLayer::Conversation);
    }

    #[test]
    fn test_query_by_layer_and_tags() {
        let store = StructuredStore::open_in_memory().unwrap();
        store
            .records
            .put(&record("a", MemoryLayer::Strategic, "roadmap", &["planning", "q3"]))
            .unwrap();
        store
            .records
            .put(&record("b", MemoryLayer::Strategic, "budget", &["planning"]))
            .unwrap();
        store
            .records
            .put(&record("c", MemoryLayer::Conversation, "chat", &["planning"]))
            .unwrap();

        let filter = RecordFilter {
            layer: Some(MemoryLayer::Strategic),
            tags_all: vec!["planning".to_string()],
            ..Default::default()
        };
        let hits = store.records.query(&filter, 10, 0).unwrap();
        assert_eq!(hits.len(), 2);

        let filter = RecordFilter {
            tags_any: vec!["q3".to_string(), "absent".to_string()],
            ..Default::default()
        };
        let hits = store.records.query(&filter, 10, 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn test_query_time_window_and_order() {
        let store = StructuredStore::open_in_memory().unwrap();
        let base = Utc::now();
        for (id, hours_ago) in [("old", 48), ("mid", 24), ("new", 1)] {
            let mut rec = record(id, MemoryLayer::Conversation, id, &[]);
            rec.timestamp = base - chrono::Duration::hours(hours_ago);
            store.records.put(&rec).unwrap();
        }

        let filter = RecordFilter {
            since: Some(base - chrono::Duration::hours(30)),
            ..Default::default()
        };
        let hits = store.records.query(&filter, 10, 0).unwrap();
        let ids: Vec<&str> = hits.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn test_delete_reports_whether_row_existed() {
        let store = StructuredStore::open_in_memory().unwrap();
        store
            .records
            .put(&record("gone", MemoryLayer::Learning, "to forget", &[]))
            .unwrap();

        assert!(store.records.delete("gone").unwrap());
        assert!(!store.records.delete("gone").unwrap());
        assert!(store.records.get("gone").unwrap().is_none());
    }

    #[test]
    fn test_metadata_round_trip() {
        let store = StructuredStore::open_in_memory().unwrap();
        let mut rec = record("m", MemoryLayer::Stakeholder, "sync with lead", &[]);
        rec.metadata
            .insert("stakeholder_id".to_string(), "sh-42".to_string());
        rec.metadata.insert("channel".to_string(), "1:1".to_string());
        store.records.put(&rec).unwrap();

        let fetched = store.records.get("m").unwrap().unwrap();
        assert_eq!(fetched.metadata.get("stakeholder_id").unwrap(), "sh-42");
        assert_eq!(fetched.metadata.len(), 2);
    }
}
