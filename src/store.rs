//! Document store adapter — collection-like access over SQLite.
//!
//! Each collection is one table `(id, doc, created_at, updated_at)` holding a
//! JSON document per row. Filters run server-side through the JSON1
//! functions (`json_extract`, `json_type`), partial writes through
//! `json_patch`, so repositories never scan a whole collection in memory.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, ToSql};
use serde_json::Value;

use crate::error::{Result, WardenError};
use crate::normalize::canonical_instant;

/// Collections this store manages. One table each, created at open.
pub const COLLECTIONS: &[&str] = &["temp_roles", "scheduled_actions", "recurring_actions"];

/// One stored document.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub doc: Value,
}

/// SQLite-backed document store. One live instance per process, shared
/// behind the connection manager.
pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open or create the store, bounding each call by `busy_timeout`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| WardenError::Store(format!("DB open: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| WardenError::Store(format!("busy_timeout: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Create collection tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        for collection in COLLECTIONS {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {collection} (
                    id TEXT PRIMARY KEY,
                    doc TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );"
            ))
            .map_err(|e| WardenError::Store(format!("Migration ({collection}): {e}")))?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WardenError::Store(format!("connection lock poisoned: {e}")))
    }

    fn check_collection(collection: &str) -> Result<()> {
        if COLLECTIONS.contains(&collection) {
            Ok(())
        } else {
            Err(WardenError::Store(format!("unknown collection: {collection}")))
        }
    }

    /// Lightweight round-trip check.
    pub fn ping(&self) -> bool {
        match self.lock() {
            Ok(conn) => conn
                .query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Insert a document. Creation and update timestamps are stamped here.
    pub fn insert(&self, collection: &str, id: &str, doc: &Value) -> Result<()> {
        Self::check_collection(collection)?;
        let now = canonical_instant(Utc::now());
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO {collection} (id, doc, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)"),
            rusqlite::params![id, doc.to_string(), now],
        )
        .map_err(|e| WardenError::Store(format!("Insert ({collection}): {e}")))?;
        Ok(())
    }

    /// Find documents matching a server-side filter over the JSON document.
    /// `where_sql` may reference `doc` via `json_extract`/`json_type`;
    /// `None` returns the whole collection.
    pub fn find(
        &self,
        collection: &str,
        where_sql: Option<&str>,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Document>> {
        Self::check_collection(collection)?;
        let sql = match where_sql {
            Some(filter) => format!("SELECT id, doc FROM {collection} WHERE {filter}"),
            None => format!("SELECT id, doc FROM {collection}"),
        };
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| WardenError::Store(format!("Find ({collection}): {e}")))?;
        let rows = stmt
            .query_map(params, |row| {
                let id: String = row.get(0)?;
                let doc_str: String = row.get(1)?;
                Ok((id, doc_str))
            })
            .map_err(|e| WardenError::Store(format!("Find ({collection}): {e}")))?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, doc_str) = row.map_err(|e| WardenError::Store(format!("Find row: {e}")))?;
            match serde_json::from_str(&doc_str) {
                Ok(doc) => documents.push(Document { id, doc }),
                // Data-shape anomaly: skip, never crash the query.
                Err(e) => tracing::warn!("⚠️ Skipping malformed document {id} in {collection}: {e}"),
            }
        }
        Ok(documents)
    }

    /// Fetch a single document by id.
    pub fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Self::check_collection(collection)?;
        let conn = self.lock()?;
        // Absent row and failed statement are different outcomes: callers
        // treat None as "gone", so an error must never masquerade as it.
        let doc_str: Option<String> = match conn.query_row(
            &format!("SELECT doc FROM {collection} WHERE id = ?1"),
            [id],
            |row| row.get(0),
        ) {
            Ok(doc_str) => Some(doc_str),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(WardenError::Store(format!("FindOne ({collection}): {e}"))),
        };
        match doc_str {
            Some(s) => match serde_json::from_str(&s) {
                Ok(doc) => Ok(Some(Document {
                    id: id.to_string(),
                    doc,
                })),
                Err(e) => {
                    tracing::warn!("⚠️ Malformed document {id} in {collection}: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Merge `patch` into the stored document (`json_patch` semantics: set
    /// fields to update, `null` to remove). Returns whether a row changed.
    pub fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<bool> {
        Self::check_collection(collection)?;
        let now = canonical_instant(Utc::now());
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {collection} SET doc = json_patch(doc, ?1), updated_at = ?2 WHERE id = ?3"
                ),
                rusqlite::params![patch.to_string(), now, id],
            )
            .map_err(|e| WardenError::Store(format!("Update ({collection}): {e}")))?;
        Ok(changed > 0)
    }

    /// Delete by id. Returns whether a row was actually removed.
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Self::check_collection(collection)?;
        let conn = self.lock()?;
        let removed = conn
            .execute(&format!("DELETE FROM {collection} WHERE id = ?1"), [id])
            .map_err(|e| WardenError::Store(format!("Delete ({collection}): {e}")))?;
        Ok(removed > 0)
    }

    /// Document count for a collection.
    pub fn count(&self, collection: &str) -> Result<u64> {
        Self::check_collection(collection)?;
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {collection}"), [], |r| {
                r.get(0)
            })
            .map_err(|e| WardenError::Store(format!("Count ({collection}): {e}")))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store(name: &str) -> (DocumentStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("rolewarden-store-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        let store = DocumentStore::open(&dir.join("test.db"), Duration::from_secs(5)).unwrap();
        (store, dir)
    }

    #[test]
    fn test_insert_find_delete() {
        let (store, dir) = temp_store("crud");
        store
            .insert("temp_roles", "a", &json!({"guildId": "g1", "roleId": "r1"}))
            .unwrap();

        let all = store.find("temp_roles", None, &[]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].doc["guildId"], "g1");

        assert!(store.delete("temp_roles", "a").unwrap());
        // Idempotent: second delete removes nothing
        assert!(!store.delete("temp_roles", "a").unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_server_side_filter() {
        let (store, dir) = temp_store("filter");
        store
            .insert("scheduled_actions", "a", &json!({"executed": false}))
            .unwrap();
        store
            .insert("scheduled_actions", "b", &json!({"executed": true}))
            .unwrap();

        let pending = store
            .find(
                "scheduled_actions",
                Some("json_extract(doc, '$.executed') = 0"),
                &[],
            )
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "a");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_update_patches_fields() {
        let (store, dir) = temp_store("patch");
        store
            .insert("scheduled_actions", "a", &json!({"executed": false, "guildId": "g1"}))
            .unwrap();

        assert!(store
            .update("scheduled_actions", "a", &json!({"executed": true}))
            .unwrap());
        let doc = store.find_one("scheduled_actions", "a").unwrap().unwrap();
        assert_eq!(doc.doc["executed"], true);
        // Untouched fields survive the patch
        assert_eq!(doc.doc["guildId"], "g1");

        // Missing id changes nothing
        assert!(!store
            .update("scheduled_actions", "missing", &json!({"executed": true}))
            .unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_find_one_absent_vs_store_error() {
        let (store, dir) = temp_store("findone");
        store
            .insert("temp_roles", "a", &json!({"guildId": "g1"}))
            .unwrap();
        assert!(store.find_one("temp_roles", "a").unwrap().is_some());
        // Absent row is Ok(None)
        assert!(store.find_one("temp_roles", "missing").unwrap().is_none());

        // A failing statement must surface as an error, not as absence
        let raw = Connection::open(dir.join("test.db")).unwrap();
        raw.execute_batch("DROP TABLE temp_roles;").unwrap();
        assert!(store.find_one("temp_roles", "a").is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_collection_rejected() {
        let (store, dir) = temp_store("unknown");
        assert!(store.insert("nope", "a", &json!({})).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ping() {
        let (store, dir) = temp_store("ping");
        assert!(store.ping());
        std::fs::remove_dir_all(&dir).ok();
    }
}
