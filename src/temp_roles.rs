//! Temporary role grant repository.
//!
//! One document may fan out a single role/expiry to several users; callers
//! see one logical entry per user. Only this module touches the
//! `temp_roles` collection or its cache.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::cache::RepoCache;
use crate::connection::ConnectionManager;
use crate::model::{TempRoleEntry, TemporaryRoleGrant};
use crate::normalize::now_params;
use crate::store::DocumentStore;

const COLLECTION: &str = "temp_roles";

/// Due filter: canonical text compares lexically, legacy integers compare as
/// epoch millis, and any non-canonical text is returned as a candidate for
/// in-process normalization (a raw lexical compare against it is unsafe).
/// Stalled grants are never due.
const DUE_FILTER: &str = "json_extract(doc, '$.stalled') IS NOT 1 AND \
    CASE json_type(doc, '$.expiresAt') \
      WHEN 'integer' THEN json_extract(doc, '$.expiresAt') <= ?2 \
      WHEN 'text' THEN (json_extract(doc, '$.expiresAt') <= ?1 \
                        OR json_extract(doc, '$.expiresAt') NOT GLOB '[0-9][0-9][0-9][0-9]-*') \
      ELSE 0 \
    END";

pub struct TempRoleRepository {
    conn: Arc<ConnectionManager>,
    cache: RepoCache<TempRoleEntry>,
}

impl TempRoleRepository {
    pub fn new(conn: Arc<ConnectionManager>) -> Self {
        Self {
            conn,
            cache: RepoCache::new(),
        }
    }

    fn store(&self) -> Option<Arc<DocumentStore>> {
        let store = self.conn.store();
        if store.is_none() {
            tracing::warn!("⚠️ temp_roles: store unavailable");
        }
        store
    }

    /// Grant one role to several users until `expires_at`, stored as a
    /// single fan-out document. Returns `false` (logged) on any failure.
    pub fn add_multiple(
        &self,
        guild_id: &str,
        user_ids: &[String],
        role_id: &str,
        expires_at: DateTime<Utc>,
        notify_expiry: bool,
    ) -> bool {
        if user_ids.is_empty() {
            tracing::warn!("⚠️ temp_roles: refusing grant with no users (guild {guild_id})");
            return false;
        }
        if expires_at <= Utc::now() {
            tracing::warn!(
                "⚠️ temp_roles: refusing grant with expiry in the past (guild {guild_id}, role {role_id})"
            );
            return false;
        }
        let Some(store) = self.store() else { return false };
        let grant = TemporaryRoleGrant::new(
            guild_id,
            user_ids.to_vec(),
            role_id,
            expires_at,
            notify_expiry,
        );
        match store.insert(COLLECTION, &grant.id, &grant.to_doc()) {
            Ok(()) => {
                self.cache.clear();
                tracing::info!(
                    "⏳ Temporary grant added: role {role_id} for {} user(s) in guild {guild_id}",
                    user_ids.len()
                );
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: insert failed: {e}");
                false
            }
        }
    }

    /// All grants, one logical entry per user, keyed `guild:user:role`.
    /// Empty map (not an error) when nothing is found or the store is down.
    pub fn get_all(&self) -> HashMap<String, TempRoleEntry> {
        if let Some(cached) = self.cache.get_all() {
            return cached;
        }
        let Some(store) = self.store() else { return HashMap::new() };
        let docs = match store.find(COLLECTION, None, &[]) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: find failed: {e}");
                return HashMap::new();
            }
        };
        let mut entries = HashMap::new();
        for document in docs {
            let Some(grant) = TemporaryRoleGrant::from_doc(&document.id, &document.doc) else {
                tracing::warn!("⚠️ temp_roles: skipping malformed grant {}", document.id);
                continue;
            };
            for user_id in &grant.user_ids {
                let entry = TempRoleEntry {
                    doc_id: grant.id.clone(),
                    guild_id: grant.guild_id.clone(),
                    user_id: user_id.clone(),
                    role_id: grant.role_id.clone(),
                    expires_at: grant.expires_at,
                    notify_expiry: grant.notify_expiry,
                };
                entries.insert(entry.key(), entry);
            }
        }
        self.cache.prime(entries.clone());
        entries
    }

    /// Grants for a single guild, keyed `guild:user:role`.
    pub fn get_by_guild(&self, guild_id: &str) -> HashMap<String, TempRoleEntry> {
        self.get_all()
            .into_iter()
            .filter(|(_, entry)| entry.guild_id == guild_id)
            .collect()
    }

    /// Grants whose expiry has passed, filtered server-side and re-checked
    /// after normalization.
    pub fn find_due(&self, now: DateTime<Utc>) -> Vec<TemporaryRoleGrant> {
        let Some(store) = self.store() else { return Vec::new() };
        let (now_text, now_millis, _) = now_params(now);
        let params: [&dyn rusqlite::ToSql; 2] = [&now_text, &now_millis];
        let docs = match store.find(COLLECTION, Some(DUE_FILTER), &params) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: due query failed: {e}");
                return Vec::new();
            }
        };
        docs.iter()
            .filter_map(|d| TemporaryRoleGrant::from_doc(&d.id, &d.doc))
            .filter(|g| g.is_due(now))
            .collect()
    }

    /// Remove specific users from a fan-out grant, deleting the document
    /// when the set empties. Used for the explicit revoke path and for
    /// partial removal success in the scheduler.
    pub fn remove_users(&self, id: &str, user_ids: &[String]) -> bool {
        let Some(store) = self.store() else { return false };
        let grant = match store.find_one(COLLECTION, id) {
            Ok(Some(document)) => TemporaryRoleGrant::from_doc(&document.id, &document.doc),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: read for removal failed: {e}");
                return false;
            }
        };
        let Some(grant) = grant else {
            // Already gone: nothing to remove, not an error
            return true;
        };
        let remaining: Vec<String> = grant
            .user_ids
            .iter()
            .filter(|u| !user_ids.contains(u))
            .cloned()
            .collect();
        let result = if remaining.is_empty() {
            store.delete(COLLECTION, id).map(|_| true)
        } else {
            store.update(COLLECTION, id, &json!({ "userIds": remaining }))
        };
        match result {
            Ok(_) => {
                self.cache.clear();
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: removal write failed: {e}");
                false
            }
        }
    }

    /// Explicit revoke: drop one user's grant on a role. Identity is the
    /// (guild, role) pair plus membership in the user set.
    pub fn remove_user(&self, guild_id: &str, user_id: &str, role_id: &str) -> bool {
        let Some(store) = self.store() else { return false };
        let params: [&dyn rusqlite::ToSql; 2] = [&guild_id, &role_id];
        let docs = match store.find(
            COLLECTION,
            Some("json_extract(doc, '$.guildId') = ?1 AND json_extract(doc, '$.roleId') = ?2"),
            &params,
        ) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: revoke query failed: {e}");
                return false;
            }
        };
        let mut ok = true;
        for document in docs {
            let Some(grant) = TemporaryRoleGrant::from_doc(&document.id, &document.doc) else {
                continue;
            };
            if grant.user_ids.iter().any(|u| u == user_id) {
                ok &= self.remove_users(&grant.id, &[user_id.to_string()]);
            }
        }
        ok
    }

    /// Delete a grant document. Idempotent: deleting an absent id is a
    /// no-op success, and only an actual removal invalidates the cache.
    pub fn delete(&self, id: &str) -> bool {
        let Some(store) = self.store() else { return false };
        match store.delete(COLLECTION, id) {
            Ok(removed) => {
                if removed {
                    self.cache.clear();
                }
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: delete failed: {e}");
                false
            }
        }
    }

    /// Count one failed removal attempt. At `max_attempts` the grant is
    /// stalled: excluded from due queries and surfaced for manual
    /// intervention instead of retried forever.
    pub fn record_removal_failure(&self, id: &str, max_attempts: u32) -> bool {
        let Some(store) = self.store() else { return false };
        let grant = match store.find_one(COLLECTION, id) {
            Ok(Some(document)) => TemporaryRoleGrant::from_doc(&document.id, &document.doc),
            _ => None,
        };
        let Some(grant) = grant else { return false };
        let attempts = grant.removal_attempts + 1;
        let stalled = attempts >= max_attempts;
        let patch = json!({ "removalAttempts": attempts, "stalled": stalled });
        match store.update(COLLECTION, id, &patch) {
            Ok(changed) => {
                self.cache.clear();
                if stalled {
                    tracing::error!(
                        "🛑 Temporary grant {id} stalled after {attempts} failed removals \
                         (guild {}, role {}): manual intervention required",
                        grant.guild_id,
                        grant.role_id
                    );
                }
                changed
            }
            Err(e) => {
                tracing::warn!("⚠️ temp_roles: failure bookkeeping failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use serde_json::json;

    async fn repo(name: &str) -> (TempRoleRepository, Arc<ConnectionManager>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("rolewarden-temp-roles-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        let conn = Arc::new(ConnectionManager::new(StorageConfig {
            db_path: dir.join("test.db").to_string_lossy().into_owned(),
            ..Default::default()
        }));
        conn.connect().await.unwrap();
        (TempRoleRepository::new(conn.clone()), conn, dir)
    }

    fn users(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_multiple_fans_out_in_get_all() {
        let (repo, _conn, dir) = repo("fanout").await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        assert!(repo.add_multiple("g1", &users(&["a", "b", "c"]), "r1", expires, false));

        let all = repo.get_all();
        assert_eq!(all.len(), 3);
        let entry = &all["g1:b:r1"];
        assert_eq!(entry.role_id, "r1");
        assert_eq!(entry.expires_at.timestamp_millis(), expires.timestamp_millis());
        // All three share one backing document
        assert_eq!(all["g1:a:r1"].doc_id, all["g1:c:r1"].doc_id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_rejects_past_expiry_and_empty_users() {
        let (repo, _conn, dir) = repo("invalid").await;
        let past = Utc::now() - chrono::Duration::seconds(1);
        assert!(!repo.add_multiple("g1", &users(&["a"]), "r1", past, false));
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(!repo.add_multiple("g1", &[], "r1", future, false));
        assert!(repo.get_all().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_find_due_excludes_future_and_stalled() {
        let (repo, conn, dir) = repo("due").await;
        let store = conn.store().unwrap();
        // Insert directly so past expiries are representable
        let due = TemporaryRoleGrant::new(
            "g1",
            users(&["a"]),
            "r1",
            Utc::now() - chrono::Duration::seconds(5),
            false,
        );
        store.insert("temp_roles", &due.id, &due.to_doc()).unwrap();
        let future = TemporaryRoleGrant::new(
            "g1",
            users(&["b"]),
            "r2",
            Utc::now() + chrono::Duration::hours(1),
            false,
        );
        store.insert("temp_roles", &future.id, &future.to_doc()).unwrap();
        let mut stalled = TemporaryRoleGrant::new(
            "g1",
            users(&["c"]),
            "r3",
            Utc::now() - chrono::Duration::hours(1),
            false,
        );
        stalled.stalled = true;
        store.insert("temp_roles", &stalled.id, &stalled.to_doc()).unwrap();

        let found = repo.find_due(Utc::now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_find_due_normalizes_legacy_epoch_millis() {
        let (repo, conn, dir) = repo("legacy").await;
        let store = conn.store().unwrap();
        store
            .insert(
                "temp_roles",
                "legacy1",
                &json!({
                    "guildId": "g1",
                    "userId": "a",
                    "roleId": "r1",
                    "expiresAt": 1_700_000_000_000_i64,
                }),
            )
            .unwrap();

        let found = repo.find_due(Utc::now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_ids, users(&["a"]));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_remove_users_partial_then_empty() {
        let (repo, _conn, dir) = repo("partial").await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        repo.add_multiple("g1", &users(&["a", "b"]), "r1", expires, false);
        let doc_id = repo.get_all()["g1:a:r1"].doc_id.clone();

        assert!(repo.remove_users(&doc_id, &users(&["a"])));
        let all = repo.get_all();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("g1:b:r1"));

        assert!(repo.remove_users(&doc_id, &users(&["b"])));
        assert!(repo.get_all().is_empty());
        // Document gone: removing again is a no-op success
        assert!(repo.remove_users(&doc_id, &users(&["b"])));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_remove_users_reports_failure_on_broken_store() {
        let (repo, _conn, dir) = repo("broken").await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        repo.add_multiple("g1", &users(&["a"]), "r1", expires, false);
        let doc_id = repo.get_all()["g1:a:r1"].doc_id.clone();

        // Break the backing table; the grant is still logically present,
        // so a removal that cannot read it must not claim success
        let raw = rusqlite::Connection::open(dir.join("test.db")).unwrap();
        raw.execute_batch("DROP TABLE temp_roles;").unwrap();
        assert!(!repo.remove_users(&doc_id, &users(&["a"])));
        assert!(!repo.remove_user("g1", "a", "r1"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_remove_user_by_identity() {
        let (repo, _conn, dir) = repo("revoke").await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        repo.add_multiple("g1", &users(&["a", "b"]), "r1", expires, false);

        assert!(repo.remove_user("g1", "a", "r1"));
        let all = repo.get_all();
        assert!(!all.contains_key("g1:a:r1"));
        assert!(all.contains_key("g1:b:r1"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (repo, _conn, dir) = repo("delete").await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        repo.add_multiple("g1", &users(&["a"]), "r1", expires, false);
        let doc_id = repo.get_all()["g1:a:r1"].doc_id.clone();

        assert!(repo.delete(&doc_id));
        assert!(repo.delete(&doc_id));
        assert!(repo.get_all().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_removal_failures_stall_at_cap() {
        let (repo, conn, dir) = repo("stall").await;
        let store = conn.store().unwrap();
        let grant = TemporaryRoleGrant::new(
            "g1",
            users(&["a"]),
            "r1",
            Utc::now() - chrono::Duration::seconds(5),
            false,
        );
        store.insert("temp_roles", &grant.id, &grant.to_doc()).unwrap();

        assert!(repo.record_removal_failure(&grant.id, 2));
        assert_eq!(repo.find_due(Utc::now()).len(), 1);
        assert!(repo.record_removal_failure(&grant.id, 2));
        // Stalled now: excluded from due queries
        assert!(repo.find_due(Utc::now()).is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_reads_consistent_after_write() {
        let (repo, _conn, dir) = repo("cache").await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        repo.add_multiple("g1", &users(&["a"]), "r1", expires, false);
        assert_eq!(repo.get_all().len(), 1);

        // Write-after-read must invalidate the primed cache
        repo.add_multiple("g1", &users(&["b"]), "r2", expires, false);
        assert_eq!(repo.get_all().len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_store_down_fails_soft() {
        let (repo, conn, dir) = repo("down").await;
        conn.shutdown();
        assert!(repo.get_all().is_empty());
        assert!(repo.find_due(Utc::now()).is_empty());
        assert!(!repo.add_multiple(
            "g1",
            &users(&["a"]),
            "r1",
            Utc::now() + chrono::Duration::hours(1),
            false
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
