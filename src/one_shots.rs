//! One-shot scheduled role action repository.
//!
//! Actions move pending → executed | cancelled, both terminal. Terminal
//! documents are retained for audit and never re-selected as due.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::cache::RepoCache;
use crate::connection::ConnectionManager;
use crate::model::ScheduledRoleAction;
use crate::normalize::now_params;
use crate::store::DocumentStore;

const COLLECTION: &str = "scheduled_actions";

/// Due iff scheduledAt has passed and neither terminal flag is set. Same
/// dual-shape time comparison as the other repositories: canonical text
/// lexically, legacy integers as epoch millis, other text normalized
/// in-process.
const DUE_FILTER: &str = "json_extract(doc, '$.executed') IS NOT 1 \
    AND json_extract(doc, '$.cancelled') IS NOT 1 \
    AND CASE json_type(doc, '$.scheduledAt') \
      WHEN 'integer' THEN json_extract(doc, '$.scheduledAt') <= ?2 \
      WHEN 'text' THEN (json_extract(doc, '$.scheduledAt') <= ?1 \
                        OR json_extract(doc, '$.scheduledAt') NOT GLOB '[0-9][0-9][0-9][0-9]-*') \
      ELSE 0 \
    END";

pub struct ScheduledActionRepository {
    conn: Arc<ConnectionManager>,
    cache: RepoCache<ScheduledRoleAction>,
}

impl ScheduledActionRepository {
    pub fn new(conn: Arc<ConnectionManager>) -> Self {
        Self {
            conn,
            cache: RepoCache::new(),
        }
    }

    fn store(&self) -> Option<Arc<DocumentStore>> {
        let store = self.conn.store();
        if store.is_none() {
            tracing::warn!("⚠️ scheduled_actions: store unavailable");
        }
        store
    }

    /// Persist a new pending action. Returns `false` (logged) on failure.
    pub fn create(&self, action: &ScheduledRoleAction) -> bool {
        let Some(store) = self.store() else { return false };
        match store.insert(COLLECTION, &action.id, &action.to_doc()) {
            Ok(()) => {
                self.cache.clear();
                tracing::info!(
                    "📅 One-shot action scheduled: {} {} for user {} in guild {} at {}",
                    action.action.direction,
                    action.action.role_id,
                    action.action.user_id,
                    action.guild_id,
                    action.scheduled_at
                );
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ scheduled_actions: insert failed: {e}");
                false
            }
        }
    }

    /// One action by id. Uncached read: used for the defensive re-check
    /// between the due query and execution.
    pub fn get(&self, id: &str) -> Option<ScheduledRoleAction> {
        let store = self.store()?;
        match store.find_one(COLLECTION, id) {
            Ok(Some(document)) => ScheduledRoleAction::from_doc(&document.id, &document.doc),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ scheduled_actions: read failed: {e}");
                None
            }
        }
    }

    /// All actions keyed by id. Empty map when nothing found or store down.
    pub fn get_all(&self) -> HashMap<String, ScheduledRoleAction> {
        if let Some(cached) = self.cache.get_all() {
            return cached;
        }
        let Some(store) = self.store() else { return HashMap::new() };
        let docs = match store.find(COLLECTION, None, &[]) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!("⚠️ scheduled_actions: find failed: {e}");
                return HashMap::new();
            }
        };
        let entries: HashMap<String, ScheduledRoleAction> = docs
            .iter()
            .filter_map(|d| ScheduledRoleAction::from_doc(&d.id, &d.doc))
            .map(|a| (a.id.clone(), a))
            .collect();
        self.cache.prime(entries.clone());
        entries
    }

    /// Actions for one guild, keyed by id.
    pub fn get_by_guild(&self, guild_id: &str) -> HashMap<String, ScheduledRoleAction> {
        self.get_all()
            .into_iter()
            .filter(|(_, a)| a.guild_id == guild_id)
            .collect()
    }

    /// Pending actions whose fire instant has passed, filtered server-side
    /// and re-checked after normalization.
    pub fn find_due(&self, now: DateTime<Utc>) -> Vec<ScheduledRoleAction> {
        let Some(store) = self.store() else { return Vec::new() };
        let (now_text, now_millis, _) = now_params(now);
        let params: [&dyn rusqlite::ToSql; 2] = [&now_text, &now_millis];
        let docs = match store.find(COLLECTION, Some(DUE_FILTER), &params) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!("⚠️ scheduled_actions: due query failed: {e}");
                return Vec::new();
            }
        };
        docs.iter()
            .filter_map(|d| ScheduledRoleAction::from_doc(&d.id, &d.doc))
            .filter(|a| a.is_due(now))
            .collect()
    }

    /// Mark an action executed (terminal). Independent field write: a
    /// concurrent cancel touches its own flag and neither corrupts the other.
    pub fn mark_executed(&self, id: &str) -> bool {
        self.set_flag(id, "executed")
    }

    /// Cancel a pending action (terminal).
    pub fn cancel(&self, id: &str) -> bool {
        self.set_flag(id, "cancelled")
    }

    fn set_flag(&self, id: &str, flag: &str) -> bool {
        let Some(store) = self.store() else { return false };
        match store.update(COLLECTION, id, &json!({ flag: true })) {
            Ok(changed) => {
                if changed {
                    self.cache.clear();
                } else {
                    tracing::warn!("⚠️ scheduled_actions: no action {id} to mark {flag}");
                }
                changed
            }
            Err(e) => {
                tracing::warn!("⚠️ scheduled_actions: mark {flag} failed: {e}");
                false
            }
        }
    }

    /// Delete by id. Idempotent no-op success when already absent.
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
                tracing::warn!("⚠️ scheduled_actions: delete failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::{RoleAction, RoleDirection};
    use serde_json::json;

    async fn repo(name: &str) -> (ScheduledActionRepository, Arc<ConnectionManager>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("rolewarden-one-shots-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        let conn = Arc::new(ConnectionManager::new(StorageConfig {
            db_path: dir.join("test.db").to_string_lossy().into_owned(),
            ..Default::default()
        }));
        conn.connect().await.unwrap();
        (ScheduledActionRepository::new(conn.clone()), conn, dir)
    }

    fn action_at(at: DateTime<Utc>) -> ScheduledRoleAction {
        ScheduledRoleAction::new(
            "g1",
            at,
            RoleAction {
                user_id: "u1".into(),
                role_id: "r1".into(),
                direction: RoleDirection::Grant,
            },
        )
    }

    #[tokio::test]
    async fn test_find_due_matches_contract() {
        let (repo, _conn, dir) = repo("due").await;
        let due = action_at(Utc::now() - chrono::Duration::seconds(1));
        let future = action_at(Utc::now() + chrono::Duration::hours(1));
        let mut executed = action_at(Utc::now() - chrono::Duration::seconds(1));
        executed.executed = true;
        let mut cancelled = action_at(Utc::now() - chrono::Duration::seconds(1));
        cancelled.cancelled = true;
        for a in [&due, &future, &executed, &cancelled] {
            assert!(repo.create(a));
        }

        let found = repo.find_due(Utc::now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_mark_executed_is_terminal() {
        let (repo, _conn, dir) = repo("terminal").await;
        let due = action_at(Utc::now() - chrono::Duration::seconds(1));
        repo.create(&due);

        assert!(repo.mark_executed(&due.id));
        // Never due again, but retained for audit
        assert!(repo.find_due(Utc::now()).is_empty());
        let stored = repo.get(&due.id).unwrap();
        assert!(stored.executed);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let (repo, _conn, dir) = repo("cancel").await;
        let due = action_at(Utc::now() - chrono::Duration::seconds(1));
        repo.create(&due);

        assert!(repo.cancel(&due.id));
        assert!(repo.find_due(Utc::now()).is_empty());
        assert!(repo.get(&due.id).unwrap().cancelled);
        // Unknown id: nothing to cancel
        assert!(!repo.cancel("missing"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_get_by_guild_and_cache_consistency() {
        let (repo, _conn, dir) = repo("guild").await;
        let a = action_at(Utc::now() + chrono::Duration::hours(1));
        repo.create(&a);
        assert_eq!(repo.get_all().len(), 1);

        let mut b = action_at(Utc::now() + chrono::Duration::hours(1));
        b.guild_id = "g2".into();
        repo.create(&b);
        // The write invalidated the primed cache
        assert_eq!(repo.get_all().len(), 2);
        assert_eq!(repo.get_by_guild("g2").len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_legacy_epoch_millis_due() {
        let (repo, conn, dir) = repo("legacy").await;
        let store = conn.store().unwrap();
        store
            .insert(
                "scheduled_actions",
                "legacy1",
                &json!({
                    "guildId": "g1",
                    "scheduledAt": 1_700_000_000_000_i64,
                    "executed": false,
                    "cancelled": false,
                    "action": {"userId": "u1", "roleId": "r1", "direction": "revoke"},
                }),
            )
            .unwrap();

        let found = repo.find_due(Utc::now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].action.direction, RoleDirection::Revoke);
        std::fs::remove_dir_all(&dir).ok();
    }
}
