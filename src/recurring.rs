//! Recurring role action repository.
//!
//! A definition re-fires whenever `lastExecutedAt + interval` passes, or
//! immediately when it has never fired. Cancelling forces `active=false`
//! and `cancelled=true` in one write so the two flags never disagree.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::cache::RepoCache;
use crate::connection::ConnectionManager;
use crate::model::RecurringRoleAction;
use crate::normalize::{canonical_instant, now_params};
use crate::store::DocumentStore;

const COLLECTION: &str = "recurring_actions";

/// Active definitions whose next fire has passed. `lastExecutedAt` may be
/// null (never fired: due immediately), canonical text (parsed by
/// strftime), a legacy integer (epoch millis), or non-canonical text
/// (candidate for in-process normalization).
const ACTIVE_FILTER: &str = "json_extract(doc, '$.active') = 1 \
    AND json_extract(doc, '$.cancelled') IS NOT 1 \
    AND (json_type(doc, '$.lastExecutedAt') IS NULL \
      OR json_type(doc, '$.lastExecutedAt') = 'null' \
      OR CASE json_type(doc, '$.lastExecutedAt') \
        WHEN 'integer' THEN (json_extract(doc, '$.lastExecutedAt') / 1000 \
                             + json_extract(doc, '$.intervalSecs')) <= ?1 \
        WHEN 'text' THEN (strftime('%s', json_extract(doc, '$.lastExecutedAt')) \
                          + json_extract(doc, '$.intervalSecs')) <= ?1 \
                         OR json_extract(doc, '$.lastExecutedAt') NOT GLOB '[0-9][0-9][0-9][0-9]-*' \
        ELSE 0 \
      END)";

pub struct RecurringActionRepository {
    conn: Arc<ConnectionManager>,
    cache: RepoCache<RecurringRoleAction>,
}

impl RecurringActionRepository {
    pub fn new(conn: Arc<ConnectionManager>) -> Self {
        Self {
            conn,
            cache: RepoCache::new(),
        }
    }

    fn store(&self) -> Option<Arc<DocumentStore>> {
        let store = self.conn.store();
        if store.is_none() {
            tracing::warn!("⚠️ recurring_actions: store unavailable");
        }
        store
    }

    /// Persist a new active definition. Returns `false` (logged) on failure.
    pub fn create(&self, definition: &RecurringRoleAction) -> bool {
        if definition.interval_secs == 0 {
            tracing::warn!(
                "⚠️ recurring_actions: refusing zero interval (guild {})",
                definition.guild_id
            );
            return false;
        }
        let Some(store) = self.store() else { return false };
        match store.insert(COLLECTION, &definition.id, &definition.to_doc()) {
            Ok(()) => {
                self.cache.clear();
                tracing::info!(
                    "🔁 Recurring action added: {} {} every {}s in guild {}",
                    definition.action.direction,
                    definition.action.role_id,
                    definition.interval_secs,
                    definition.guild_id
                );
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ recurring_actions: insert failed: {e}");
                false
            }
        }
    }

    /// One definition by id, bypassing the cache.
    pub fn get(&self, id: &str) -> Option<RecurringRoleAction> {
        let store = self.store()?;
        match store.find_one(COLLECTION, id) {
            Ok(Some(document)) => RecurringRoleAction::from_doc(&document.id, &document.doc),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ recurring_actions: read failed: {e}");
                None
            }
        }
    }

    /// All definitions keyed by id. Empty map when nothing found or store
    /// is down.
    pub fn get_all(&self) -> HashMap<String, RecurringRoleAction> {
        if let Some(cached) = self.cache.get_all() {
            return cached;
        }
        let Some(store) = self.store() else { return HashMap::new() };
        let docs = match store.find(COLLECTION, None, &[]) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!("⚠️ recurring_actions: find failed: {e}");
                return HashMap::new();
            }
        };
        let entries: HashMap<String, RecurringRoleAction> = docs
            .iter()
            .filter_map(|d| RecurringRoleAction::from_doc(&d.id, &d.doc))
            .map(|r| (r.id.clone(), r))
            .collect();
        self.cache.prime(entries.clone());
        entries
    }

    /// Definitions for one guild, keyed by id.
    pub fn get_by_guild(&self, guild_id: &str) -> HashMap<String, RecurringRoleAction> {
        self.get_all()
            .into_iter()
            .filter(|(_, r)| r.guild_id == guild_id)
            .collect()
    }

    /// Active definitions due to fire, filtered server-side and re-checked
    /// after normalization.
    pub fn find_active(&self, now: DateTime<Utc>) -> Vec<RecurringRoleAction> {
        let Some(store) = self.store() else { return Vec::new() };
        let (_, _, now_secs) = now_params(now);
        let params: [&dyn rusqlite::ToSql; 1] = [&now_secs];
        let docs = match store.find(COLLECTION, Some(ACTIVE_FILTER), &params) {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!("⚠️ recurring_actions: active query failed: {e}");
                return Vec::new();
            }
        };
        docs.iter()
            .filter_map(|d| RecurringRoleAction::from_doc(&d.id, &d.doc))
            .filter(|r| r.is_due(now))
            .collect()
    }

    /// Advance `lastExecutedAt` to the actual fire instant, so the next
    /// fire is relative to real execution time and downtime never causes a
    /// catch-up burst.
    pub fn advance(&self, id: &str, fired_at: DateTime<Utc>) -> bool {
        let Some(store) = self.store() else { return false };
        let patch = json!({ "lastExecutedAt": canonical_instant(fired_at) });
        match store.update(COLLECTION, id, &patch) {
            Ok(changed) => {
                if changed {
                    self.cache.clear();
                }
                changed
            }
            Err(e) => {
                tracing::warn!("⚠️ recurring_actions: advance failed: {e}");
                false
            }
        }
    }

    /// Cancel a definition: `active=false` and `cancelled=true` in a single
    /// document write.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(store) = self.store() else { return false };
        match store.update(COLLECTION, id, &json!({ "active": false, "cancelled": true })) {
            Ok(changed) => {
                if changed {
                    self.cache.clear();
                    tracing::info!("🔁 Recurring action {id} cancelled");
                } else {
                    tracing::warn!("⚠️ recurring_actions: no definition {id} to cancel");
                }
                changed
            }
            Err(e) => {
                tracing::warn!("⚠️ recurring_actions: cancel failed: {e}");
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
                tracing::warn!("⚠️ recurring_actions: delete failed: {e}");
                false
            }
        }
    }
}
