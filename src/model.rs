//! Entity definitions — the core data model for time-based role work.
//!
//! Each entity knows how to encode itself to its persisted document shape
//! (camelCase JSON) and how to decode defensively from whatever shape is in
//! the store, normalizing legacy date fields through [`crate::normalize`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::normalize::{canonical_instant, normalize_instant};

/// Which way a role mutation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleDirection {
    Grant,
    Revoke,
}

impl RoleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleDirection::Grant => "grant",
            RoleDirection::Revoke => "revoke",
        }
    }
}

impl std::fmt::Display for RoleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The role-change instruction carried by one-shot and recurring actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAction {
    pub user_id: String,
    pub role_id: String,
    pub direction: RoleDirection,
}

impl RoleAction {
    pub fn to_doc(&self) -> Value {
        json!({
            "userId": self.user_id,
            "roleId": self.role_id,
            "direction": self.direction.as_str(),
        })
    }

    pub fn from_doc(doc: &Value) -> Option<Self> {
        Some(Self {
            user_id: doc["userId"].as_str()?.to_string(),
            role_id: doc["roleId"].as_str()?.to_string(),
            direction: match doc["direction"].as_str()? {
                "grant" => RoleDirection::Grant,
                "revoke" => RoleDirection::Revoke,
                _ => return None,
            },
        })
    }
}

/// A temporary role grant: one document may fan out one role/expiry to
/// several users. Identity for revocation is the (guild, role) pair plus
/// membership in the user set.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporaryRoleGrant {
    /// Store document id.
    pub id: String,
    pub guild_id: String,
    pub user_ids: Vec<String>,
    pub role_id: String,
    pub expires_at: DateTime<Utc>,
    pub notify_expiry: bool,
    /// Consecutive failed removal attempts (see scheduler stall policy).
    pub removal_attempts: u32,
    /// Removal gave up after too many failures; excluded from due queries.
    pub stalled: bool,
}

impl TemporaryRoleGrant {
    pub fn new(
        guild_id: &str,
        user_ids: Vec<String>,
        role_id: &str,
        expires_at: DateTime<Utc>,
        notify_expiry: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            guild_id: guild_id.to_string(),
            user_ids,
            role_id: role_id.to_string(),
            expires_at,
            notify_expiry,
            removal_attempts: 0,
            stalled: false,
        }
    }

    pub fn to_doc(&self) -> Value {
        json!({
            "guildId": self.guild_id,
            "userIds": self.user_ids,
            "roleId": self.role_id,
            "expiresAt": canonical_instant(self.expires_at),
            "notifyExpiry": self.notify_expiry,
            "removalAttempts": self.removal_attempts,
            "stalled": self.stalled,
        })
    }

    pub fn from_doc(id: &str, doc: &Value) -> Option<Self> {
        // Single-user legacy documents store "userId" instead of the set.
        let user_ids = match doc["userIds"].as_array() {
            Some(arr) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            None => vec![doc["userId"].as_str()?.to_string()],
        };
        Some(Self {
            id: id.to_string(),
            guild_id: doc["guildId"].as_str()?.to_string(),
            user_ids,
            role_id: doc["roleId"].as_str()?.to_string(),
            expires_at: normalize_instant(&doc["expiresAt"])?,
            notify_expiry: doc["notifyExpiry"].as_bool().unwrap_or(false),
            removal_attempts: doc["removalAttempts"].as_u64().unwrap_or(0) as u32,
            stalled: doc["stalled"].as_bool().unwrap_or(false),
        })
    }

    /// Due once the expiry instant has passed and removal has not stalled.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.stalled && self.expires_at <= now
    }
}

/// One logical grant entry, as seen by callers: one user, one role.
#[derive(Debug, Clone, PartialEq)]
pub struct TempRoleEntry {
    /// Backing store document id (shared by all entries of a fan-out grant).
    pub doc_id: String,
    pub guild_id: String,
    pub user_id: String,
    pub role_id: String,
    pub expires_at: DateTime<Utc>,
    pub notify_expiry: bool,
}

impl TempRoleEntry {
    /// Natural key: guild:user:role.
    pub fn key(&self) -> String {
        grant_key(&self.guild_id, &self.user_id, &self.role_id)
    }
}

/// Natural key for a single user's grant on a role.
pub fn grant_key(guild_id: &str, user_id: &str, role_id: &str) -> String {
    format!("{guild_id}:{user_id}:{role_id}")
}

/// A one-shot scheduled role action. Terminal states (executed, cancelled)
/// are never re-selected as due; the document is retained for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRoleAction {
    pub id: String,
    pub guild_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub executed: bool,
    pub cancelled: bool,
    pub action: RoleAction,
}

impl ScheduledRoleAction {
    pub fn new(guild_id: &str, scheduled_at: DateTime<Utc>, action: RoleAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            guild_id: guild_id.to_string(),
            scheduled_at,
            executed: false,
            cancelled: false,
            action,
        }
    }

    pub fn to_doc(&self) -> Value {
        json!({
            "guildId": self.guild_id,
            "scheduledAt": canonical_instant(self.scheduled_at),
            "executed": self.executed,
            "cancelled": self.cancelled,
            "action": self.action.to_doc(),
        })
    }

    pub fn from_doc(id: &str, doc: &Value) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            guild_id: doc["guildId"].as_str()?.to_string(),
            scheduled_at: normalize_instant(&doc["scheduledAt"])?,
            executed: doc["executed"].as_bool().unwrap_or(false),
            cancelled: doc["cancelled"].as_bool().unwrap_or(false),
            action: RoleAction::from_doc(&doc["action"])?,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.executed && !self.cancelled && self.scheduled_at <= now
    }
}

/// A recurring role action that re-fires on a fixed interval until cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringRoleAction {
    pub id: String,
    pub guild_id: String,
    pub active: bool,
    pub cancelled: bool,
    pub interval_secs: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub action: RoleAction,
}

impl RecurringRoleAction {
    pub fn new(guild_id: &str, interval_secs: u64, action: RoleAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            guild_id: guild_id.to_string(),
            active: true,
            cancelled: false,
            interval_secs,
            last_executed_at: None,
            action,
        }
    }

    pub fn to_doc(&self) -> Value {
        json!({
            "guildId": self.guild_id,
            "active": self.active,
            "cancelled": self.cancelled,
            "intervalSecs": self.interval_secs,
            "lastExecutedAt": self.last_executed_at.map(canonical_instant),
            "action": self.action.to_doc(),
        })
    }

    pub fn from_doc(id: &str, doc: &Value) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            guild_id: doc["guildId"].as_str()?.to_string(),
            active: doc["active"].as_bool().unwrap_or(false),
            cancelled: doc["cancelled"].as_bool().unwrap_or(false),
            interval_secs: doc["intervalSecs"].as_u64().unwrap_or(0),
            last_executed_at: normalize_instant(&doc["lastExecutedAt"]),
            action: RoleAction::from_doc(&doc["action"])?,
        })
    }

    /// Next fire: lastExecutedAt + interval, or immediately when never fired.
    /// An interval too large to represent means the next fire is unreachable.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.active || self.cancelled {
            return false;
        }
        match self.last_executed_at {
            None => true,
            Some(last) => i64::try_from(self.interval_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|interval| last.checked_add_signed(interval))
                .is_some_and(|next_fire| next_fire <= now),
        }
    }
}
