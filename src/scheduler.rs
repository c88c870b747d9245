//! Lifecycle scheduler — the poll loop that fires due role work.
//!
//! One tick: query each repository for due items, run the role executor,
//! write completion state back. Every item is processed independently; a
//! failure in one never aborts the rest of the tick, and an unhealthy store
//! skips the whole tick rather than crash the timer.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::connection::ConnectionManager;
use crate::executor::RoleExecutor;
use crate::model::RoleDirection;
use crate::one_shots::ScheduledActionRepository;
use crate::recurring::RecurringActionRepository;
use crate::temp_roles::TempRoleRepository;

/// What one tick accomplished. Returned for observability and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    /// Tick skipped entirely because the store was unreachable.
    pub skipped: bool,
    /// Expired temporary grants fully removed.
    pub grants_removed: usize,
    /// One-shot actions marked executed.
    pub one_shots_executed: usize,
    /// Recurring definitions fired.
    pub recurring_fired: usize,
}

/// Timer-driven poller over the three repositories.
pub struct LifecycleScheduler {
    conn: Arc<ConnectionManager>,
    temp_roles: Arc<TempRoleRepository>,
    one_shots: Arc<ScheduledActionRepository>,
    recurring: Arc<RecurringActionRepository>,
    executor: Arc<dyn RoleExecutor>,
    max_removal_attempts: u32,
}

impl LifecycleScheduler {
    pub fn new(
        conn: Arc<ConnectionManager>,
        temp_roles: Arc<TempRoleRepository>,
        one_shots: Arc<ScheduledActionRepository>,
        recurring: Arc<RecurringActionRepository>,
        executor: Arc<dyn RoleExecutor>,
        max_removal_attempts: u32,
    ) -> Self {
        Self {
            conn,
            temp_roles,
            one_shots,
            recurring,
            executor,
            max_removal_attempts,
        }
    }

    /// Run one poll tick.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        if self.conn.ensure_healthy().await.is_err() {
            tracing::warn!("⚠️ Store unreachable, skipping this tick");
            summary.skipped = true;
            return summary;
        }
        let now = Utc::now();

        summary.grants_removed = self.process_expired_grants().await;
        summary.one_shots_executed = self.process_one_shots().await;
        summary.recurring_fired = self.process_recurring().await;

        if summary != TickSummary::default() {
            tracing::info!(
                "🔔 Tick at {now}: {} grant(s) removed, {} one-shot(s) executed, {} recurring fired",
                summary.grants_removed,
                summary.one_shots_executed,
                summary.recurring_fired
            );
        }
        summary
    }

    /// Expired temporary grants: revoke the role from every listed user.
    /// Full success deletes the grant; partial success trims the succeeded
    /// users out and keeps the rest for the next tick (at-least-once).
    async fn process_expired_grants(&self) -> usize {
        let mut removed = 0;
        for grant in self.temp_roles.find_due(Utc::now()) {
            let mut succeeded = Vec::new();
            let mut failed = 0usize;
            for user_id in &grant.user_ids {
                match self
                    .executor
                    .apply(&grant.guild_id, user_id, &grant.role_id, RoleDirection::Revoke)
                    .await
                {
                    Ok(()) => succeeded.push(user_id.clone()),
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(
                            "⚠️ Failed to revoke role {} from user {user_id} in guild {}: {e}",
                            grant.role_id,
                            grant.guild_id
                        );
                    }
                }
            }
            if failed == 0 {
                if self.temp_roles.delete(&grant.id) {
                    removed += 1;
                    if grant.notify_expiry {
                        tracing::info!(
                            "📣 Grant expired (notify requested): role {} in guild {} for {} user(s)",
                            grant.role_id,
                            grant.guild_id,
                            succeeded.len()
                        );
                    }
                }
            } else {
                if !succeeded.is_empty() {
                    self.temp_roles.remove_users(&grant.id, &succeeded);
                }
                self.temp_roles
                    .record_removal_failure(&grant.id, self.max_removal_attempts);
            }
        }
        removed
    }

    /// Due one-shot actions. Executed-regardless-of-soft-failure: a failed
    /// action is reported, not retried forever, so the queue always drains.
    async fn process_one_shots(&self) -> usize {
        let mut executed = 0;
        for action in self.one_shots.find_due(Utc::now()) {
            // Re-read to close the race with a concurrent cancel between
            // the due query and execution.
            let Some(current) = self.one_shots.get(&action.id) else {
                continue;
            };
            if current.cancelled || current.executed {
                continue;
            }
            if let Err(e) = self
                .executor
                .apply(
                    &current.guild_id,
                    &current.action.user_id,
                    &current.action.role_id,
                    current.action.direction,
                )
                .await
            {
                tracing::warn!("⚠️ One-shot action {} failed (not retried): {e}", current.id);
            }
            if self.one_shots.mark_executed(&current.id) {
                executed += 1;
            }
        }
        executed
    }

    /// Active recurring definitions due to fire. `lastExecutedAt` advances
    /// to the actual fire instant even on executor failure, so downtime
    /// never turns into a catch-up burst.
    async fn process_recurring(&self) -> usize {
        let mut fired = 0;
        for definition in self.recurring.find_active(Utc::now()) {
            if let Err(e) = self
                .executor
                .apply(
                    &definition.guild_id,
                    &definition.action.user_id,
                    &definition.action.role_id,
                    definition.action.direction,
                )
                .await
            {
                tracing::warn!("⚠️ Recurring action {} failed this firing: {e}", definition.id);
            }
            if self.recurring.advance(&definition.id, Utc::now()) {
                fired += 1;
            }
        }
        fired
    }
}

/// Spawn the scheduler loop as a background tokio task. Exits when the
/// shutdown channel flips, cancelling the timer.
pub async fn spawn_scheduler(
    scheduler: Arc<LifecycleScheduler>,
    poll_interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("⏰ Lifecycle scheduler started (poll every {poll_interval_secs}s)");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(poll_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                scheduler.tick().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("⏰ Lifecycle scheduler stopped");
                    return;
                }
            }
        }
    }
}
