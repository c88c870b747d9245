//! Role mutation executor — the boundary to the chat-platform API.
//!
//! The scheduler and command layer only depend on the success/failure
//! contract of [`RoleExecutor`]; the production implementation calls the
//! Discord REST API.

use async_trait::async_trait;

use crate::config::DiscordConfig;
use crate::error::{Result, WardenError};
use crate::model::RoleDirection;

/// Performs the actual platform-side role change. Any non-success is
/// reported as `Err` and treated by callers as retryable-but-logged, never
/// fatal to the process.
#[async_trait]
pub trait RoleExecutor: Send + Sync {
    async fn apply(
        &self,
        guild_id: &str,
        user_id: &str,
        role_id: &str,
        direction: RoleDirection,
    ) -> Result<()>;
}

/// Discord REST implementation: `PUT`/`DELETE
/// /guilds/{guild}/members/{user}/roles/{role}`.
pub struct DiscordRoleExecutor {
    config: DiscordConfig,
    client: reqwest::Client,
}

impl DiscordRoleExecutor {
    pub fn new(config: DiscordConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn role_url(&self, guild_id: &str, user_id: &str, role_id: &str) -> String {
        format!(
            "{}/guilds/{guild_id}/members/{user_id}/roles/{role_id}",
            self.config.api_base
        )
    }
}

#[async_trait]
impl RoleExecutor for DiscordRoleExecutor {
    async fn apply(
        &self,
        guild_id: &str,
        user_id: &str,
        role_id: &str,
        direction: RoleDirection,
    ) -> Result<()> {
        let url = self.role_url(guild_id, user_id, role_id);
        let request = match direction {
            RoleDirection::Grant => self.client.put(&url),
            RoleDirection::Revoke => self.client.delete(&url),
        };
        let response = request
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .header("X-Audit-Log-Reason", "rolewarden scheduled role change")
            .send()
            .await
            .map_err(|e| WardenError::Executor(format!("{direction} {role_id} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(WardenError::Executor(format!(
                "{direction} {role_id} for user {user_id} in guild {guild_id}: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_url() {
        let executor = DiscordRoleExecutor::new(DiscordConfig::default());
        assert_eq!(
            executor.role_url("1", "2", "3"),
            "https://discord.com/api/v10/guilds/1/members/2/roles/3"
        );
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(RoleDirection::Grant.to_string(), "grant");
        assert_eq!(RoleDirection::Revoke.to_string(), "revoke");
    }
}
