//! # RoleWarden
//!
//! Time-based role entitlement service for chat-platform guilds: temporary
//! role grants that expire on their own, one-shot role actions scheduled for
//! a future instant, and recurring actions that re-fire on an interval.
//! Survives restarts (everything lives in the document store), tolerates
//! storage outages (every repository fails soft), and never double-executes
//! a finished work item.
//!
//! ## Architecture
//! ```text
//! LifecycleScheduler (tokio interval)
//!   ├── TempRoleRepository.find_due()      → revoke + delete / retain on failure
//!   ├── ScheduledActionRepository.find_due() → execute once, mark executed
//!   └── RecurringActionRepository.find_active() → execute, advance lastExecutedAt
//!         │
//!         └── RoleExecutor (Discord REST) — the only side-effect boundary
//!
//! Repositories = ConnectionManager (bounded-retry SQLite session)
//!              + RepoCache (invalidated on every write)
//! Command handlers (external) call the same repositories synchronously.
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod model;
pub mod normalize;
pub mod one_shots;
pub mod recurring;
pub mod scheduler;
pub mod store;
pub mod temp_roles;

pub use cache::RepoCache;
pub use config::WardenConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Result, WardenError};
pub use executor::{DiscordRoleExecutor, RoleExecutor};
pub use model::{
    RecurringRoleAction, RoleAction, RoleDirection, ScheduledRoleAction, TempRoleEntry,
    TemporaryRoleGrant,
};
pub use one_shots::ScheduledActionRepository;
pub use recurring::RecurringActionRepository;
pub use scheduler::{LifecycleScheduler, TickSummary, spawn_scheduler};
pub use store::DocumentStore;
pub use temp_roles::TempRoleRepository;
