//! RoleWarden error types.

use thiserror::Error;

/// Errors that can occur inside RoleWarden.
///
/// Repository methods deliberately do not surface these to callers — they
/// log and return a safe default instead (see the repository modules). The
/// error type is used at the store/connection/executor layer, where the
/// caller is our own code and can decide how soft to fail.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Backing store unavailable or a statement failed.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Role mutation call against the chat platform failed.
    #[error("executor error: {0}")]
    Executor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, WardenError>;
