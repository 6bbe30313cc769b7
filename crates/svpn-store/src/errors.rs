//! Store error type, following `wirewarden-api`'s `VpnStoreError`/
//! `UserStoreError` shape: a `#[from] sqlx::Error` catch-all plus typed
//! variants for constraint violations the store maps explicitly.

use svpn_types::ValidationError;

/// Errors returned by [`crate::Store`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An underlying SQLite/sqlx failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced group id does not exist.
    #[error("group not found: {0}")]
    GroupNotFound(i64),

    /// A group name is already in use.
    #[error("group name already in use: {0}")]
    DuplicateGroupName(String),

    /// A selector or identifier failed validation before any row was
    /// written.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
