//! Storage error types.

use dutybot_id::{AssignmentId, CycleNumber, MemberId, PoolId};
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/rotation.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// Concurrent writers touched the same pool: lock timeout, serialization
    /// failure, or a stale cycle/version. Safe to retry the whole unit of work.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// The ledger already holds an assignment for this member in this cycle.
    #[error("member {member_id} already has an assignment in cycle {cycle_number} of pool {pool_id}")]
    DuplicateAssignment {
        pool_id: PoolId,
        member_id: MemberId,
        cycle_number: CycleNumber,
    },

    /// An assignment already has its one response.
    #[error("assignment {assignment_id} already has a response")]
    DuplicateResponse { assignment_id: AssignmentId },

    /// A row the operation depends on vanished mid-transaction.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value failed to decode into the domain model.
    #[error("corrupt stored state: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True for failures where retrying the unit of work can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
