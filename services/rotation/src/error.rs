//! Errors surfaced by the rotation core.

use std::time::Duration;

use dutybot_id::{AssignmentId, CycleNumber, MemberId, PoolId};
use thiserror::Error;

use crate::model::AssignmentStatus;
use crate::period::PeriodLabel;
use crate::store::StoreError;

/// Result type for rotation operations.
pub type RotationResult<T> = Result<T, RotationError>;

/// Errors returned by the pool store, the ledger and the rotation engine.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("pool {0} not found")]
    PoolNotFound(PoolId),

    #[error("pool {0} has no active members")]
    EmptyPool(PoolId),

    #[error("member {member_id} is not an active member of pool {pool_id}")]
    MemberNotFound { pool_id: PoolId, member_id: MemberId },

    #[error("member {member_id} already served in cycle {cycle}")]
    AlreadyServed {
        member_id: MemberId,
        cycle: CycleNumber,
    },

    /// The period already has a pending or confirmed assignment.
    #[error("week {period} of pool {pool_id} is already taken by assignment {assignment_id} ({status})")]
    PeriodTaken {
        pool_id: PoolId,
        period: PeriodLabel,
        assignment_id: AssignmentId,
        status: AssignmentStatus,
    },

    /// Every eligible member already declined this period.
    #[error("no member of pool {pool_id} is left to pick for week {period}")]
    NoCandidates { pool_id: PoolId, period: PeriodLabel },

    #[error("assignment {assignment_id} not found in pool {pool_id}")]
    AssignmentNotFound {
        pool_id: PoolId,
        assignment_id: AssignmentId,
    },

    #[error("assignment {assignment_id} was already answered ({status})")]
    AlreadyResponded {
        assignment_id: AssignmentId,
        status: AssignmentStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pool {pool_id} kept conflicting after {attempts} attempts")]
    ConcurrencyConflict { pool_id: PoolId, attempts: u32 },

    #[error("timed out after {waited:?} waiting for the rotation lock of pool {pool_id}")]
    LockTimeout { pool_id: PoolId, waited: Duration },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl RotationError {
    /// Transient failures: the caller may try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RotationError::ConcurrencyConflict { .. } | RotationError::LockTimeout { .. }
        )
    }

    /// Failures caused by the request itself, worth showing to the chat user.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            RotationError::PoolNotFound(_)
                | RotationError::EmptyPool(_)
                | RotationError::MemberNotFound { .. }
                | RotationError::AlreadyServed { .. }
                | RotationError::PeriodTaken { .. }
                | RotationError::NoCandidates { .. }
                | RotationError::AssignmentNotFound { .. }
                | RotationError::AlreadyResponded { .. }
                | RotationError::InvalidInput(_)
        )
    }

    pub(crate) fn is_store_conflict(&self) -> bool {
        matches!(self, RotationError::Storage(e) if e.is_conflict())
    }
}
