//! Storage layer for pools, members and the assignment ledger.
//!
//! This module provides:
//! - The [`Storage`] trait for reads outside a transaction
//! - The [`UnitOfWork`] trait: one transaction, committed or rolled back as a whole
//! - A Postgres implementation (SQLx) and an in-memory implementation
//!
//! Every mutation the rotation engine performs for one selection happens
//! inside a single unit of work. Dropping a unit of work without committing
//! discards it.

mod error;
mod memory;
mod postgres;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, MemoryUnitOfWork};
pub use postgres::{Database, DbConfig, PgStore, PgUnitOfWork};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dutybot_id::{AssignmentId, CycleNumber, MemberId, PoolId};

use tracing::warn;

use crate::error::RotationResult;
use crate::ledger::AssignmentFilter;
use crate::model::{Assignment, AssignmentResponse, LedgerEntry, Member, NewAssignment, Pool};
use crate::period::PeriodLabel;

/// A store that can open units of work and answer read-only queries.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Tx: UnitOfWork;

    /// Open a new unit of work.
    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn find_pool(&self, pool_id: PoolId) -> StoreResult<Option<Pool>>;

    async fn find_pool_by_group(&self, group_ref: &str) -> StoreResult<Option<Pool>>;

    async fn list_pools(&self) -> StoreResult<Vec<Pool>>;

    /// Members of a pool ordered by join time.
    async fn list_members(&self, pool_id: PoolId, active_only: bool) -> StoreResult<Vec<Member>>;

    /// Ledger rows of a pool, most recent first.
    async fn query_assignments(
        &self,
        pool_id: PoolId,
        filter: &AssignmentFilter,
    ) -> StoreResult<Vec<Assignment>>;

    /// One assignment of a pool with its response.
    async fn find_entry(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>>;
}

/// One transaction against the store.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Read a pool and hold it against concurrent writers until the unit ends.
    async fn lock_pool(&mut self, pool_id: PoolId) -> StoreResult<Option<Pool>>;

    /// Read a pool by its group reference, holding it like [`Self::lock_pool`].
    async fn find_pool_by_group(&mut self, group_ref: &str) -> StoreResult<Option<Pool>>;

    async fn insert_pool(&mut self, pool: &Pool) -> StoreResult<()>;

    async fn rename_pool(
        &mut self,
        pool_id: PoolId,
        display_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// All members of a pool, active or not, ordered by join time.
    async fn members(&mut self, pool_id: PoolId) -> StoreResult<Vec<Member>>;

    async fn insert_member(&mut self, member: &Member) -> StoreResult<()>;

    /// Update display name and active flag of an existing member.
    async fn update_member(
        &mut self,
        pool_id: PoolId,
        member_id: MemberId,
        display_name: &str,
        is_active: bool,
    ) -> StoreResult<()>;

    /// Start the next cycle: bump the pool's cycle from `expected` and clear
    /// every member's completed flag. Fails with a conflict when the stored
    /// cycle is no longer `expected`.
    async fn advance_cycle(
        &mut self,
        pool_id: PoolId,
        expected: CycleNumber,
        at: DateTime<Utc>,
    ) -> StoreResult<CycleNumber>;

    /// Set the completed flag of an active, not yet completed member.
    async fn mark_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()>;

    /// Clear the completed flag of a member whose assignment was replaced.
    async fn clear_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()>;

    /// Append a ledger row. Fails with `DuplicateAssignment` when the member
    /// already has a row in that cycle that was not replaced.
    async fn insert_assignment(&mut self, entry: &NewAssignment) -> StoreResult<Assignment>;

    /// One assignment of a pool with its response, as seen by this unit.
    async fn entry(
        &mut self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>>;

    /// Every assignment of a pool made for `period`, oldest first.
    async fn period_entries(
        &mut self,
        pool_id: PoolId,
        period: PeriodLabel,
    ) -> StoreResult<Vec<LedgerEntry>>;

    /// Record the response to an assignment. Fails with
    /// `DuplicateResponse` when it already has one.
    async fn insert_response(&mut self, response: &AssignmentResponse) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// End a unit of work: commit on success, roll back on failure.
pub(crate) async fn finish<Tx: UnitOfWork, T>(
    tx: Tx,
    result: RotationResult<T>,
) -> RotationResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}
