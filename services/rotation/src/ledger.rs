//! Append-only assignment ledger.
//!
//! Rows are written only by the rotation engine, inside the engine's unit of
//! work, and are never updated. A member serves at most once per cycle of a
//! pool; the same member may appear again in later cycles, or in the same
//! cycle after its earlier row was replaced.
//!
//! Responses (confirmed, declined, replaced) live in a second append-only log
//! keyed by assignment, at most one per assignment.

use std::sync::Arc;

use dutybot_id::{AssignmentId, CycleNumber, MemberId, PoolId};
use tracing::{debug, instrument};

use crate::error::RotationResult;
use crate::model::{Assignment, AssignmentResponse, LedgerEntry, NewAssignment};
use crate::period::PeriodLabel;
use crate::store::{Storage, UnitOfWork};

/// Upper bound on rows returned by a history query.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Narrows a ledger query. Empty filter matches every row of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentFilter {
    pub member_id: Option<MemberId>,
    pub cycle_number: Option<CycleNumber>,
    pub period_label: Option<PeriodLabel>,
    pub limit: Option<usize>,
}

impl AssignmentFilter {
    pub fn member(mut self, member_id: MemberId) -> Self {
        self.member_id = Some(member_id);
        self
    }

    pub fn cycle(mut self, cycle_number: CycleNumber) -> Self {
        self.cycle_number = Some(cycle_number);
        self
    }

    pub fn period(mut self, period_label: PeriodLabel) -> Self {
        self.period_label = Some(period_label);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Row-level predicate, ignoring `limit`.
    pub fn matches(&self, assignment: &Assignment) -> bool {
        self.member_id.is_none_or(|id| assignment.member_id == id)
            && self.cycle_number.is_none_or(|c| assignment.cycle_number == c)
            && self.period_label.is_none_or(|p| assignment.period_label == p)
    }
}

/// Read and append access to the ledger.
pub struct AssignmentLedger<S> {
    store: Arc<S>,
}

impl<S: Storage> AssignmentLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append a row as part of `tx`. Visible to readers once `tx` commits.
    #[instrument(skip(self, tx, entry), fields(pool_id = %entry.pool_id, member_id = %entry.member_id, cycle = %entry.cycle_number))]
    pub async fn append(&self, tx: &mut S::Tx, entry: NewAssignment) -> RotationResult<Assignment> {
        let assignment = tx.insert_assignment(&entry).await?;
        debug!(
            assignment_id = %assignment.assignment_id,
            seq = %assignment.seq,
            period = %assignment.period_label,
            "Appended assignment"
        );
        Ok(assignment)
    }

    /// Rows of a pool matching `filter`, most recent first.
    pub async fn query(
        &self,
        pool_id: PoolId,
        filter: &AssignmentFilter,
    ) -> RotationResult<Vec<Assignment>> {
        Ok(self.store.query_assignments(pool_id, filter).await?)
    }

    /// The `limit` most recent rows of a pool.
    pub async fn recent(&self, pool_id: PoolId, limit: usize) -> RotationResult<Vec<Assignment>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = AssignmentFilter::default().limit(limit.min(MAX_HISTORY_LIMIT));
        self.query(pool_id, &filter).await
    }

    /// Record the response to an assignment as part of `tx`.
    #[instrument(skip(self, tx, response), fields(assignment_id = %response.assignment_id, kind = %response.kind))]
    pub async fn respond(
        &self,
        tx: &mut S::Tx,
        response: AssignmentResponse,
    ) -> RotationResult<AssignmentResponse> {
        tx.insert_response(&response).await?;
        debug!(pool_id = %response.pool_id, "Recorded response");
        Ok(response)
    }

    /// One assignment of a pool with its response.
    pub async fn entry(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> RotationResult<Option<LedgerEntry>> {
        Ok(self.store.find_entry(pool_id, assignment_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dutybot_id::{AssignmentId, LedgerSeq};

    fn row(member_id: MemberId, cycle: i32, week: u32) -> Assignment {
        Assignment {
            assignment_id: AssignmentId::new(),
            seq: LedgerSeq::new(1),
            pool_id: PoolId::new(),
            member_id,
            cycle_number: CycleNumber::try_new(cycle).unwrap(),
            period_label: PeriodLabel::new(2026, week).unwrap(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(AssignmentFilter::default().matches(&row(MemberId::new(), 3, 10)));
    }

    #[test]
    fn test_filter_combines_conditions() {
        let member = MemberId::new();
        let filter = AssignmentFilter::default()
            .member(member)
            .cycle(CycleNumber::try_new(2).unwrap());

        assert!(filter.matches(&row(member, 2, 10)));
        assert!(!filter.matches(&row(member, 1, 10)));
        assert!(!filter.matches(&row(MemberId::new(), 2, 10)));
    }

    #[test]
    fn test_period_filter() {
        let filter = AssignmentFilter::default().period(PeriodLabel::new(2026, 10).unwrap());
        assert!(filter.matches(&row(MemberId::new(), 1, 10)));
        assert!(!filter.matches(&row(MemberId::new(), 1, 11)));
    }
}
