//! In-memory store.
//!
//! Backs tests and runs without a database. Units of work stage copies of the
//! pools they touch and publish them at commit; a pool whose version moved
//! since it was staged fails the commit with a conflict, which gives the same
//! retry behaviour as a lock timeout on Postgres.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dutybot_id::{AssignmentId, CycleNumber, LedgerSeq, MemberId, PoolId};
use tracing::debug;

use super::{Storage, StoreError, StoreResult, UnitOfWork};
use crate::ledger::AssignmentFilter;
use crate::model::{
    Assignment, AssignmentResponse, AssignmentStatus, LedgerEntry, Member, NewAssignment, Pool,
};
use crate::period::PeriodLabel;

#[derive(Debug, Clone)]
struct PoolRecord {
    pool: Pool,
    members: Vec<Member>,
    version: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    pools: HashMap<PoolId, PoolRecord>,
    groups: HashMap<String, PoolId>,
    assignments: Vec<Assignment>,
    responses: HashMap<AssignmentId, AssignmentResponse>,
}

fn lock(state: &Mutex<MemoryState>) -> StoreResult<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|_| StoreError::Corrupt("memory store mutex poisoned".to_string()))
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    seq: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    type Tx = MemoryUnitOfWork;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(MemoryUnitOfWork {
            state: Arc::clone(&self.state),
            seq: Arc::clone(&self.seq),
            staged: HashMap::new(),
            appended: Vec::new(),
            responded: Vec::new(),
        })
    }

    async fn find_pool(&self, pool_id: PoolId) -> StoreResult<Option<Pool>> {
        let state = lock(&self.state)?;
        Ok(state.pools.get(&pool_id).map(|r| r.pool.clone()))
    }

    async fn find_pool_by_group(&self, group_ref: &str) -> StoreResult<Option<Pool>> {
        let state = lock(&self.state)?;
        Ok(state
            .groups
            .get(group_ref)
            .and_then(|pool_id| state.pools.get(pool_id))
            .map(|r| r.pool.clone()))
    }

    async fn list_pools(&self) -> StoreResult<Vec<Pool>> {
        let state = lock(&self.state)?;
        let mut pools: Vec<Pool> = state.pools.values().map(|r| r.pool.clone()).collect();
        pools.sort_by(|a, b| (a.created_at, a.pool_id).cmp(&(b.created_at, b.pool_id)));
        Ok(pools)
    }

    async fn list_members(&self, pool_id: PoolId, active_only: bool) -> StoreResult<Vec<Member>> {
        let state = lock(&self.state)?;
        Ok(state
            .pools
            .get(&pool_id)
            .map(|r| {
                r.members
                    .iter()
                    .filter(|m| !active_only || m.is_active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_assignments(
        &self,
        pool_id: PoolId,
        filter: &AssignmentFilter,
    ) -> StoreResult<Vec<Assignment>> {
        let state = lock(&self.state)?;
        let mut rows: Vec<Assignment> = state
            .assignments
            .iter()
            .filter(|a| a.pool_id == pool_id && filter.matches(a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn find_entry(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>> {
        let state = lock(&self.state)?;
        Ok(state
            .assignments
            .iter()
            .find(|a| a.pool_id == pool_id && a.assignment_id == assignment_id)
            .map(|a| LedgerEntry {
                assignment: a.clone(),
                response: state.responses.get(&assignment_id).cloned(),
            }))
    }
}

#[derive(Debug)]
struct Staged {
    /// `None` for pools created inside this unit of work.
    base_version: Option<u64>,
    dirty: bool,
    record: PoolRecord,
}

/// Unit of work over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryUnitOfWork {
    state: Arc<Mutex<MemoryState>>,
    seq: Arc<AtomicI64>,
    staged: HashMap<PoolId, Staged>,
    appended: Vec<Assignment>,
    responded: Vec<AssignmentResponse>,
}

impl MemoryUnitOfWork {
    fn stage(&mut self, pool_id: PoolId) -> StoreResult<Option<&mut Staged>> {
        if !self.staged.contains_key(&pool_id) {
            let state = lock(&self.state)?;
            let Some(record) = state.pools.get(&pool_id) else {
                return Ok(None);
            };
            let staged = Staged {
                base_version: Some(record.version),
                dirty: false,
                record: record.clone(),
            };
            drop(state);
            self.staged.insert(pool_id, staged);
        }
        Ok(self.staged.get_mut(&pool_id))
    }

    fn stage_for_write(&mut self, pool_id: PoolId) -> StoreResult<&mut PoolRecord> {
        let staged = self
            .stage(pool_id)?
            .ok_or_else(|| StoreError::NotFound(format!("pool {pool_id}")))?;
        staged.dirty = true;
        Ok(&mut staged.record)
    }

    fn member_mut(
        &mut self,
        pool_id: PoolId,
        member_id: MemberId,
    ) -> StoreResult<&mut Member> {
        self.stage_for_write(pool_id)?
            .members
            .iter_mut()
            .find(|m| m.member_id == member_id)
            .ok_or_else(|| StoreError::NotFound(format!("member {member_id}")))
    }

    /// Committed and staged ledger rows of a pool matching `keep`, joined
    /// with their responses, oldest first.
    fn entries(
        &self,
        pool_id: PoolId,
        keep: impl Fn(&Assignment) -> bool,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let state = lock(&self.state)?;
        let response = |id: AssignmentId| {
            self.responded
                .iter()
                .find(|r| r.assignment_id == id)
                .or_else(|| state.responses.get(&id))
                .cloned()
        };
        Ok(state
            .assignments
            .iter()
            .chain(&self.appended)
            .filter(|a| a.pool_id == pool_id && keep(a))
            .map(|a| LedgerEntry {
                assignment: a.clone(),
                response: response(a.assignment_id),
            })
            .collect())
    }

    fn has_assignment(&self, entry: &NewAssignment) -> StoreResult<bool> {
        let same = self.entries(entry.pool_id, |a| {
            a.member_id == entry.member_id && a.cycle_number == entry.cycle_number
        })?;
        Ok(same.iter().any(|e| e.status().counts_as_served()))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_pool(&mut self, pool_id: PoolId) -> StoreResult<Option<Pool>> {
        Ok(self.stage(pool_id)?.map(|s| s.record.pool.clone()))
    }

    async fn find_pool_by_group(&mut self, group_ref: &str) -> StoreResult<Option<Pool>> {
        if let Some(staged) = self
            .staged
            .values()
            .find(|s| s.record.pool.group_ref == group_ref)
        {
            return Ok(Some(staged.record.pool.clone()));
        }
        let pool_id = {
            let state = lock(&self.state)?;
            state.groups.get(group_ref).copied()
        };
        match pool_id {
            Some(pool_id) => self.lock_pool(pool_id).await,
            None => Ok(None),
        }
    }

    async fn insert_pool(&mut self, pool: &Pool) -> StoreResult<()> {
        if self.find_pool_by_group(&pool.group_ref).await?.is_some() {
            return Err(StoreError::Conflict(format!(
                "group {} already has a pool",
                pool.group_ref
            )));
        }
        self.staged.insert(
            pool.pool_id,
            Staged {
                base_version: None,
                dirty: true,
                record: PoolRecord {
                    pool: pool.clone(),
                    members: Vec::new(),
                    version: 0,
                },
            },
        );
        Ok(())
    }

    async fn rename_pool(
        &mut self,
        pool_id: PoolId,
        display_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let record = self.stage_for_write(pool_id)?;
        record.pool.display_name = display_name.to_string();
        record.pool.updated_at = at;
        Ok(())
    }

    async fn members(&mut self, pool_id: PoolId) -> StoreResult<Vec<Member>> {
        Ok(self
            .stage(pool_id)?
            .map(|s| s.record.members.clone())
            .unwrap_or_default())
    }

    async fn insert_member(&mut self, member: &Member) -> StoreResult<()> {
        let record = self.stage_for_write(member.pool_id)?;
        if record
            .members
            .iter()
            .any(|m| m.external_ref == member.external_ref)
        {
            return Err(StoreError::Conflict(format!(
                "{} is already registered in pool {}",
                member.external_ref, member.pool_id
            )));
        }
        record.members.push(member.clone());
        Ok(())
    }

    async fn update_member(
        &mut self,
        pool_id: PoolId,
        member_id: MemberId,
        display_name: &str,
        is_active: bool,
    ) -> StoreResult<()> {
        let member = self.member_mut(pool_id, member_id)?;
        member.display_name = display_name.to_string();
        member.is_active = is_active;
        Ok(())
    }

    async fn advance_cycle(
        &mut self,
        pool_id: PoolId,
        expected: CycleNumber,
        at: DateTime<Utc>,
    ) -> StoreResult<CycleNumber> {
        let record = self.stage_for_write(pool_id)?;
        if record.pool.current_cycle != expected {
            return Err(StoreError::Conflict(format!(
                "pool {pool_id} is in cycle {}, expected {expected}",
                record.pool.current_cycle
            )));
        }
        record.pool.current_cycle = expected.next();
        record.pool.updated_at = at;
        for member in &mut record.members {
            member.completed_this_cycle = false;
        }
        Ok(record.pool.current_cycle)
    }

    async fn mark_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()> {
        let member = self.member_mut(pool_id, member_id)?;
        if !member.is_eligible() {
            return Err(StoreError::Conflict(format!(
                "member {member_id} is no longer eligible"
            )));
        }
        member.completed_this_cycle = true;
        Ok(())
    }

    async fn clear_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()> {
        self.member_mut(pool_id, member_id)?.completed_this_cycle = false;
        Ok(())
    }

    async fn insert_assignment(&mut self, entry: &NewAssignment) -> StoreResult<Assignment> {
        // Touch the pool so a concurrent writer invalidates this unit.
        self.stage_for_write(entry.pool_id)?;
        if self.has_assignment(entry)? {
            return Err(StoreError::DuplicateAssignment {
                pool_id: entry.pool_id,
                member_id: entry.member_id,
                cycle_number: entry.cycle_number,
            });
        }
        let assignment = Assignment {
            assignment_id: AssignmentId::new(),
            seq: LedgerSeq::new(self.seq.fetch_add(1, Ordering::SeqCst) + 1),
            pool_id: entry.pool_id,
            member_id: entry.member_id,
            cycle_number: entry.cycle_number,
            period_label: entry.period_label,
            created_at: entry.created_at,
        };
        self.appended.push(assignment.clone());
        Ok(assignment)
    }

    async fn entry(
        &mut self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>> {
        self.stage(pool_id)?;
        Ok(self
            .entries(pool_id, |a| a.assignment_id == assignment_id)?
            .into_iter()
            .next())
    }

    async fn period_entries(
        &mut self,
        pool_id: PoolId,
        period: PeriodLabel,
    ) -> StoreResult<Vec<LedgerEntry>> {
        self.stage(pool_id)?;
        self.entries(pool_id, |a| a.period_label == period)
    }

    async fn insert_response(&mut self, response: &AssignmentResponse) -> StoreResult<()> {
        self.stage_for_write(response.pool_id)?;
        let existing = self.entries(response.pool_id, |a| {
            a.assignment_id == response.assignment_id
        })?;
        let Some(entry) = existing.first() else {
            return Err(StoreError::NotFound(format!(
                "assignment {}",
                response.assignment_id
            )));
        };
        if entry.status() != AssignmentStatus::Pending {
            return Err(StoreError::DuplicateResponse {
                assignment_id: response.assignment_id,
            });
        }
        self.responded.push(response.clone());
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        let mut state = lock(&self.state)?;

        for (pool_id, staged) in &self.staged {
            let current = state.pools.get(pool_id).map(|r| r.version);
            if current != staged.base_version {
                return Err(StoreError::Conflict(format!(
                    "pool {pool_id} changed since it was read"
                )));
            }
            if staged.base_version.is_none() && state.groups.contains_key(&staged.record.pool.group_ref)
            {
                return Err(StoreError::Conflict(format!(
                    "group {} already has a pool",
                    staged.record.pool.group_ref
                )));
            }
        }

        let mut written = 0usize;
        for (pool_id, staged) in self.staged {
            if !staged.dirty {
                continue;
            }
            let mut record = staged.record;
            record.version = staged.base_version.map_or(1, |v| v + 1);
            state.groups.insert(record.pool.group_ref.clone(), pool_id);
            state.pools.insert(pool_id, record);
            written += 1;
        }
        let appended = self.appended.len();
        state.assignments.extend(self.appended);
        let responded = self.responded.len();
        for response in self.responded {
            state.responses.insert(response.assignment_id, response);
        }

        debug!(
            pools_written = written,
            assignments_appended = appended,
            responses_recorded = responded,
            "Committed unit of work"
        );
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        debug!(
            pools_staged = self.staged.len(),
            "Discarding unit of work"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseKind;

    fn member(pool_id: PoolId, name: &str, now: DateTime<Utc>) -> Member {
        Member {
            member_id: MemberId::new(),
            pool_id,
            external_ref: name.to_lowercase(),
            display_name: name.to_string(),
            completed_this_cycle: false,
            is_active: true,
            joined_at: now,
        }
    }

    async fn seeded_pool(store: &MemoryStore) -> (Pool, Member) {
        let now = Utc::now();
        let pool = Pool::new("group-1", "Team", now);
        let alice = member(pool.pool_id, "Alice", now);
        let mut tx = store.begin().await.unwrap();
        tx.insert_pool(&pool).await.unwrap();
        tx.insert_member(&alice).await.unwrap();
        tx.commit().await.unwrap();
        (pool, alice)
    }

    #[tokio::test]
    async fn test_uncommitted_work_is_invisible() {
        let store = MemoryStore::new();
        let (pool, alice) = seeded_pool(&store).await;

        let mut tx = store.begin().await.unwrap();
        tx.mark_completed(pool.pool_id, alice.member_id).await.unwrap();
        tx.rollback().await.unwrap();

        let members = store.list_members(pool.pool_id, true).await.unwrap();
        assert!(!members[0].completed_this_cycle);
    }

    #[tokio::test]
    async fn test_stale_unit_of_work_conflicts() {
        let store = MemoryStore::new();
        let (pool, alice) = seeded_pool(&store).await;

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.lock_pool(pool.pool_id).await.unwrap();
        second.lock_pool(pool.pool_id).await.unwrap();

        second
            .mark_completed(pool.pool_id, alice.member_id)
            .await
            .unwrap();
        second.commit().await.unwrap();

        first
            .advance_cycle(pool.pool_id, CycleNumber::FIRST, Utc::now())
            .await
            .unwrap();
        let err = first.commit().await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.find_pool(pool.pool_id).await.unwrap().unwrap();
        assert_eq!(stored.current_cycle, CycleNumber::FIRST);
    }

    #[tokio::test]
    async fn test_duplicate_assignment_rejected() {
        let store = MemoryStore::new();
        let (pool, alice) = seeded_pool(&store).await;
        let entry = NewAssignment {
            pool_id: pool.pool_id,
            member_id: alice.member_id,
            cycle_number: CycleNumber::FIRST,
            period_label: PeriodLabel::containing(Utc::now()),
            created_at: Utc::now(),
        };

        let mut tx = store.begin().await.unwrap();
        tx.insert_assignment(&entry).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_assignment(&entry).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAssignment { .. }));
    }

    #[tokio::test]
    async fn test_replaced_row_frees_the_cycle_slot() {
        let store = MemoryStore::new();
        let (pool, alice) = seeded_pool(&store).await;
        let entry = NewAssignment {
            pool_id: pool.pool_id,
            member_id: alice.member_id,
            cycle_number: CycleNumber::FIRST,
            period_label: PeriodLabel::containing(Utc::now()),
            created_at: Utc::now(),
        };

        let mut tx = store.begin().await.unwrap();
        let first = tx.insert_assignment(&entry).await.unwrap();
        tx.insert_response(&AssignmentResponse {
            assignment_id: first.assignment_id,
            pool_id: pool.pool_id,
            kind: ResponseKind::Replaced,
            responded_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.insert_assignment(&entry).await.unwrap();
        tx.commit().await.unwrap();

        let entries = store
            .begin()
            .await
            .unwrap()
            .period_entries(pool.pool_id, entry.period_label)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status(), AssignmentStatus::Replaced);
        assert_eq!(entries[1].status(), AssignmentStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_response_rejected() {
        let store = MemoryStore::new();
        let (pool, alice) = seeded_pool(&store).await;
        let mut tx = store.begin().await.unwrap();
        let row = tx
            .insert_assignment(&NewAssignment {
                pool_id: pool.pool_id,
                member_id: alice.member_id,
                cycle_number: CycleNumber::FIRST,
                period_label: PeriodLabel::containing(Utc::now()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let response = |kind| AssignmentResponse {
            assignment_id: row.assignment_id,
            pool_id: pool.pool_id,
            kind,
            responded_at: Utc::now(),
        };
        let mut tx = store.begin().await.unwrap();
        tx.insert_response(&response(ResponseKind::Confirmed))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert_response(&response(ResponseKind::Declined))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateResponse { .. }));

        let stored = store
            .find_entry(pool.pool_id, row.assignment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status(), AssignmentStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_second_pool_for_group_conflicts() {
        let store = MemoryStore::new();
        seeded_pool(&store).await;

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert_pool(&Pool::new("group-1", "Other", Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
