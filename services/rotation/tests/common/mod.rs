#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dutybot_id::{AssignmentId, CycleNumber, MemberId, PoolId};
use dutybot_rotation::clock::ManualClock;
use dutybot_rotation::ledger::AssignmentFilter;
use dutybot_rotation::model::{
    Assignment, AssignmentResponse, LedgerEntry, Member, NewAssignment, NewMember, Pool,
};
use dutybot_rotation::period::PeriodLabel;
use dutybot_rotation::rotation::{EngineConfig, RotationEngine, SeededRandom};
use dutybot_rotation::store::{
    MemoryStore, MemoryUnitOfWork, Storage, StoreError, StoreResult, UnitOfWork,
};

/// Monday of ISO week 2026-W42, 10:00 UTC.
pub fn week_42_monday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 12, 10, 0, 0).unwrap()
}

pub struct Harness<S: Storage = MemoryStore> {
    pub engine: Arc<RotationEngine<S>>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<S>,
}

pub fn harness(seed: u64) -> Harness {
    harness_on(MemoryStore::new(), seed)
}

pub fn harness_on<S: Storage>(store: S, seed: u64) -> Harness<S> {
    harness_with(store, seed, EngineConfig::default())
}

pub fn harness_with<S: Storage>(store: S, seed: u64, config: EngineConfig) -> Harness<S> {
    let store = Arc::new(store);
    let clock = Arc::new(ManualClock::new(week_42_monday()));
    let engine = RotationEngine::with_sources(
        Arc::clone(&store),
        config,
        Arc::new(SeededRandom::new(seed)),
        clock.clone(),
    );
    Harness {
        engine: Arc::new(engine),
        clock,
        store,
    }
}

/// Create a pool for `group` and register `names` in order.
pub async fn pool_with<S: Storage>(
    engine: &RotationEngine<S>,
    group: &str,
    names: &[&str],
) -> (Pool, Vec<Member>) {
    let pool = engine
        .pools()
        .get_or_create_pool(group, &format!("Pool {group}"))
        .await
        .unwrap();
    let mut members = Vec::new();
    for name in names {
        let member = engine
            .pools()
            .add_member(pool.pool_id, NewMember::new(name.to_lowercase(), *name))
            .await
            .unwrap();
        members.push(member);
    }
    (pool, members)
}

/// Failures a [`FaultyStore`] injects. All off by default.
#[derive(Debug, Default)]
pub struct Faults {
    /// Number of upcoming commits that report a write conflict.
    pub commit_conflicts: AtomicU32,
    /// Milliseconds every commit sleeps before going through.
    pub commit_delay_ms: AtomicU64,
    /// Pool whose period reads fail.
    pub broken_pool: Mutex<Option<PoolId>>,
}

impl Faults {
    pub fn conflict_next(&self, commits: u32) {
        self.commit_conflicts.store(commits, Ordering::SeqCst);
    }

    pub fn delay_commits(&self, delay: StdDuration) {
        self.commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn break_pool(&self, pool_id: PoolId) {
        *self.broken_pool.lock().unwrap() = Some(pool_id);
    }

    pub fn clear(&self) {
        self.commit_conflicts.store(0, Ordering::SeqCst);
        self.commit_delay_ms.store(0, Ordering::SeqCst);
        *self.broken_pool.lock().unwrap() = None;
    }
}

/// Memory store with injectable failures.
pub struct FaultyStore {
    inner: MemoryStore,
    pub faults: Arc<Faults>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            faults: Arc::new(Faults::default()),
        }
    }
}

pub struct FaultyUnitOfWork {
    inner: MemoryUnitOfWork,
    faults: Arc<Faults>,
}

#[async_trait]
impl Storage for FaultyStore {
    type Tx = FaultyUnitOfWork;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(FaultyUnitOfWork {
            inner: self.inner.begin().await?,
            faults: Arc::clone(&self.faults),
        })
    }

    async fn find_pool(&self, pool_id: PoolId) -> StoreResult<Option<Pool>> {
        self.inner.find_pool(pool_id).await
    }

    async fn find_pool_by_group(&self, group_ref: &str) -> StoreResult<Option<Pool>> {
        self.inner.find_pool_by_group(group_ref).await
    }

    async fn list_pools(&self) -> StoreResult<Vec<Pool>> {
        self.inner.list_pools().await
    }

    async fn list_members(&self, pool_id: PoolId, active_only: bool) -> StoreResult<Vec<Member>> {
        self.inner.list_members(pool_id, active_only).await
    }

    async fn query_assignments(
        &self,
        pool_id: PoolId,
        filter: &AssignmentFilter,
    ) -> StoreResult<Vec<Assignment>> {
        self.inner.query_assignments(pool_id, filter).await
    }

    async fn find_entry(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>> {
        self.inner.find_entry(pool_id, assignment_id).await
    }
}

#[async_trait]
impl UnitOfWork for FaultyUnitOfWork {
    async fn lock_pool(&mut self, pool_id: PoolId) -> StoreResult<Option<Pool>> {
        self.inner.lock_pool(pool_id).await
    }

    async fn find_pool_by_group(&mut self, group_ref: &str) -> StoreResult<Option<Pool>> {
        self.inner.find_pool_by_group(group_ref).await
    }

    async fn insert_pool(&mut self, pool: &Pool) -> StoreResult<()> {
        self.inner.insert_pool(pool).await
    }

    async fn rename_pool(
        &mut self,
        pool_id: PoolId,
        display_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.rename_pool(pool_id, display_name, at).await
    }

    async fn members(&mut self, pool_id: PoolId) -> StoreResult<Vec<Member>> {
        self.inner.members(pool_id).await
    }

    async fn insert_member(&mut self, member: &Member) -> StoreResult<()> {
        self.inner.insert_member(member).await
    }

    async fn update_member(
        &mut self,
        pool_id: PoolId,
        member_id: MemberId,
        display_name: &str,
        is_active: bool,
    ) -> StoreResult<()> {
        self.inner
            .update_member(pool_id, member_id, display_name, is_active)
            .await
    }

    async fn advance_cycle(
        &mut self,
        pool_id: PoolId,
        expected: CycleNumber,
        at: DateTime<Utc>,
    ) -> StoreResult<CycleNumber> {
        self.inner.advance_cycle(pool_id, expected, at).await
    }

    async fn mark_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()> {
        self.inner.mark_completed(pool_id, member_id).await
    }

    async fn clear_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()> {
        self.inner.clear_completed(pool_id, member_id).await
    }

    async fn insert_assignment(&mut self, entry: &NewAssignment) -> StoreResult<Assignment> {
        self.inner.insert_assignment(entry).await
    }

    async fn entry(
        &mut self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>> {
        self.inner.entry(pool_id, assignment_id).await
    }

    async fn period_entries(
        &mut self,
        pool_id: PoolId,
        period: PeriodLabel,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let broken = *self.faults.broken_pool.lock().unwrap();
        if broken == Some(pool_id) {
            return Err(StoreError::Corrupt(format!("injected read failure for {pool_id}")));
        }
        self.inner.period_entries(pool_id, period).await
    }

    async fn insert_response(&mut self, response: &AssignmentResponse) -> StoreResult<()> {
        self.inner.insert_response(response).await
    }

    async fn commit(self) -> StoreResult<()> {
        let delay = self.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
        }
        let remaining = self.faults.commit_conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.faults
                .commit_conflicts
                .store(remaining - 1, Ordering::SeqCst);
            self.inner.rollback().await?;
            return Err(StoreError::Conflict("injected".to_string()));
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> StoreResult<()> {
        self.inner.rollback().await
    }
}
