//! The rotation engine.
//!
//! Selection for one pool runs as a single unit of work:
//!
//! 1. Lock the pool row and load its members
//! 2. For a pick aimed at a chosen week, check the week is free (a forced
//!    pick replaces its holder instead)
//! 3. Partition active members into eligible (not completed this cycle) and the rest
//! 4. If nobody is eligible, start the next cycle: bump the cycle number and
//!    clear every completed flag
//! 5. Choose the assignee from the eligible set
//! 6. Flag the assignee as completed and append the ledger row
//!
//! Calls for the same pool, including confirmations and declines, are
//! serialized by an in-process lock; the unit of work is retried on storage
//! conflicts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dutybot_id::{AssignmentId, MemberId, PoolId};
use tracing::{debug, info, instrument};

use super::lock::PoolLocks;
use super::random::{RandomSource, ThreadRandom};
use super::retry::RetryPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::{RotationError, RotationResult};
use crate::ledger::AssignmentLedger;
use crate::model::{
    Assignment, AssignmentResponse, AssignmentResult, AssignmentStatus, LedgerEntry, Member,
    NewAssignment, Pool, ResponseKind,
};
use crate::period::PeriodLabel;
use crate::pools::PoolStore;
use crate::store::{finish, Storage, UnitOfWork};

/// Default wait for the per-pool rotation lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a mutating call waits for another call on the same pool.
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Who gets the duty.
#[derive(Debug, Clone, Copy)]
enum Choice {
    Random,
    Member(MemberId),
}

/// Which week the duty is for.
#[derive(Debug, Clone, Copy)]
enum Slot {
    /// The week of the current time, regardless of earlier picks in it.
    Current,
    /// A chosen week that must not already be held, unless forced.
    Period { period: PeriodLabel, force: bool },
}

/// Fair, non-repeating duty selection over the pools of a store.
pub struct RotationEngine<S: Storage> {
    store: Arc<S>,
    pools: PoolStore<S>,
    ledger: AssignmentLedger<S>,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    locks: PoolLocks,
    config: EngineConfig,
}

impl<S: Storage> RotationEngine<S> {
    /// Engine with the thread RNG and the system clock.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self::with_sources(store, config, Arc::new(ThreadRandom), Arc::new(SystemClock))
    }

    /// Engine with explicit random and time sources.
    pub fn with_sources(
        store: Arc<S>,
        config: EngineConfig,
        random: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pools: PoolStore::new(Arc::clone(&store), Arc::clone(&clock), config.retry),
            ledger: AssignmentLedger::new(Arc::clone(&store)),
            store,
            random,
            clock,
            locks: PoolLocks::default(),
            config,
        }
    }

    /// Registration operations on the same store.
    pub fn pools(&self) -> &PoolStore<S> {
        &self.pools
    }

    pub fn ledger(&self) -> &AssignmentLedger<S> {
        &self.ledger
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Select the next assignee of a pool at random among eligible members.
    ///
    /// The assignment is labeled with the current week. Earlier picks in the
    /// same week do not block it; use [`Self::select_for_period`] for that.
    ///
    /// # Errors
    ///
    /// - `PoolNotFound` for an unknown pool
    /// - `EmptyPool` when the pool has no active members
    /// - `LockTimeout` / `ConcurrencyConflict` under contention
    #[instrument(skip(self), fields(pool_id = %pool_id))]
    pub async fn select_next(&self, pool_id: PoolId) -> RotationResult<AssignmentResult> {
        self.rotate(pool_id, Choice::Random, Slot::Current).await
    }

    /// Assign a specific member, keeping the no-repeat rule of the cycle.
    ///
    /// # Errors
    ///
    /// Same as [`Self::select_next`], plus `MemberNotFound` when the member is
    /// not active in the pool and `AlreadyServed` when it already served in
    /// the current cycle.
    #[instrument(skip(self), fields(pool_id = %pool_id, member_id = %member_id))]
    pub async fn assign_member(
        &self,
        pool_id: PoolId,
        member_id: MemberId,
    ) -> RotationResult<AssignmentResult> {
        self.rotate(pool_id, Choice::Member(member_id), Slot::Current)
            .await
    }

    /// Select at random for a given week.
    ///
    /// Refused with `PeriodTaken` while the week has a pending or confirmed
    /// assignment. After a decline the week is open again, and members who
    /// declined it are not picked for it a second time (`NoCandidates` when
    /// nobody else is eligible).
    #[instrument(skip(self), fields(pool_id = %pool_id, period = %period))]
    pub async fn select_for_period(
        &self,
        pool_id: PoolId,
        period: PeriodLabel,
    ) -> RotationResult<AssignmentResult> {
        self.rotate(pool_id, Choice::Random, Slot::Period { period, force: false })
            .await
    }

    /// Assign a specific member for a given week.
    ///
    /// Without `force` a held week is refused with `PeriodTaken`. With
    /// `force` the holder is marked replaced and, if it was made in the
    /// current cycle, its member becomes eligible again.
    #[instrument(skip(self), fields(pool_id = %pool_id, member_id = %member_id, period = %period))]
    pub async fn assign_member_for_period(
        &self,
        pool_id: PoolId,
        member_id: MemberId,
        period: PeriodLabel,
        force: bool,
    ) -> RotationResult<AssignmentResult> {
        self.rotate(pool_id, Choice::Member(member_id), Slot::Period { period, force })
            .await
    }

    /// The assigned member accepts the duty.
    #[instrument(skip(self), fields(pool_id = %pool_id, assignment_id = %assignment_id))]
    pub async fn confirm(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> RotationResult<AssignmentResponse> {
        self.respond(pool_id, assignment_id, ResponseKind::Confirmed)
            .await
    }

    /// The assigned member turns the duty down.
    ///
    /// The member still counts as having served this cycle; the week becomes
    /// available to [`Self::select_for_period`].
    #[instrument(skip(self), fields(pool_id = %pool_id, assignment_id = %assignment_id))]
    pub async fn decline(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> RotationResult<AssignmentResponse> {
        self.respond(pool_id, assignment_id, ResponseKind::Declined)
            .await
    }

    /// One assignment with its response.
    pub async fn get_assignment(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> RotationResult<LedgerEntry> {
        self.ledger
            .entry(pool_id, assignment_id)
            .await?
            .ok_or(RotationError::AssignmentNotFound {
                pool_id,
                assignment_id,
            })
    }

    /// The most recent assignments of a pool, newest first.
    pub async fn get_history(&self, pool_id: PoolId, limit: usize) -> RotationResult<Vec<Assignment>> {
        self.pools.get_pool(pool_id).await?;
        self.ledger.recent(pool_id, limit).await
    }

    /// Members that can be chosen right now, in join order.
    ///
    /// Empty when every active member has served in the current cycle; the
    /// next selection will then start a new cycle.
    pub async fn preview_eligible(&self, pool_id: PoolId) -> RotationResult<Vec<Member>> {
        self.pools.get_pool(pool_id).await?;
        let members = self.store.list_members(pool_id, true).await?;
        Ok(members.into_iter().filter(Member::is_eligible).collect())
    }

    /// Run `op` holding the pool's lock, retrying it on storage conflicts.
    async fn serialized<T, F, Fut>(&self, pool_id: PoolId, op: F) -> RotationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RotationResult<T>>,
    {
        let _guard = self.locks.acquire(pool_id, self.config.lock_timeout).await?;
        self.config.retry.run(pool_id, op).await
    }

    async fn rotate(
        &self,
        pool_id: PoolId,
        choice: Choice,
        slot: Slot,
    ) -> RotationResult<AssignmentResult> {
        let result = self
            .serialized(pool_id, move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.apply(&mut tx, pool_id, choice, slot).await;
                finish(tx, result).await
            })
            .await?;

        info!(
            member_id = %result.member_id,
            member = %result.display_name,
            cycle = %result.cycle_number,
            period = %result.period_label,
            cycle_reset = result.cycle_reset,
            "Duty assigned"
        );
        Ok(result)
    }

    async fn respond(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
        kind: ResponseKind,
    ) -> RotationResult<AssignmentResponse> {
        let response = self
            .serialized(pool_id, move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.record_response(&mut tx, pool_id, assignment_id, kind).await;
                finish(tx, result).await
            })
            .await?;

        info!(kind = %response.kind, "Assignment answered");
        Ok(response)
    }

    async fn record_response(
        &self,
        tx: &mut S::Tx,
        pool_id: PoolId,
        assignment_id: AssignmentId,
        kind: ResponseKind,
    ) -> RotationResult<AssignmentResponse> {
        tx.lock_pool(pool_id)
            .await?
            .ok_or(RotationError::PoolNotFound(pool_id))?;
        let entry = tx
            .entry(pool_id, assignment_id)
            .await?
            .ok_or(RotationError::AssignmentNotFound {
                pool_id,
                assignment_id,
            })?;

        let status = entry.status();
        if status != AssignmentStatus::Pending {
            return Err(RotationError::AlreadyResponded {
                assignment_id,
                status,
            });
        }

        let response = AssignmentResponse {
            assignment_id,
            pool_id,
            kind,
            responded_at: self.clock.now(),
        };
        self.ledger.respond(tx, response).await
    }

    async fn apply(
        &self,
        tx: &mut S::Tx,
        pool_id: PoolId,
        choice: Choice,
        slot: Slot,
    ) -> RotationResult<AssignmentResult> {
        let pool = tx
            .lock_pool(pool_id)
            .await?
            .ok_or(RotationError::PoolNotFound(pool_id))?;

        let mut active: Vec<Member> = tx
            .members(pool_id)
            .await?
            .into_iter()
            .filter(|m| m.is_active)
            .collect();
        if active.is_empty() {
            return Err(RotationError::EmptyPool(pool_id));
        }

        if let Choice::Member(member_id) = choice {
            if !active.iter().any(|m| m.member_id == member_id) {
                return Err(RotationError::MemberNotFound { pool_id, member_id });
            }
        }

        let now = self.clock.now();
        let (period_label, declined) = match slot {
            Slot::Current => (PeriodLabel::containing(now), Vec::new()),
            Slot::Period { period, force } => {
                let declined = self
                    .claim_period(tx, &pool, &mut active, period, force, now)
                    .await?;
                (period, declined)
            }
        };

        let mut cycle = pool.current_cycle;
        let cycle_reset = !active.iter().any(Member::is_eligible);
        if cycle_reset {
            cycle = tx.advance_cycle(pool_id, pool.current_cycle, now).await?;
            debug!(from = %pool.current_cycle, to = %cycle, "Cycle complete, starting next");
        }

        // After a reset every active member is eligible again.
        let eligible: Vec<&Member> = active
            .iter()
            .filter(|m| cycle_reset || !m.completed_this_cycle)
            .collect();

        let chosen = match choice {
            Choice::Random => {
                let candidates: Vec<&Member> = eligible
                    .into_iter()
                    .filter(|m| !declined.contains(&m.member_id))
                    .collect();
                if candidates.is_empty() {
                    return Err(RotationError::NoCandidates {
                        pool_id,
                        period: period_label,
                    });
                }
                let index = self.random.choose_index(candidates.len());
                candidates[index.min(candidates.len() - 1)]
            }
            Choice::Member(member_id) => eligible
                .iter()
                .copied()
                .find(|m| m.member_id == member_id)
                .ok_or(RotationError::AlreadyServed { member_id, cycle })?,
        };

        tx.mark_completed(pool_id, chosen.member_id).await?;

        let assignment = self
            .ledger
            .append(
                tx,
                NewAssignment {
                    pool_id,
                    member_id: chosen.member_id,
                    cycle_number: cycle,
                    period_label,
                    created_at: now,
                },
            )
            .await?;

        Ok(AssignmentResult {
            assignment_id: assignment.assignment_id,
            pool_id,
            member_id: chosen.member_id,
            display_name: chosen.display_name.clone(),
            cycle_number: cycle,
            period_label,
            cycle_reset,
            assigned_at: now,
        })
    }

    /// Make sure `period` is free for a new assignment.
    ///
    /// A held period fails with `PeriodTaken`, or with `force` gets its
    /// holder marked replaced. Returns the members who declined the period.
    async fn claim_period(
        &self,
        tx: &mut S::Tx,
        pool: &Pool,
        active: &mut [Member],
        period: PeriodLabel,
        force: bool,
        now: DateTime<Utc>,
    ) -> RotationResult<Vec<MemberId>> {
        let entries = tx.period_entries(pool.pool_id, period).await?;

        if let Some(held) = entries.iter().find(|e| e.status().holds_period()) {
            let holder = &held.assignment;
            if !force {
                return Err(RotationError::PeriodTaken {
                    pool_id: pool.pool_id,
                    period,
                    assignment_id: holder.assignment_id,
                    status: held.status(),
                });
            }

            self.ledger
                .respond(
                    tx,
                    AssignmentResponse {
                        assignment_id: holder.assignment_id,
                        pool_id: pool.pool_id,
                        kind: ResponseKind::Replaced,
                        responded_at: now,
                    },
                )
                .await?;

            // The replaced turn no longer counts for its cycle.
            if holder.cycle_number == pool.current_cycle {
                tx.clear_completed(pool.pool_id, holder.member_id).await?;
                if let Some(member) = active.iter_mut().find(|m| m.member_id == holder.member_id) {
                    member.completed_this_cycle = false;
                }
            }
            info!(
                replaced = %holder.assignment_id,
                member_id = %holder.member_id,
                "Replacing assignment"
            );
        }

        Ok(entries
            .iter()
            .filter(|e| e.status() == AssignmentStatus::Declined)
            .map(|e| e.assignment.member_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::NewMember;
    use crate::rotation::SeededRandom;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn engine() -> RotationEngine<MemoryStore> {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 12, 10, 0, 0).unwrap());
        RotationEngine::with_sources(
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
            Arc::new(SeededRandom::new(3)),
            Arc::new(clock),
        )
    }

    #[tokio::test]
    async fn test_single_member_resets_every_call() {
        let engine = engine();
        let pool = engine.pools().get_or_create_pool("g", "Solo").await.unwrap();
        let only = engine
            .pools()
            .add_member(pool.pool_id, NewMember::new("1", "Only"))
            .await
            .unwrap();

        let first = engine.select_next(pool.pool_id).await.unwrap();
        assert_eq!(first.member_id, only.member_id);
        assert_eq!(first.cycle_number.value(), 1);
        assert!(!first.cycle_reset);

        for expected in 2..=4 {
            let next = engine.select_next(pool.pool_id).await.unwrap();
            assert_eq!(next.member_id, only.member_id);
            assert_eq!(next.cycle_number.value(), expected);
            assert!(next.cycle_reset);
        }
    }

    #[tokio::test]
    async fn test_assign_member_rejects_repeat() {
        let engine = engine();
        let pool = engine.pools().get_or_create_pool("g", "Pair").await.unwrap();
        let a = engine
            .pools()
            .add_member(pool.pool_id, NewMember::new("a", "A"))
            .await
            .unwrap();
        engine
            .pools()
            .add_member(pool.pool_id, NewMember::new("b", "B"))
            .await
            .unwrap();

        engine.assign_member(pool.pool_id, a.member_id).await.unwrap();
        let err = engine
            .assign_member(pool.pool_id, a.member_id)
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::AlreadyServed { .. }));

        // The failed call left no trace.
        let history = engine.get_history(pool.pool_id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_pool() {
        let engine = engine();
        let missing = PoolId::new();
        assert!(matches!(
            engine.select_next(missing).await,
            Err(RotationError::PoolNotFound(id)) if id == missing
        ));
        assert!(matches!(
            engine.get_history(missing, 5).await,
            Err(RotationError::PoolNotFound(_))
        ));
        assert!(matches!(
            engine.preview_eligible(missing).await,
            Err(RotationError::PoolNotFound(_))
        ));
    }
}
