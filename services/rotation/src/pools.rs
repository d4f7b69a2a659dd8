//! Pool and member registration.
//!
//! Members are never removed: leaving a pool flips `is_active`, so history
//! keeps resolving and a returning member keeps the flag it had.

use std::sync::Arc;

use dutybot_id::{MemberId, PoolId};
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::error::{RotationError, RotationResult};
use crate::model::{Member, NewMember, Pool};
use crate::rotation::RetryPolicy;
use crate::store::{finish, Storage, UnitOfWork};

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 255;

fn validate_text(field: &str, value: &str) -> RotationResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RotationError::InvalidInput(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(RotationError::InvalidInput(format!(
            "{field} must be at most {MAX_DISPLAY_NAME_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Persistence of pools and their members.
pub struct PoolStore<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<S: Storage> PoolStore<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    pub async fn get_pool(&self, pool_id: PoolId) -> RotationResult<Pool> {
        self.store
            .find_pool(pool_id)
            .await?
            .ok_or(RotationError::PoolNotFound(pool_id))
    }

    /// The pool of a chat group, created on first use.
    ///
    /// An existing pool whose display name differs is renamed.
    #[instrument(skip(self))]
    pub async fn get_or_create_pool(
        &self,
        group_ref: &str,
        display_name: &str,
    ) -> RotationResult<Pool> {
        let group_ref = validate_text("group reference", group_ref)?;
        let display_name = validate_text("pool name", display_name)?;
        let candidate = &Pool::new(&group_ref, &display_name, self.clock.now());
        // Conflicts are reported against the pool the group already has.
        let pool_id = match self.store.find_pool_by_group(&group_ref).await? {
            Some(existing) => existing.pool_id,
            None => candidate.pool_id,
        };

        self.retry
            .run(pool_id, move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.get_or_create_in(&mut tx, candidate).await;
                finish(tx, result).await
            })
            .await
    }

    async fn get_or_create_in(&self, tx: &mut S::Tx, candidate: &Pool) -> RotationResult<Pool> {
        match tx.find_pool_by_group(&candidate.group_ref).await? {
            Some(mut pool) => {
                if pool.display_name != candidate.display_name {
                    let now = self.clock.now();
                    tx.rename_pool(pool.pool_id, &candidate.display_name, now)
                        .await?;
                    debug!(pool_id = %pool.pool_id, from = %pool.display_name, to = %candidate.display_name, "Renamed pool");
                    pool.display_name = candidate.display_name.clone();
                    pool.updated_at = now;
                }
                Ok(pool)
            }
            None => {
                tx.insert_pool(candidate).await?;
                info!(pool_id = %candidate.pool_id, group_ref = %candidate.group_ref, "Created pool");
                Ok(candidate.clone())
            }
        }
    }

    /// Every pool, oldest first.
    pub async fn list_pools(&self) -> RotationResult<Vec<Pool>> {
        Ok(self.store.list_pools().await?)
    }

    /// Register a member, or bring a known one back.
    ///
    /// Matching is by external reference. A returning member is reactivated
    /// and renamed; whether it already served in the current cycle is kept.
    #[instrument(skip(self, member), fields(pool_id = %pool_id, external_ref = %member.external_ref))]
    pub async fn add_member(&self, pool_id: PoolId, member: NewMember) -> RotationResult<Member> {
        let member = &NewMember {
            external_ref: validate_text("external reference", &member.external_ref)?,
            display_name: validate_text("display name", &member.display_name)?,
        };

        self.retry
            .run(pool_id, move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.add_member_in(&mut tx, pool_id, member).await;
                finish(tx, result).await
            })
            .await
    }

    async fn add_member_in(
        &self,
        tx: &mut S::Tx,
        pool_id: PoolId,
        new: &NewMember,
    ) -> RotationResult<Member> {
        tx.lock_pool(pool_id)
            .await?
            .ok_or(RotationError::PoolNotFound(pool_id))?;

        let existing = tx
            .members(pool_id)
            .await?
            .into_iter()
            .find(|m| m.external_ref == new.external_ref);

        if let Some(mut member) = existing {
            if !member.is_active || member.display_name != new.display_name {
                tx.update_member(pool_id, member.member_id, &new.display_name, true)
                    .await?;
                info!(member_id = %member.member_id, reactivated = !member.is_active, "Updated member");
                member.display_name = new.display_name.clone();
                member.is_active = true;
            }
            return Ok(member);
        }

        let member = Member {
            member_id: MemberId::new(),
            pool_id,
            external_ref: new.external_ref.clone(),
            display_name: new.display_name.clone(),
            completed_this_cycle: false,
            is_active: true,
            joined_at: self.clock.now(),
        };
        tx.insert_member(&member).await?;
        info!(member_id = %member.member_id, "Added member");
        Ok(member)
    }

    /// Soft-delete a member. Returns false when it was already inactive.
    #[instrument(skip(self))]
    pub async fn deactivate_member(
        &self,
        pool_id: PoolId,
        member_id: MemberId,
    ) -> RotationResult<bool> {
        self.retry
            .run(pool_id, move || async move {
                let mut tx = self.store.begin().await?;
                let result = Self::deactivate_in(&mut tx, pool_id, member_id).await;
                finish(tx, result).await
            })
            .await
    }

    async fn deactivate_in(
        tx: &mut S::Tx,
        pool_id: PoolId,
        member_id: MemberId,
    ) -> RotationResult<bool> {
        tx.lock_pool(pool_id)
            .await?
            .ok_or(RotationError::PoolNotFound(pool_id))?;

        let member = tx
            .members(pool_id)
            .await?
            .into_iter()
            .find(|m| m.member_id == member_id)
            .ok_or(RotationError::MemberNotFound { pool_id, member_id })?;

        if !member.is_active {
            return Ok(false);
        }
        tx.update_member(pool_id, member_id, &member.display_name, false)
            .await?;
        info!("Deactivated member");
        Ok(true)
    }

    /// Active members in join order.
    pub async fn list_active_members(&self, pool_id: PoolId) -> RotationResult<Vec<Member>> {
        self.get_pool(pool_id).await?;
        Ok(self.store.list_members(pool_id, true).await?)
    }

    /// All members including inactive ones, in join order.
    pub async fn list_members(&self, pool_id: PoolId) -> RotationResult<Vec<Member>> {
        self.get_pool(pool_id).await?;
        Ok(self.store.list_members(pool_id, false).await?)
    }
}
