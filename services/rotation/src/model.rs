//! Pool, member and assignment records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dutybot_id::{AssignmentId, CycleNumber, LedgerSeq, MemberId, PoolId};
use serde::Serialize;
use thiserror::Error;

use crate::period::PeriodLabel;

/// One group's rotation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pool {
    pub pool_id: PoolId,
    /// External chat identifier of the group. Unique across pools.
    pub group_ref: String,
    pub display_name: String,
    pub current_cycle: CycleNumber,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub(crate) fn new(group_ref: &str, display_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            pool_id: PoolId::new(),
            group_ref: group_ref.to_string(),
            display_name: display_name.to_string(),
            current_cycle: CycleNumber::FIRST,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A participant of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub member_id: MemberId,
    pub pool_id: PoolId,
    /// External chat identifier of the user. Unique within the pool.
    pub external_ref: String,
    pub display_name: String,
    pub completed_this_cycle: bool,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    /// Active and not yet selected in the current cycle.
    pub fn is_eligible(&self) -> bool {
        self.is_active && !self.completed_this_cycle
    }
}

/// Registration input for [`crate::pools::PoolStore::add_member`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    pub external_ref: String,
    pub display_name: String,
}

impl NewMember {
    pub fn new(external_ref: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            external_ref: external_ref.into(),
            display_name: display_name.into(),
        }
    }
}

/// An immutable ledger record of one selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub assignment_id: AssignmentId,
    pub seq: LedgerSeq,
    pub pool_id: PoolId,
    pub member_id: MemberId,
    pub cycle_number: CycleNumber,
    pub period_label: PeriodLabel,
    pub created_at: DateTime<Utc>,
}

/// Input for appending to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub pool_id: PoolId,
    pub member_id: MemberId,
    pub cycle_number: CycleNumber,
    pub period_label: PeriodLabel,
    pub created_at: DateTime<Utc>,
}

/// What happened to an assignment after it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// The member accepted the duty.
    Confirmed,
    /// The member turned the duty down; the period is open again.
    Declined,
    /// A forced pick for the same period took its place.
    Replaced,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Confirmed => "confirmed",
            ResponseKind::Declined => "declined",
            ResponseKind::Replaced => "replaced",
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown response kind '{0}'")]
pub struct UnknownResponseKind(String);

impl FromStr for ResponseKind {
    type Err = UnknownResponseKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(ResponseKind::Confirmed),
            "declined" => Ok(ResponseKind::Declined),
            "replaced" => Ok(ResponseKind::Replaced),
            other => Err(UnknownResponseKind(other.to_string())),
        }
    }
}

/// The single, final response to an assignment. Stored in its own
/// append-only log; the assignment row itself never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentResponse {
    pub assignment_id: AssignmentId,
    pub pool_id: PoolId,
    pub kind: ResponseKind,
    pub responded_at: DateTime<Utc>,
}

/// Derived state of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// No response yet.
    Pending,
    Confirmed,
    Declined,
    Replaced,
}

impl AssignmentStatus {
    /// Whether the assignment still occupies its period.
    pub fn holds_period(&self) -> bool {
        matches!(self, AssignmentStatus::Pending | AssignmentStatus::Confirmed)
    }

    /// Whether the member counts as having served in the assignment's cycle.
    ///
    /// A declined duty still counts; a replaced one does not.
    pub fn counts_as_served(&self) -> bool {
        !matches!(self, AssignmentStatus::Replaced)
    }
}

impl From<Option<ResponseKind>> for AssignmentStatus {
    fn from(kind: Option<ResponseKind>) -> Self {
        match kind {
            None => AssignmentStatus::Pending,
            Some(ResponseKind::Confirmed) => AssignmentStatus::Confirmed,
            Some(ResponseKind::Declined) => AssignmentStatus::Declined,
            Some(ResponseKind::Replaced) => AssignmentStatus::Replaced,
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Confirmed => "confirmed",
            AssignmentStatus::Declined => "declined",
            AssignmentStatus::Replaced => "replaced",
        })
    }
}

/// An assignment joined with its response, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub assignment: Assignment,
    pub response: Option<AssignmentResponse>,
}

impl LedgerEntry {
    pub fn status(&self) -> AssignmentStatus {
        AssignmentStatus::from(self.response.as_ref().map(|r| r.kind))
    }
}

/// Outcome of a selection, handed to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentResult {
    pub assignment_id: AssignmentId,
    pub pool_id: PoolId,
    pub member_id: MemberId,
    pub display_name: String,
    pub cycle_number: CycleNumber,
    pub period_label: PeriodLabel,
    /// True when this selection started a new cycle.
    pub cycle_reset: bool,
    pub assigned_at: DateTime<Utc>,
}
