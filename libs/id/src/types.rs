//! Identifier and counter definitions.

use crate::entity_id;
use crate::IdError;

// =============================================================================
// Entities
// =============================================================================

entity_id!(
    /// A rotation pool, one per chat group.
    PoolId,
    "pool"
);
entity_id!(
    /// A participant inside a pool.
    MemberId,
    "mbr"
);
entity_id!(
    /// One row of the assignment ledger.
    AssignmentId,
    "asg"
);

// =============================================================================
// Cycle Number
// =============================================================================

/// Rotation cycle counter of a pool.
///
/// Starts at 1 and only ever moves forward by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleNumber(i32);

impl CycleNumber {
    /// The cycle every new pool starts in.
    pub const FIRST: Self = Self(1);

    /// Validates a stored cycle value.
    pub fn try_new(value: i32) -> Result<Self, IdError> {
        if value < Self::FIRST.0 {
            return Err(IdError::OutOfRange {
                kind: "cycle number",
                min: i64::from(Self::FIRST.0),
                actual: i64::from(value),
            });
        }
        Ok(Self(value))
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.0
    }

    /// The cycle that follows this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for CycleNumber {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for CycleNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for CycleNumber {
    type Error = IdError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<CycleNumber> for i32 {
    fn from(cycle: CycleNumber) -> Self {
        cycle.0
    }
}

impl serde::Serialize for CycleNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for CycleNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = i32::deserialize(deserializer)?;
        Self::try_new(value).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Ledger Sequence
// =============================================================================

/// Position of an assignment in the ledger. Assigned by storage, strictly
/// increasing in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerSeq(i64);

impl LedgerSeq {
    /// Creates a sequence value.
    #[must_use]
    pub const fn new(seq: i64) -> Self {
        Self(seq)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for LedgerSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LedgerSeq {
    fn from(seq: i64) -> Self {
        Self(seq)
    }
}

impl serde::Serialize for LedgerSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for LedgerSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// Tests
// =============================================================================
