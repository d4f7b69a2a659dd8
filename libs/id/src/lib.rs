//! # dutybot-id
//!
//! Identifier and counter types shared by the dutybot rotation core.
//!
//! Entity IDs are generated by the system and never reused. Each one carries a
//! short prefix naming the entity it belongs to, followed by a ULID:
//!
//! - `pool_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `mbr_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `asg_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a member ID from being passed where a pool ID is expected,
//! and the ULID keeps IDs roughly creation-ordered.
//!
//! Two plain integer newtypes live here as well: [`CycleNumber`], the
//! rotation cycle counter of a pool, and [`LedgerSeq`], the position of an
//! assignment in the append-only ledger.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that build IDs from raw ULIDs.
pub use ulid::Ulid;
