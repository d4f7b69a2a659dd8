//! Fair duty selection.
//!
//! The [`RotationEngine`] picks one eligible member per call, starts a new
//! cycle once everyone has served and records every pick in the ledger.

mod engine;
mod lock;
mod random;
mod retry;

pub use engine::{EngineConfig, RotationEngine, DEFAULT_LOCK_TIMEOUT};
pub use lock::PoolLocks;
pub use random::{RandomSource, SeededRandom, ThreadRandom};
pub use retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
