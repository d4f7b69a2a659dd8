//! dutybot rotation core.
//!
//! This crate ships the `dutybot` binary, which runs the weekly duty worker,
//! and exposes the rotation library for the chat front end and for
//! integration testing.
//!
//! - [`pools`]: pool and member registration
//! - [`rotation`]: fair, non-repeating selection
//! - [`ledger`]: the append-only assignment history
//! - [`store`]: Postgres and in-memory storage behind one unit-of-work API

pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod model;
pub mod notifier;
pub mod period;
pub mod pools;
pub mod rotation;
pub mod store;
pub mod worker;

pub use error::{RotationError, RotationResult};
