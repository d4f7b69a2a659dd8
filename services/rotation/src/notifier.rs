//! Announcing assignments to a group.
//!
//! Delivery to an actual chat platform lives outside this crate; the
//! [`LogNotifier`] writes announcements to the log.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::model::{AssignmentResult, Pool};

/// Errors from delivering an announcement.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Sink for assignment announcements.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn announce(&self, pool: &Pool, result: &AssignmentResult) -> Result<(), NotifyError>;
}

/// Human-readable announcement of an assignment.
pub fn announcement_text(pool: &Pool, result: &AssignmentResult) -> String {
    let period = result.period_label;
    let mut text = format!(
        "{}: {} is on duty for week {} ({} to {}).",
        pool.display_name,
        result.display_name,
        period,
        period.monday().format("%b %-d"),
        period.sunday().format("%b %-d"),
    );
    if result.cycle_reset {
        text.push_str(&format!(
            " Everyone has served once; cycle {} begins.",
            result.cycle_number
        ));
    }
    text
}

/// Writes announcements to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn announce(&self, pool: &Pool, result: &AssignmentResult) -> Result<(), NotifyError> {
        info!(
            pool_id = %pool.pool_id,
            group_ref = %pool.group_ref,
            member_id = %result.member_id,
            "{}",
            announcement_text(pool, result)
        );
        Ok(())
    }
}
