//! Weekly duty worker.
//!
//! Wakes up on a fixed interval and, once the configured weekday and time of
//! the current ISO week have passed, selects the next member for every pool
//! whose week is not already held by a pending or confirmed assignment.
//! One pool failing does not stop the pass over the others.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc, Weekday};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{RotationError, RotationResult};
use crate::notifier::Notifier;
use crate::period::PeriodLabel;
use crate::rotation::RotationEngine;
use crate::store::Storage;

/// When in the week the duty is assigned (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    weekday: Weekday,
    at: NaiveTime,
}

impl WeeklySchedule {
    pub fn new(weekday: Weekday, hour: u32, minute: u32) -> RotationResult<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            RotationError::InvalidInput(format!("invalid time of day {hour:02}:{minute:02}"))
        })?;
        Ok(Self { weekday, at })
    }

    pub fn weekday(&self) -> Weekday {
        self.weekday
    }

    /// The instant the duty for `period` becomes due.
    pub fn fire_time(&self, period: PeriodLabel) -> DateTime<Utc> {
        let day = period.monday() + Days::new(u64::from(self.weekday.num_days_from_monday()));
        day.and_time(self.at).and_utc()
    }

    /// The current week, if its fire time has passed at `now`.
    pub fn due_period(&self, now: DateTime<Utc>) -> Option<PeriodLabel> {
        let period = PeriodLabel::containing(now);
        (now >= self.fire_time(period)).then_some(period)
    }
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self {
            weekday: Weekday::Mon,
            at: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
        }
    }
}

/// Outcome of one pass over all pools.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub pools: usize,
    pub selected: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Background worker assigning the weekly duty.
pub struct DutyWorker<S: Storage, N> {
    engine: Arc<RotationEngine<S>>,
    notifier: Arc<N>,
    schedule: WeeklySchedule,
    interval: Duration,
    last_completed: Mutex<Option<PeriodLabel>>,
}

impl<S: Storage, N: Notifier> DutyWorker<S, N> {
    pub fn new(
        engine: Arc<RotationEngine<S>>,
        notifier: Arc<N>,
        schedule: WeeklySchedule,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            notifier,
            schedule,
            interval,
            last_completed: Mutex::new(None),
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            weekday = %self.schedule.weekday,
            "Starting duty worker"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Duty pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Duty worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run the pass for the current week if it is due and not done yet.
    ///
    /// Returns `None` when nothing was due.
    pub async fn tick(&self) -> RotationResult<Option<RunStats>> {
        let Some(period) = self.schedule.due_period(self.engine.clock().now()) else {
            return Ok(None);
        };
        if self.last_completed() == Some(period) {
            return Ok(None);
        }

        let stats = self.run_period(period).await?;
        if stats.failed == 0 {
            *self.last_completed.lock().unwrap_or_else(PoisonError::into_inner) = Some(period);
        }
        Ok(Some(stats))
    }

    /// The last week whose pass finished without failures.
    pub fn last_completed(&self) -> Option<PeriodLabel> {
        *self.last_completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select for every pool whose `period` is still open.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn run_period(&self, period: PeriodLabel) -> RotationResult<RunStats> {
        let pools = self.engine.pools().list_pools().await?;
        let mut stats = RunStats {
            pools: pools.len(),
            ..RunStats::default()
        };

        for pool in pools {
            match self.engine.select_for_period(pool.pool_id, period).await {
                Ok(result) => {
                    stats.selected += 1;
                    if let Err(e) = self.notifier.announce(&pool, &result).await {
                        warn!(pool_id = %pool.pool_id, error = %e, "Announcement failed");
                    }
                }
                Err(RotationError::PeriodTaken {
                    assignment_id,
                    status,
                    ..
                }) => {
                    debug!(pool_id = %pool.pool_id, assignment_id = %assignment_id, status = %status, "Already assigned this week");
                    stats.skipped += 1;
                }
                Err(RotationError::EmptyPool(pool_id)) => {
                    info!(pool_id = %pool_id, "No active members, skipping");
                    stats.skipped += 1;
                }
                Err(RotationError::NoCandidates { pool_id, .. }) => {
                    info!(pool_id = %pool_id, "Every eligible member declined this week, skipping");
                    stats.skipped += 1;
                }
                Err(e) => {
                    error!(pool_id = %pool.pool_id, error = %e, "Duty selection failed");
                    stats.failed += 1;
                }
            }
        }

        info!(
            pools = stats.pools,
            selected = stats.selected,
            skipped = stats.skipped,
            failed = stats.failed,
            "Duty pass complete"
        );
        Ok(stats)
    }
}
