use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Weekday;

use crate::rotation::{EngineConfig, RetryPolicy, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_ATTEMPTS};
use crate::store::DbConfig;
use crate::worker::WeeklySchedule;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub run_migrations: bool,
    pub engine: EngineConfig,
    pub schedule: WeeklySchedule,
    pub tick_interval: Duration,
    pub history_limit: usize,
    /// `None` runs on the in-memory store.
    pub database: Option<DbConfig>,
}

/// Reads raw settings by name.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.raw(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("{name} has an invalid value '{raw}'")),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str) -> bool {
        self.raw(name)
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
}

/// Day index as used by the bot settings: 0 is Monday, 6 is Sunday.
fn weekday_from_index(index: u8) -> Result<Weekday> {
    const WEEK: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    match WEEK.get(usize::from(index)) {
        Some(day) => Ok(*day),
        None => bail!("WEEKLY_DUTY_DAY must be between 0 (Monday) and 6 (Sunday), got {index}"),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any name-to-value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let log_level = vars
            .raw("DUTYBOT_LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string());
        let run_migrations = vars.flag("DUTYBOT_RUN_MIGRATIONS");

        let lock_timeout = vars.parse(
            "DUTYBOT_LOCK_TIMEOUT_MS",
            DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
        )?;
        let max_attempts = vars.parse("DUTYBOT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            bail!("DUTYBOT_MAX_ATTEMPTS must be at least 1");
        }
        let engine = EngineConfig {
            lock_timeout: Duration::from_millis(lock_timeout),
            retry: RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
        };

        let weekday = weekday_from_index(vars.parse("WEEKLY_DUTY_DAY", 0u8)?)?;
        let hour = vars.parse("WEEKLY_DUTY_HOUR", 10u32)?;
        let minute = vars.parse("WEEKLY_DUTY_MINUTE", 0u32)?;
        let schedule = WeeklySchedule::new(weekday, hour, minute)?;

        let tick_interval = Duration::from_secs(vars.parse("DUTYBOT_TICK_SECS", 60u64)?.max(1));
        let history_limit = vars.parse("HISTORY_LIMIT", 10usize)?;

        let database = database_config(&vars)?;

        Ok(Self {
            log_level,
            run_migrations,
            engine,
            schedule,
            tick_interval,
            history_limit,
            database,
        })
    }
}

/// Postgres settings; `None` when `DATABASE_URL` is unset.
fn database_config<F>(vars: &Vars<F>) -> Result<Option<DbConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(database_url) = vars.raw("DATABASE_URL") else {
        return Ok(None);
    };
    let defaults = DbConfig::default();

    let max_connections = vars.parse("DB_MAX_CONNECTIONS", defaults.max_connections)?;
    let min_connections = vars.parse("DB_MIN_CONNECTIONS", defaults.min_connections)?;
    if max_connections == 0 {
        bail!("DB_MAX_CONNECTIONS must be at least 1");
    }
    if min_connections > max_connections {
        bail!("DB_MIN_CONNECTIONS ({min_connections}) exceeds DB_MAX_CONNECTIONS ({max_connections})");
    }
    let lock_timeout_ms = vars.parse(
        "DB_LOCK_TIMEOUT_MS",
        defaults.lock_timeout.as_millis() as u64,
    )?;

    Ok(Some(DbConfig {
        database_url,
        max_connections,
        min_connections,
        lock_timeout: Duration::from_millis(lock_timeout_ms),
        ..defaults
    }))
}
