//! Postgres storage via SQLx.
//!
//! A unit of work is one database transaction. The pool row is taken with
//! `SELECT ... FOR UPDATE` under a transaction-local `lock_timeout`, so a
//! second writer on the same pool waits and, past the timeout, fails with a
//! conflict that the engine retries.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dutybot_id::{AssignmentId, CycleNumber, LedgerSeq, MemberId, PoolId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use super::{Storage, StoreError, StoreResult, UnitOfWork};
use crate::ledger::AssignmentFilter;
use crate::model::{Assignment, AssignmentResponse, LedgerEntry, Member, NewAssignment, Pool};
use crate::period::PeriodLabel;

/// Postgres error codes treated as retryable conflicts.
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// Connection settings for the rotation database.
///
/// Built by [`crate::config::Config`] from `DATABASE_URL` and the `DB_*`
/// variables.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// How long a unit of work waits for the row lock of a pool.
    pub lock_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/dutybot".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Where `run_migrations` looks for SQL files, in order.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("./migrations"),
        PathBuf::from("services/rotation/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

/// A connected Postgres pool and the settings its stores inherit.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        Ok(Self {
            pool,
            lock_timeout: config.lock_timeout,
        })
    }

    /// Round-trip a trivial query.
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(StoreError::Query)
    }

    /// Apply pending migrations from the first directory that loads.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let dirs = migration_dirs();
        let mut last_error = None;

        for dir in &dirs {
            let migrator = match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    debug!(migrations_dir = %dir.display(), error = %e, "Migrations not loadable here");
                    last_error = Some(e);
                    continue;
                }
            };
            migrator
                .run(&self.pool)
                .await
                .map_err(StoreError::Migration)?;
            info!(
                migrations_dir = %dir.display(),
                migrations = migrator.iter().count(),
                "Database schema up to date"
            );
            return Ok(());
        }

        Err(StoreError::MigrationDirNotFound {
            tried: dirs
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
        })
    }

    /// A store handle sharing this connection pool.
    pub fn store(&self) -> PgStore {
        PgStore {
            pool: self.pool.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

/// Map a driver error, turning lock and serialization failures into conflicts.
fn classify(e: sqlx::Error) -> StoreError {
    if let Some(db_err) = e.as_database_error() {
        if let Some(code) = db_err.code() {
            if matches!(
                code.as_ref(),
                LOCK_NOT_AVAILABLE | SERIALIZATION_FAILURE | DEADLOCK_DETECTED | UNIQUE_VIOLATION
            ) {
                return StoreError::Conflict(format!("{} ({code})", db_err.message()));
            }
        }
    }
    StoreError::Query(e)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

fn decode<T, E>(result: Result<T, E>) -> Result<T, sqlx::Error>
where
    E: std::error::Error + Send + Sync + 'static,
{
    result.map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

impl<'r> sqlx::FromRow<'r, PgRow> for Pool {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            pool_id: decode(row.try_get::<String, _>("pool_id")?.parse())?,
            group_ref: row.try_get("group_ref")?,
            display_name: row.try_get("display_name")?,
            current_cycle: decode(CycleNumber::try_new(row.try_get("current_cycle")?))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Member {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            member_id: decode(row.try_get::<String, _>("member_id")?.parse())?,
            pool_id: decode(row.try_get::<String, _>("pool_id")?.parse())?,
            external_ref: row.try_get("external_ref")?,
            display_name: row.try_get("display_name")?,
            completed_this_cycle: row.try_get("completed_this_cycle")?,
            is_active: row.try_get("is_active")?,
            joined_at: row.try_get("joined_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Assignment {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            assignment_id: decode(row.try_get::<String, _>("assignment_id")?.parse())?,
            seq: LedgerSeq::new(row.try_get("seq")?),
            pool_id: decode(row.try_get::<String, _>("pool_id")?.parse())?,
            member_id: decode(row.try_get::<String, _>("member_id")?.parse())?,
            cycle_number: decode(CycleNumber::try_new(row.try_get("cycle_number")?))?,
            period_label: decode(row.try_get::<String, _>("period_label")?.parse())?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for LedgerEntry {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let assignment: Assignment = sqlx::FromRow::from_row(row)?;
        let kind: Option<String> = row.try_get("response_kind")?;
        let responded_at: Option<DateTime<Utc>> = row.try_get("responded_at")?;
        let response = match (kind, responded_at) {
            (Some(kind), Some(responded_at)) => Some(AssignmentResponse {
                assignment_id: assignment.assignment_id,
                pool_id: assignment.pool_id,
                kind: decode(kind.parse())?,
                responded_at,
            }),
            _ => None,
        };
        Ok(Self {
            assignment,
            response,
        })
    }
}

const POOL_COLUMNS: &str =
    "pool_id, group_ref, display_name, current_cycle, created_at, updated_at";

const MEMBER_COLUMNS: &str = "member_id, pool_id, external_ref, display_name, \
     completed_this_cycle, is_active, joined_at";

const ENTRY_SELECT: &str = "SELECT a.seq, a.assignment_id, a.pool_id, a.member_id, \
     a.cycle_number, a.period_label, a.created_at, \
     r.kind AS response_kind, r.responded_at \
     FROM duty_assignments a \
     LEFT JOIN duty_responses r ON r.assignment_id = a.assignment_id";

/// Rotation store backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

#[async_trait]
impl Storage for PgStore {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        // SET does not take bind parameters.
        let set_timeout = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        Ok(PgUnitOfWork { tx })
    }

    async fn find_pool(&self, pool_id: PoolId) -> StoreResult<Option<Pool>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM duty_pools WHERE pool_id = $1");
        sqlx::query_as::<_, Pool>(&sql)
            .bind(pool_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)
    }

    async fn find_pool_by_group(&self, group_ref: &str) -> StoreResult<Option<Pool>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM duty_pools WHERE group_ref = $1");
        sqlx::query_as::<_, Pool>(&sql)
            .bind(group_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)
    }

    async fn list_pools(&self) -> StoreResult<Vec<Pool>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM duty_pools ORDER BY created_at, pool_id");
        sqlx::query_as::<_, Pool>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)
    }

    async fn list_members(&self, pool_id: PoolId, active_only: bool) -> StoreResult<Vec<Member>> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM pool_members \
             WHERE pool_id = $1 AND ($2 = FALSE OR is_active) \
             ORDER BY joined_at, member_id"
        );
        sqlx::query_as::<_, Member>(&sql)
            .bind(pool_id.to_string())
            .bind(active_only)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)
    }

    async fn query_assignments(
        &self,
        pool_id: PoolId,
        filter: &AssignmentFilter,
    ) -> StoreResult<Vec<Assignment>> {
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX));

        sqlx::query_as::<_, Assignment>(
            r#"
            SELECT seq, assignment_id, pool_id, member_id, cycle_number, period_label, created_at
            FROM duty_assignments
            WHERE pool_id = $1
              AND ($2::TEXT IS NULL OR member_id = $2)
              AND ($3::INT IS NULL OR cycle_number = $3)
              AND ($4::TEXT IS NULL OR period_label = $4)
            ORDER BY created_at DESC, seq DESC
            LIMIT $5::BIGINT
            "#,
        )
        .bind(pool_id.to_string())
        .bind(filter.member_id.map(|id| id.to_string()))
        .bind(filter.cycle_number.map(i32::from))
        .bind(filter.period_label.map(|p| p.to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    async fn find_entry(
        &self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>> {
        let sql = format!("{ENTRY_SELECT} WHERE a.pool_id = $1 AND a.assignment_id = $2");
        sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(pool_id.to_string())
            .bind(assignment_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)
    }
}

/// One Postgres transaction.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_pool(&mut self, pool_id: PoolId) -> StoreResult<Option<Pool>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM duty_pools WHERE pool_id = $1 FOR UPDATE");
        sqlx::query_as::<_, Pool>(&sql)
            .bind(pool_id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)
    }

    async fn find_pool_by_group(&mut self, group_ref: &str) -> StoreResult<Option<Pool>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM duty_pools WHERE group_ref = $1 FOR UPDATE");
        sqlx::query_as::<_, Pool>(&sql)
            .bind(group_ref)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)
    }

    async fn insert_pool(&mut self, pool: &Pool) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO duty_pools (pool_id, group_ref, display_name, current_cycle, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(pool.pool_id.to_string())
        .bind(&pool.group_ref)
        .bind(&pool.display_name)
        .bind(i32::from(pool.current_cycle))
        .bind(pool.created_at)
        .bind(pool.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn rename_pool(
        &mut self,
        pool_id: PoolId,
        display_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE duty_pools SET display_name = $2, updated_at = $3 WHERE pool_id = $1",
        )
        .bind(pool_id.to_string())
        .bind(display_name)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pool {pool_id}")));
        }
        Ok(())
    }

    async fn members(&mut self, pool_id: PoolId) -> StoreResult<Vec<Member>> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM pool_members WHERE pool_id = $1 ORDER BY joined_at, member_id"
        );
        sqlx::query_as::<_, Member>(&sql)
            .bind(pool_id.to_string())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(classify)
    }

    async fn insert_member(&mut self, member: &Member) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pool_members (
                member_id, pool_id, external_ref, display_name,
                completed_this_cycle, is_active, joined_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(member.member_id.to_string())
        .bind(member.pool_id.to_string())
        .bind(&member.external_ref)
        .bind(&member.display_name)
        .bind(member.completed_this_cycle)
        .bind(member.is_active)
        .bind(member.joined_at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn update_member(
        &mut self,
        pool_id: PoolId,
        member_id: MemberId,
        display_name: &str,
        is_active: bool,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pool_members
            SET display_name = $3, is_active = $4, updated_at = now()
            WHERE pool_id = $1 AND member_id = $2
            "#,
        )
        .bind(pool_id.to_string())
        .bind(member_id.to_string())
        .bind(display_name)
        .bind(is_active)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("member {member_id}")));
        }
        Ok(())
    }

    async fn advance_cycle(
        &mut self,
        pool_id: PoolId,
        expected: CycleNumber,
        at: DateTime<Utc>,
    ) -> StoreResult<CycleNumber> {
        let next: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE duty_pools
            SET current_cycle = current_cycle + 1, updated_at = $3
            WHERE pool_id = $1 AND current_cycle = $2
            RETURNING current_cycle
            "#,
        )
        .bind(pool_id.to_string())
        .bind(i32::from(expected))
        .bind(at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)?;

        let Some(next) = next else {
            return Err(StoreError::Conflict(format!(
                "pool {pool_id} is no longer in cycle {expected}"
            )));
        };

        let cleared = sqlx::query(
            "UPDATE pool_members SET completed_this_cycle = FALSE, updated_at = $2 WHERE pool_id = $1",
        )
        .bind(pool_id.to_string())
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        debug!(pool_id = %pool_id, cycle = next, members_cleared = cleared.rows_affected(), "Advanced cycle");
        CycleNumber::try_new(next).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn mark_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pool_members
            SET completed_this_cycle = TRUE, updated_at = now()
            WHERE pool_id = $1 AND member_id = $2
              AND is_active AND NOT completed_this_cycle
            "#,
        )
        .bind(pool_id.to_string())
        .bind(member_id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "member {member_id} is no longer eligible"
            )));
        }
        Ok(())
    }

    async fn clear_completed(&mut self, pool_id: PoolId, member_id: MemberId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pool_members
            SET completed_this_cycle = FALSE, updated_at = now()
            WHERE pool_id = $1 AND member_id = $2
            "#,
        )
        .bind(pool_id.to_string())
        .bind(member_id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("member {member_id}")));
        }
        Ok(())
    }

    async fn insert_assignment(&mut self, entry: &NewAssignment) -> StoreResult<Assignment> {
        let assignment_id = AssignmentId::new();
        // The pool row is locked by this transaction, so the existence check
        // cannot race another writer of the same pool.
        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO duty_assignments (
                assignment_id, pool_id, member_id, cycle_number, period_label, created_at
            )
            SELECT $1::TEXT, $2::TEXT, $3::TEXT, $4::INT, $5::TEXT, $6::TIMESTAMPTZ
            WHERE NOT EXISTS (
                SELECT 1
                FROM duty_assignments a
                LEFT JOIN duty_responses r ON r.assignment_id = a.assignment_id
                WHERE a.pool_id = $2 AND a.member_id = $3 AND a.cycle_number = $4
                  AND r.kind IS DISTINCT FROM 'replaced'
            )
            RETURNING seq
            "#,
        )
        .bind(assignment_id.to_string())
        .bind(entry.pool_id.to_string())
        .bind(entry.member_id.to_string())
        .bind(i32::from(entry.cycle_number))
        .bind(entry.period_label.to_string())
        .bind(entry.created_at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)?;

        let Some(seq) = seq else {
            return Err(StoreError::DuplicateAssignment {
                pool_id: entry.pool_id,
                member_id: entry.member_id,
                cycle_number: entry.cycle_number,
            });
        };

        Ok(Assignment {
            assignment_id,
            seq: LedgerSeq::new(seq),
            pool_id: entry.pool_id,
            member_id: entry.member_id,
            cycle_number: entry.cycle_number,
            period_label: entry.period_label,
            created_at: entry.created_at,
        })
    }

    async fn entry(
        &mut self,
        pool_id: PoolId,
        assignment_id: AssignmentId,
    ) -> StoreResult<Option<LedgerEntry>> {
        let sql = format!("{ENTRY_SELECT} WHERE a.pool_id = $1 AND a.assignment_id = $2");
        sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(pool_id.to_string())
            .bind(assignment_id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)
    }

    async fn period_entries(
        &mut self,
        pool_id: PoolId,
        period: PeriodLabel,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let sql = format!(
            "{ENTRY_SELECT} WHERE a.pool_id = $1 AND a.period_label = $2 ORDER BY a.seq"
        );
        sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(pool_id.to_string())
            .bind(period.to_string())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(classify)
    }

    async fn insert_response(&mut self, response: &AssignmentResponse) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO duty_responses (assignment_id, pool_id, kind, responded_at)
            SELECT assignment_id, pool_id, $3::TEXT, $4::TIMESTAMPTZ
            FROM duty_assignments
            WHERE assignment_id = $1 AND pool_id = $2
            "#,
        )
        .bind(response.assignment_id.to_string())
        .bind(response.pool_id.to_string())
        .bind(response.kind.as_str())
        .bind(response.responded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateResponse {
                    assignment_id: response.assignment_id,
                }
            } else {
                classify(e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "assignment {}",
                response.assignment_id
            )));
        }
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await.map_err(classify)
    }
}
