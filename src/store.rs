//! Timer CRUD and the claim transaction (SQLite).
//!
//! Instants are persisted as UTC unix microseconds so SQL comparisons are
//! total and precision survives the round trip. The table name is
//! configurable; all queries are built against it.

use crate::error::Result;
use crate::timer::Timer;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row as _, SqlitePool};
use uuid::Uuid;

const COLUMNS: &str = "id, callable_module, callable_function, arguments, expires_at, \
     duration, interval, crontab, crontab_timezone, calls, max_calls, \
     skip_if_offline, name, executing, inserted_at, updated_at";

/// How long a connection waits on a locked database before giving up.
/// Graceful claim contention between peer workers relies on this being
/// nonzero; see [`TimerStore::claim_next`].
const BUSY_TIMEOUT_MS: u32 = 5_000;

#[derive(Debug, Clone)]
pub struct TimerStore {
    pool: SqlitePool,
    table: String,
}

impl TimerStore {
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the timers table and its indexes if they do not exist yet, and
    /// raise the busy timeout so concurrent claimers wait for each other
    /// instead of surfacing `SQLITE_BUSY`.
    ///
    /// The busy timeout is a per-connection setting: this statement covers
    /// the connection it runs on, and pools built from
    /// `SqliteConnectOptions` apply sqlx's own 5 s default to every
    /// connection they open. Callers constructing pools by hand should keep
    /// `busy_timeout` nonzero for the claim path to degrade gracefully under
    /// contention.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .execute(&self.pool)
            .await
            .context("failed to set busy timeout")?;

        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                callable_module TEXT NOT NULL,
                callable_function TEXT NOT NULL,
                arguments BLOB NOT NULL,
                expires_at INTEGER NOT NULL,
                duration INTEGER,
                interval INTEGER,
                crontab TEXT,
                crontab_timezone TEXT,
                calls INTEGER NOT NULL DEFAULT 0,
                max_calls INTEGER,
                skip_if_offline INTEGER NOT NULL DEFAULT 1,
                name TEXT UNIQUE,
                executing INTEGER NOT NULL DEFAULT 0,
                inserted_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .context("failed to create timers table")?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_expires_at ON {table} (expires_at ASC)"
        ))
        .execute(&self.pool)
        .await
        .context("failed to create expires_at index")?;

        Ok(())
    }

    /// Insert one timer, replacing any existing row with the same name.
    pub async fn insert(&self, timer: &Timer) -> Result<Timer> {
        let mut inserted = self.insert_many(std::slice::from_ref(timer)).await?;
        Ok(inserted.remove(0))
    }

    /// Bulk insert in a single round trip, with `ON CONFLICT(name)` replacing
    /// every column of the previous row (idempotent creation by name).
    pub async fn insert_many(&self, timers: &[Timer]) -> Result<Vec<Timer>> {
        if timers.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = std::iter::repeat("(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
            .take(timers.len())
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "INSERT INTO {table} ({COLUMNS}) VALUES {placeholders} \
             ON CONFLICT(name) DO UPDATE SET \
             id = excluded.id, \
             callable_module = excluded.callable_module, \
             callable_function = excluded.callable_function, \
             arguments = excluded.arguments, \
             expires_at = excluded.expires_at, \
             duration = excluded.duration, \
             interval = excluded.interval, \
             crontab = excluded.crontab, \
             crontab_timezone = excluded.crontab_timezone, \
             calls = excluded.calls, \
             max_calls = excluded.max_calls, \
             skip_if_offline = excluded.skip_if_offline, \
             executing = excluded.executing, \
             inserted_at = excluded.inserted_at, \
             updated_at = excluded.updated_at",
            table = self.table,
        );

        let mut sql = sqlx::query(&query);
        for timer in timers {
            let expires_at = timer
                .expires_at
                .context("timer row is missing expires_at")?;
            sql = sql
                .bind(timer.id.to_string())
                .bind(&timer.module)
                .bind(&timer.function)
                .bind(&timer.arguments)
                .bind(to_micros(expires_at))
                .bind(timer.duration)
                .bind(timer.interval)
                .bind(&timer.crontab)
                .bind(&timer.crontab_timezone)
                .bind(timer.calls)
                .bind(timer.max_calls)
                .bind(timer.skip_if_offline)
                .bind(&timer.name)
                .bind(timer.executing)
                .bind(to_micros(timer.inserted_at))
                .bind(to_micros(timer.updated_at));
        }

        sql.execute(&self.pool)
            .await
            .context("failed to insert timers")?;

        Ok(timers.to_vec())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Timer>> {
        let query = format!("SELECT {COLUMNS} FROM {} WHERE id = ?", self.table);
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch timer by id")?;
        row.map(|row| timer_from_row(&row)).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Timer>> {
        let query = format!("SELECT {COLUMNS} FROM {} WHERE name = ?", self.table);
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch timer by name")?;
        row.map(|row| timer_from_row(&row)).transpose()
    }

    pub async fn id_exists(&self, id: Uuid) -> Result<bool> {
        let query = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", self.table);
        let exists: bool = sqlx::query_scalar(&query)
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("failed to check timer id existence")?;
        Ok(exists)
    }

    pub async fn name_exists(&self, name: &str) -> Result<bool> {
        let query = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE name = ?)", self.table);
        let exists: bool = sqlx::query_scalar(&query)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .context("failed to check timer name existence")?;
        Ok(exists)
    }

    pub async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE id = ?", self.table);
        let result = sqlx::query(&query)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to delete timer by id")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_name(&self, name: &str) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE name = ?", self.table);
        let result = sqlx::query(&query)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("failed to delete timer by name")?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every timer pointing at the given handler. Returns the count.
    pub async fn delete_all(&self, module: &str, function: &str) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE callable_module = ? AND callable_function = ?",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(module)
            .bind(function)
            .execute(&self.pool)
            .await
            .context("failed to delete timers by callable")?;
        Ok(result.rows_affected())
    }

    /// Earliest `expires_at` among rows a worker could claim: not executing,
    /// or executing past the orphan cutoff.
    pub async fn earliest_expiry(
        &self,
        orphan_cutoff: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = format!(
            "SELECT MIN(expires_at) FROM {} WHERE executing = 0 OR expires_at < ?",
            self.table
        );
        let micros: Option<i64> = sqlx::query_scalar(&query)
            .bind(to_micros(orphan_cutoff))
            .fetch_one(&self.pool)
            .await
            .context("failed to query earliest expiry")?;
        micros.map(from_micros).transpose()
    }

    /// Atomically claim the earliest due timer: pick it, mark it executing,
    /// return it. `None` when nothing is due or a peer won the race.
    ///
    /// Rows already executing are only eligible once their `expires_at` has
    /// fallen behind `orphan_cutoff`, which marks the lease of a worker that
    /// crashed mid-dispatch.
    ///
    /// Concurrency: the marking update is a compare-and-swap on the
    /// `updated_at` value the candidate row was read with, which plays the
    /// role a `FOR UPDATE` lock plays on stores that have one. Whichever
    /// claimer writes first flips `updated_at`; the other's update matches
    /// zero rows and reports `None` rather than a double claim. The select
    /// and the update deliberately run as separate autocommit statements: a
    /// wrapping deferred transaction would leave the loser holding a read
    /// lock while it waits to write, which SQLite resolves with an immediate
    /// `SQLITE_BUSY` instead of a lost race. With the nonzero busy timeout
    /// (see [`migrate`](Self::migrate)) writer contention becomes a short
    /// wait, so losing a race is `Ok(None)`, not an error.
    pub async fn claim_next(
        &self,
        due_before: DateTime<Utc>,
        orphan_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Timer>> {
        let select = format!(
            "SELECT {COLUMNS} FROM {} \
             WHERE expires_at < ? AND (executing = 0 OR expires_at < ?) \
             ORDER BY expires_at ASC LIMIT 1",
            self.table
        );
        let row = sqlx::query(&select)
            .bind(to_micros(due_before))
            .bind(to_micros(orphan_cutoff))
            .fetch_optional(&self.pool)
            .await
            .context("failed to select a claimable timer")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let timer = timer_from_row(&row)?;

        if timer.executing {
            tracing::warn!(
                timer_id = %timer.id,
                module = %timer.module,
                function = %timer.function,
                expires_at = ?timer.expires_at,
                "reclaiming orphaned timer lease"
            );
        }

        let update = format!(
            "UPDATE {} SET executing = 1, updated_at = ? WHERE id = ? AND updated_at = ?",
            self.table
        );
        let affected = sqlx::query(&update)
            .bind(to_micros(now))
            .bind(timer.id.to_string())
            .bind(to_micros(timer.updated_at))
            .execute(&self.pool)
            .await
            .context("failed to mark timer executing")?
            .rows_affected();

        if affected != 1 {
            // Lost the race to a peer between select and update.
            return Ok(None);
        }

        Ok(Some(Timer {
            executing: true,
            updated_at: now,
            ..timer
        }))
    }

    /// Post-dispatch update: advance the schedule and release the lease.
    /// Returns the affected row count; zero means the row vanished under a
    /// concurrent cancel.
    pub async fn reschedule(
        &self,
        id: Uuid,
        expires_at: DateTime<Utc>,
        calls: i64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET expires_at = ?, calls = ?, executing = 0, updated_at = ? WHERE id = ?",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(to_micros(expires_at))
            .bind(calls)
            .bind(to_micros(now))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to reschedule timer")?;
        Ok(result.rows_affected())
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    Ok(DateTime::from_timestamp_micros(micros)
        .with_context(|| format!("timestamp out of range: {micros}"))?)
}

fn timer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Timer> {
    let id: String = row.try_get("id").context("failed to read timer id")?;
    let id = Uuid::parse_str(&id).with_context(|| format!("invalid timer id in database: {id}"))?;

    Ok(Timer {
        id,
        module: row
            .try_get("callable_module")
            .context("failed to read callable_module")?,
        function: row
            .try_get("callable_function")
            .context("failed to read callable_function")?,
        arguments: row
            .try_get("arguments")
            .context("failed to read arguments")?,
        expires_at: Some(from_micros(
            row.try_get("expires_at")
                .context("failed to read expires_at")?,
        )?),
        duration: row.try_get("duration").context("failed to read duration")?,
        interval: row.try_get("interval").context("failed to read interval")?,
        crontab: row.try_get("crontab").context("failed to read crontab")?,
        crontab_timezone: row
            .try_get("crontab_timezone")
            .context("failed to read crontab_timezone")?,
        calls: row.try_get("calls").context("failed to read calls")?,
        max_calls: row
            .try_get("max_calls")
            .context("failed to read max_calls")?,
        skip_if_offline: row
            .try_get("skip_if_offline")
            .context("failed to read skip_if_offline")?,
        name: row.try_get("name").context("failed to read name")?,
        executing: row
            .try_get("executing")
            .context("failed to read executing")?,
        inserted_at: from_micros(
            row.try_get("inserted_at")
                .context("failed to read inserted_at")?,
        )?,
        updated_at: from_micros(
            row.try_get("updated_at")
                .context("failed to read updated_at")?,
        )?,
    })
}
