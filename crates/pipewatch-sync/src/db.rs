//! SQLite pool setup, embedded migrations and ingestion run bookkeeping.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use pipewatch_core::Company;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::IngestError;

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))?;
    debug!(database_url, "database pool initialized");
    Ok(pool)
}

/// Single-connection in-memory database. The connection is never recycled,
/// so the schema lives as long as the pool.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), IngestError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(text: &str) -> Result<DateTime<Utc>, IngestError> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| IngestError::InvalidRow(format!("timestamp {text:?}: {e}")))
}

pub(crate) fn parse_uuid(text: &str) -> Result<Uuid, IngestError> {
    Uuid::parse_str(text).map_err(|e| IngestError::InvalidRow(format!("uuid {text:?}: {e}")))
}

pub(crate) fn parse_text<T>(text: &str) -> Result<T, IngestError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    text.parse()
        .map_err(|e: T::Err| IngestError::InvalidRow(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Pipeline,
    Trials,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Pipeline => "pipeline",
            RunType::Trials => "trials",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionRun {
    pub id: i64,
    pub company_id: String,
    pub run_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub notes: Option<String>,
}

pub async fn ensure_company(pool: &SqlitePool, company: &Company) -> Result<(), IngestError> {
    sqlx::query("INSERT INTO companies (id, name) VALUES (?, ?) ON CONFLICT (id) DO NOTHING")
        .bind(&company.id)
        .bind(&company.name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Open a run and take the company's write lock in one transaction.
///
/// A live lock held by another run fails with `RunInProgress`; a lock older
/// than `lock_ttl` belongs to a crashed run and is taken over. SQLite's write
/// lock is held from `BEGIN`, so racing callers queue on the busy timeout.
pub async fn begin_run(
    pool: &SqlitePool,
    company_id: &str,
    run_type: RunType,
    lock_ttl: Duration,
) -> Result<i64, IngestError> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;
    let now = Utc::now();

    let holder = sqlx::query("SELECT run_id, acquired_at FROM run_locks WHERE company_id = ?")
        .bind(company_id)
        .fetch_optional(&mut *tx)
        .await?;
    if let Some(row) = holder {
        let holder_run: i64 = row.try_get("run_id")?;
        let acquired_at = parse_ts(&row.try_get::<String, _>("acquired_at")?)?;
        let stale = now
            .signed_duration_since(acquired_at)
            .to_std()
            .map(|age| age >= lock_ttl)
            .unwrap_or(false);
        if !stale {
            return Err(IngestError::RunInProgress {
                company_id: company_id.to_string(),
                run_id: Some(holder_run),
            });
        }
        warn!(company_id, stale_run_id = holder_run, "taking over expired run lock");
        sqlx::query(
            "UPDATE ingestion_runs SET status = 'error', finished_at = ?, notes = 'run lock expired' \
             WHERE id = ? AND status = 'running'",
        )
        .bind(ts(now))
        .bind(holder_run)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM run_locks WHERE company_id = ?")
            .bind(company_id)
            .execute(&mut *tx)
            .await?;
    }

    let run_id = sqlx::query(
        "INSERT INTO ingestion_runs (company_id, run_type, started_at, status) VALUES (?, ?, ?, 'running')",
    )
    .bind(company_id)
    .bind(run_type.as_str())
    .bind(ts(now))
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    sqlx::query("INSERT INTO run_locks (company_id, run_id, acquired_at) VALUES (?, ?, ?)")
        .bind(company_id)
        .bind(run_id)
        .bind(ts(now))
        .execute(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => IngestError::RunInProgress {
                company_id: company_id.to_string(),
                run_id: None,
            },
            _ => IngestError::Database(err),
        })?;

    tx.commit().await?;
    debug!(company_id, run_id, run_type = run_type.as_str(), "run started");
    Ok(run_id)
}

pub async fn finish_run(
    pool: &SqlitePool,
    company_id: &str,
    run_id: i64,
    status: RunStatus,
    notes: &str,
) -> Result<(), IngestError> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE ingestion_runs SET status = ?, finished_at = ?, notes = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(ts(Utc::now()))
        .bind(notes)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM run_locks WHERE company_id = ? AND run_id = ?")
        .bind(company_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn list_runs(
    pool: &SqlitePool,
    company_id: &str,
    limit: i64,
) -> Result<Vec<IngestionRun>, IngestError> {
    let rows = sqlx::query(
        "SELECT id, company_id, run_type, started_at, finished_at, status, notes \
         FROM ingestion_runs WHERE company_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(company_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let finished_at: Option<String> = row.try_get("finished_at")?;
            Ok(IngestionRun {
                id: row.try_get("id")?,
                company_id: row.try_get("company_id")?,
                run_type: row.try_get("run_type")?,
                started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
                finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
                status: row.try_get("status")?,
                notes: row.try_get("notes")?,
            })
        })
        .collect()
}
