//! SQLite job store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use super::{JobStore, RESTART_FAILURE_LOG};
use crate::runner::{ItemStatus, Job, JobItem, JobParams, JobStatus, JobType};
use crate::{Error, Result};

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 4;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default WAL auto-checkpoint threshold in pages.
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Open a WAL-mode connection pool, creating the database if needed.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g. "sqlite:bookforge.db")
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options)
        .await?;

    info!(
        "Database pool initialized with WAL mode, {} max connections",
        DEFAULT_POOL_SIZE
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    job_type: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    params: String,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            job_type: parse_enum::<JobType>("job type", &row.job_type)?,
            status: parse_enum::<JobStatus>("job status", &row.status)?,
            start_time: parse_time(&row.start_time)?,
            end_time: row.end_time.as_deref().map(parse_time).transpose()?,
            params: serde_json::from_str::<JobParams>(&row.params)?,
            job_id: row.job_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    job_id: String,
    asin: String,
    status: String,
    log: Option<String>,
}

impl TryFrom<ItemRow> for JobItem {
    type Error = Error;

    fn try_from(row: ItemRow) -> Result<Self> {
        Ok(JobItem {
            status: parse_enum::<ItemStatus>("item status", &row.status)?,
            job_id: row.job_id,
            asin: row.asin,
            log: row.log,
        })
    }
}

fn parse_enum<T: FromStr>(what: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Other(format!("invalid {} '{}' in database", what, value)))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp '{}' in database: {}", value, e)))
}

/// [`JobStore`] backed by SQLite through sqlx.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url` and bring its schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &Job, items: &[JobItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, job_type, status, start_time, end_time, params)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(job.job_type.to_string())
        .bind(job.status.to_string())
        .bind(job.start_time.to_rfc3339())
        .bind(job.end_time.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&job.params)?)
        .execute(&mut *tx)
        .await?;

        for (position, item) in items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO job_items (job_id, asin, position, status, log) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&item.job_id)
            .bind(&item.asin)
            .bind(position as i64)
            .bind(item.status.to_string())
            .bind(&item.log)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn persist_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                end_time = ?,
                params = ?
            WHERE job_id = ?
            "#,
        )
        .bind(job.status.to_string())
        .bind(job.end_time.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&job.params)?)
        .bind(&job.job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("job", &job.job_id));
        }
        Ok(())
    }

    async fn persist_item(&self, item: &JobItem) -> Result<()> {
        let result = sqlx::query("UPDATE job_items SET status = ?, log = ? WHERE job_id = ? AND asin = ?")
            .bind(item.status.to_string())
            .bind(&item.log)
            .bind(&item.job_id)
            .bind(&item.asin)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("job item", format!("{}/{}", item.job_id, item.asin)));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list_items(&self, job_id: &str) -> Result<Vec<JobItem>> {
        sqlx::query_as::<_, ItemRow>(
            "SELECT job_id, asin, status, log FROM job_items WHERE job_id = ? ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(JobItem::try_from)
        .collect()
    }

    async fn fail_stale_jobs(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE job_items SET status = 'FAILED', log = ?
            WHERE status IN ('QUEUED', 'PROCESSING')
            AND job_id IN (SELECT job_id FROM jobs WHERE status IN ('QUEUED', 'RUNNING'))
            "#,
        )
        .bind(RESTART_FAILURE_LOG)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE jobs SET status = 'FAILED', end_time = ? WHERE status IN ('QUEUED', 'RUNNING')",
        )
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
