//! SQLite ledger.
//!
//! A file-based ledger that survives process restarts. Good for:
//! - Resumable local runs
//! - Single-machine batch jobs
//! - Testing with persistent data (`sqlite::memory:`)

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::debug;

use crate::error::{CascadeError, Result};
use crate::history::History;
use crate::ledger::{ClaimOutcome, Ledger, LedgerRecord, LedgerStatus};
use crate::lineage::LineageId;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed idempotency ledger.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (creating if needed) the ledger at a connection URL.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite://./cascade.db` - File-based database
    pub async fn open(database_url: &str) -> Result<Self> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect(options).await
    }

    /// Open (creating if needed) the ledger stored in the file at `path`.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect(options).await
    }

    /// Create an in-memory ledger (for testing).
    ///
    /// The pool is pinned to a single connection that never expires, since
    /// each SQLite in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cascade_ledger (
                step_name TEXT NOT NULL,
                cascade_id TEXT NOT NULL,
                status TEXT NOT NULL,
                output_payload TEXT NOT NULL DEFAULT '[]',
                history_snapshot TEXT,
                claimed_at TEXT NOT NULL,
                committed_at TEXT,
                PRIMARY KEY (step_name, cascade_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cascade_ledger_status ON cascade_ledger(status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert_claim(&self, step_name: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cascade_ledger (step_name, cascade_id, status, output_payload, claimed_at)
            VALUES (?, ?, ?, '[]', ?)
            ON CONFLICT(step_name, cascade_id) DO NOTHING
            "#,
        )
        .bind(step_name)
        .bind(id)
        .bind(LedgerStatus::InProgress.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

// Row type for sqlx queries
#[derive(Debug, FromRow)]
struct LedgerRow {
    step_name: String,
    cascade_id: String,
    status: String,
    output_payload: String,
    history_snapshot: Option<String>,
    claimed_at: String,
    committed_at: Option<String>,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CascadeError::store(format!("invalid timestamp {raw:?}: {e}")))
}

impl LedgerRow {
    fn into_record(self) -> Result<LedgerRecord> {
        let outputs: Vec<Value> = serde_json::from_str(&self.output_payload)
            .map_err(|e| CascadeError::store(format!("invalid output payload: {e}")))?;

        let history = self
            .history_snapshot
            .as_deref()
            .map(serde_json::from_str::<History>)
            .transpose()
            .map_err(|e| CascadeError::store(format!("invalid history snapshot: {e}")))?;

        Ok(LedgerRecord {
            step_name: self.step_name,
            lineage_id: LineageId::parse(&self.cascade_id)?,
            status: self.status.parse()?,
            outputs,
            history,
            claimed_at: parse_time(&self.claimed_at)?,
            committed_at: self.committed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT step_name, cascade_id, status, output_payload, \
     history_snapshot, claimed_at, committed_at FROM cascade_ledger";

#[async_trait]
impl Ledger for SqliteLedger {
    async fn try_claim(&self, step_name: &str, id: &LineageId) -> Result<ClaimOutcome> {
        let key = id.to_string();
        loop {
            if self.insert_claim(step_name, &key).await? {
                return Ok(ClaimOutcome::Proceed);
            }

            match self.lookup(step_name, id).await? {
                Some(record) if record.is_done() => return Ok(ClaimOutcome::AlreadyDone(record)),
                Some(_) => return Ok(ClaimOutcome::InFlight),
                // Rolled back between the insert and the read
                None => continue,
            }
        }
    }

    async fn commit(
        &self,
        step_name: &str,
        id: &LineageId,
        outputs: &[Value],
        history: Option<&History>,
    ) -> Result<()> {
        let output_payload = serde_json::to_string(outputs)?;
        let history_snapshot = history.map(serde_json::to_string).transpose()?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO cascade_ledger
                (step_name, cascade_id, status, output_payload, history_snapshot, claimed_at, committed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(step_name, cascade_id) DO UPDATE SET
                status = excluded.status,
                output_payload = excluded.output_payload,
                history_snapshot = excluded.history_snapshot,
                committed_at = excluded.committed_at
            WHERE cascade_ledger.status <> 'done'
            "#,
        )
        .bind(step_name)
        .bind(id.to_string())
        .bind(LedgerStatus::Done.as_str())
        .bind(&output_payload)
        .bind(&history_snapshot)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn rollback(&self, step_name: &str, id: &LineageId) -> Result<()> {
        sqlx::query("DELETE FROM cascade_ledger WHERE step_name = ? AND cascade_id = ? AND status = ?")
            .bind(step_name)
            .bind(id.to_string())
            .bind(LedgerStatus::InProgress.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn lookup(&self, step_name: &str, id: &LineageId) -> Result<Option<LedgerRecord>> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "{SELECT_COLUMNS} WHERE step_name = ? AND cascade_id = ?"
        ))
        .bind(step_name)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(LedgerRow::into_record).transpose()
    }

    async fn records(&self, step_name: &str) -> Result<Vec<LedgerRecord>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "{SELECT_COLUMNS} WHERE step_name = ? ORDER BY cascade_id"
        ))
        .bind(step_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerRow::into_record).collect()
    }

    async fn release_stale_claims(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cascade_ledger WHERE status = ?")
            .bind(LedgerStatus::InProgress.as_str())
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected();
        if released > 0 {
            debug!(released, "Released stale ledger claims");
        }
        Ok(released)
    }

    async fn count_done(&self, step_name: &str) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cascade_ledger WHERE step_name = ? AND status = ?",
        )
        .bind(step_name)
        .bind(LedgerStatus::Done.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as usize)
    }
}
