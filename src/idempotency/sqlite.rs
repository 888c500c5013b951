//! Durable idempotency store on SQLite
//!
//! One table keyed by request id. Claims run as `BEGIN IMMEDIATE`
//! transactions so two workers (or two processes sharing the file) cannot
//! both observe "no record" for the same key.

use super::{ClaimOutcome, IdempotencyError, IdempotencyStore, RecordStatus};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS idempotency (
    request_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIdempotencyStore {
    /// Open (or create) the database at `path` in WAL mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IdempotencyError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                IdempotencyError::Unavailable(format!(
                    "cannot create {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        info!(
            "Opened idempotency store at {} (journal_mode={})",
            path.display(),
            journal_mode
        );
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, IdempotencyError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, IdempotencyError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on a blocking thread
    async fn with_conn<T, F>(&self, f: F) -> Result<T, IdempotencyError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, IdempotencyError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| IdempotencyError::Unavailable("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| IdempotencyError::Unavailable(format!("blocking task failed: {e}")))?
    }

    fn claim_blocking(
        conn: &mut Connection,
        request_id: &str,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM idempotency WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?;

        let blocking = match existing {
            Some(status) => RecordStatus::parse(&status)?.as_claim_outcome(),
            None => None,
        };
        let outcome = match blocking {
            Some(duplicate) => duplicate,
            None => {
                tx.execute(
                    "INSERT INTO idempotency (request_id, status, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(request_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
                    params![
                        request_id,
                        RecordStatus::InProgress.as_str(),
                        Utc::now().to_rfc3339()
                    ],
                )?;
                ClaimOutcome::Claimed
            }
        };

        tx.commit()?;
        Ok(outcome)
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn try_claim(&self, request_id: &str) -> Result<ClaimOutcome, IdempotencyError> {
        let request_id = request_id.to_string();
        let outcome = self
            .with_conn(move |conn| Self::claim_blocking(conn, &request_id))
            .await?;
        debug!(outcome = %outcome, "Idempotency claim");
        Ok(outcome)
    }

    async fn commit(&self, request_id: &str) -> Result<(), IdempotencyError> {
        let request_id = request_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO idempotency (request_id, status, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(request_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
                params![request_id, RecordStatus::Done.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn release(&self, request_id: &str) -> Result<(), IdempotencyError> {
        let request_id = request_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE idempotency SET status = ?2, updated_at = ?3
                 WHERE request_id = ?1 AND status = ?4",
                params![
                    request_id,
                    RecordStatus::Failed.as_str(),
                    Utc::now().to_rfc3339(),
                    RecordStatus::InProgress.as_str()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn status(&self, request_id: &str) -> Result<Option<RecordStatus>, IdempotencyError> {
        let request_id = request_id.to_string();
        self.with_conn(move |conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM idempotency WHERE request_id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )
                .optional()?;
            status.as_deref().map(RecordStatus::parse).transpose()
        })
        .await
    }

    async fn health_check(&self) -> Result<(), IdempotencyError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM idempotency", [], |row| {
                row.get::<_, i64>(0)
            })?;
            Ok(())
        })
        .await
    }
}
