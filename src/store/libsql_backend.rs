//! libSQL backend: implements the credential store, cursor store, and job queue.
//!
//! Supports local file and in-memory databases. Queue scheduling columns
//! (`available_at`, `lease_until`, `updated_at`) are epoch milliseconds so
//! they compare numerically.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::SecretString;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{
    ChangeToken, DeadLetter, Delivery, HistoryId, Mailbox, NotificationJob, ProviderKind,
    QueueStats,
};
use crate::store::migrations;
use crate::store::traits::{CredentialStore, CursorStore, JobQueue};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use;
/// each statement executes atomically, which the queue claim relies on.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert an optional cursor to a libsql Value.
fn opt_cursor(cursor: Option<HistoryId>) -> libsql::Value {
    match cursor {
        Some(c) => libsql::Value::Integer(c as i64),
        None => libsql::Value::Null,
    }
}

fn parse_provider(s: &str) -> Result<ProviderKind, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Serialization(e))
}

const MAILBOX_COLUMNS: &str =
    "email, provider, account_id, access_token, history_cursor, needs_reauth, created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, provider, mailbox_key, change_kind, change_token, enqueued_at, attempts, last_error, updated_at";

/// Map a libsql Row to a Mailbox. Column order matches MAILBOX_COLUMNS.
fn row_to_mailbox(row: &libsql::Row) -> Result<Mailbox, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("mailbox row: {e}"));

    let provider_str: String = row.get(1).map_err(read)?;
    let token: String = row.get(3).map_err(read)?;
    let cursor: Option<i64> = row.get::<i64>(4).ok();
    let needs_reauth: i64 = row.get(5).map_err(read)?;
    let created_str: String = row.get(6).map_err(read)?;
    let updated_str: String = row.get(7).map_err(read)?;

    Ok(Mailbox {
        email: row.get(0).map_err(read)?,
        provider: parse_provider(&provider_str)?,
        account_id: row.get(2).map_err(read)?,
        access_token: SecretString::from(token),
        cursor: cursor.map(|c| c as HistoryId),
        needs_reauth: needs_reauth != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a job plus its attempt count and last error.
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<(NotificationJob, u32, Option<String>, i64), DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("job row: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let provider_str: String = row.get(1).map_err(read)?;
    let kind: String = row.get(3).map_err(read)?;
    let token: String = row.get(4).map_err(read)?;
    let enqueued_str: String = row.get(5).map_err(read)?;
    let attempts: i64 = row.get(6).map_err(read)?;
    let last_error: Option<String> = row.get::<String>(7).ok();
    let updated_ms: i64 = row.get(8).map_err(read)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?;
    let change = ChangeToken::from_parts(&kind, &token).ok_or_else(|| {
        DatabaseError::Serialization(format!("job {id_str}: bad change token {kind}:{token}"))
    })?;

    let job = NotificationJob {
        id,
        provider: parse_provider(&provider_str)?,
        mailbox_key: row.get(2).map_err(read)?,
        change,
        enqueued_at: parse_datetime(&enqueued_str),
    };
    Ok((job, attempts.max(0) as u32, last_error, updated_ms))
}

// ── Credential store ────────────────────────────────────────────────

#[async_trait]
impl CredentialStore for LibSqlBackend {
    async fn get_credential(&self, email: &str) -> Result<Option<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_credential: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_mailbox(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_credential: {e}"))),
        }
    }

    async fn find_by_account(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Option<Mailbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE provider = ?1 AND account_id = ?2"
                ),
                params![provider.as_str(), account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_mailbox(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_account: {e}"))),
        }
    }

    async fn upsert_credential(
        &self,
        email: &str,
        provider: ProviderKind,
        account_id: &str,
        access_token: &str,
    ) -> Result<Mailbox, DatabaseError> {
        let now = Utc::now().to_rfc3339();

        match self.get_credential(email).await? {
            Some(existing) if existing.provider != provider => {
                return Err(DatabaseError::Constraint(format!(
                    "mailbox {email} is bound to {}, cannot switch to {provider}",
                    existing.provider
                )));
            }
            Some(_) => {
                self.conn()
                    .execute(
                        "UPDATE mailboxes
                         SET account_id = ?1, access_token = ?2, history_cursor = NULL,
                             needs_reauth = 0, updated_at = ?3
                         WHERE email = ?4",
                        params![account_id, access_token, now, email],
                    )
                    .await
                    .map_err(|e| DatabaseError::Constraint(format!("upsert_credential: {e}")))?;
                info!(mailbox = email, provider = %provider, "Mailbox re-authorized");
            }
            None => {
                self.conn()
                    .execute(
                        "INSERT INTO mailboxes (email, provider, account_id, access_token,
                            history_cursor, needs_reauth, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?5)",
                        params![email, provider.as_str(), account_id, access_token, now],
                    )
                    .await
                    .map_err(|e| DatabaseError::Constraint(format!("upsert_credential: {e}")))?;
                info!(mailbox = email, provider = %provider, "Mailbox registered");
            }
        }

        self.get_credential(email)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "mailbox".into(),
                id: email.to_string(),
            })
    }

    async fn flag_reauth(&self, email: &str) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE mailboxes SET needs_reauth = 1, updated_at = ?1 WHERE email = ?2",
                params![Utc::now().to_rfc3339(), email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("flag_reauth: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "mailbox".into(),
                id: email.to_string(),
            });
        }
        warn!(mailbox = email, "Mailbox flagged for re-authorization");
        Ok(())
    }
}

// ── Cursor store ────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for LibSqlBackend {
    async fn get_cursor(&self, email: &str) -> Result<Option<HistoryId>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT history_cursor FROM mailboxes WHERE email = ?1",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cursor: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).ok().map(|c| c as HistoryId)),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "mailbox".into(),
                id: email.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get_cursor: {e}"))),
        }
    }

    async fn compare_and_set_cursor(
        &self,
        email: &str,
        expected: Option<HistoryId>,
        new: HistoryId,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE mailboxes SET history_cursor = ?1, updated_at = ?2
                 WHERE email = ?3 AND history_cursor IS ?4",
                params![
                    new as i64,
                    Utc::now().to_rfc3339(),
                    email,
                    opt_cursor(expected),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_set_cursor: {e}")))?;

        debug!(mailbox = email, ?expected, new, swapped = updated > 0, "Cursor CAS");
        Ok(updated > 0)
    }
}

// ── Job queue ───────────────────────────────────────────────────────

#[async_trait]
impl JobQueue for LibSqlBackend {
    async fn enqueue(&self, job: &NotificationJob) -> Result<(), DatabaseError> {
        let now = now_ms();
        self.conn()
            .execute(
                "INSERT INTO jobs (id, provider, mailbox_key, change_kind, change_token,
                    enqueued_at, enqueued_ms, state, attempts, available_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'ready', 0, ?8, ?8)",
                params![
                    job.id.to_string(),
                    job.provider.as_str(),
                    job.mailbox_key.as_str(),
                    job.change.kind(),
                    job.change.value(),
                    job.enqueued_at.to_rfc3339(),
                    job.enqueued_at.timestamp_millis(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(job_id = %job.id, provider = %job.provider, "Job enqueued");
        Ok(())
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>, DatabaseError> {
        loop {
            let now = now_ms();
            let lease_id = Uuid::new_v4();
            let mut rows = self
                .conn()
                .query(
                    &format!(
                        "UPDATE jobs
                         SET state = 'leased', attempts = attempts + 1, lease_id = ?1,
                             lease_until = ?2, updated_at = ?3
                         WHERE id = (
                             SELECT id FROM jobs
                             WHERE (state = 'ready' AND available_at <= ?3)
                                OR (state = 'leased' AND lease_until <= ?3)
                             ORDER BY enqueued_ms ASC
                             LIMIT 1
                         )
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![lease_id.to_string(), now + duration_ms(lease), now],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("dequeue: {e}")))?;

            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => return Ok(None),
                Err(e) => return Err(DatabaseError::Query(format!("dequeue: {e}"))),
            };

            match row_to_job(&row) {
                Ok((job, attempts, _, _)) => {
                    debug!(job_id = %job.id, attempts, "Job leased");
                    return Ok(Some(Delivery {
                        job,
                        attempts,
                        lease_id,
                    }));
                }
                Err(e) => {
                    // An undecodable row can never succeed; park it and keep claiming.
                    let id: String = row.get(0).unwrap_or_default();
                    warn!(job_id = %id, error = %e, "Dead-lettering undecodable job");
                    self.conn()
                        .execute(
                            "UPDATE jobs SET state = 'dead', lease_id = NULL, lease_until = NULL,
                                last_error = ?1, updated_at = ?2
                             WHERE id = ?3",
                            params![e.to_string(), now_ms(), id],
                        )
                        .await
                        .map_err(|e| DatabaseError::Query(format!("dequeue: {e}")))?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND lease_id = ?2 AND state = 'leased'",
                params![delivery.job.id.to_string(), delivery.lease_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ack: {e}")))?;

        if deleted == 0 {
            warn!(job_id = %delivery.job.id, "Ack ignored, lease no longer held");
        }
        Ok(deleted > 0)
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET state = 'ready', available_at = ?1, lease_id = NULL, lease_until = NULL,
                     last_error = ?2, updated_at = ?3
                 WHERE id = ?4 AND lease_id = ?5 AND state = 'leased'",
                params![
                    now + duration_ms(retry_in),
                    error,
                    now,
                    delivery.job.id.to_string(),
                    delivery.lease_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("nack: {e}")))?;

        if updated == 0 {
            warn!(job_id = %delivery.job.id, "Nack ignored, lease no longer held");
        }
        Ok(updated > 0)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET state = 'dead', lease_id = NULL, lease_until = NULL,
                     last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND lease_id = ?4 AND state = 'leased'",
                params![
                    reason,
                    now_ms(),
                    delivery.job.id.to_string(),
                    delivery.lease_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letter: {e}")))?;

        Ok(updated > 0)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'dead'
                     ORDER BY updated_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dead_letters: {e}")))?;

        let mut letters = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok((job, attempts, last_error, updated_ms)) => letters.push(DeadLetter {
                    job,
                    attempts,
                    last_error,
                    dead_at: ms_to_datetime(updated_ms),
                }),
                Err(e) => warn!("Skipping dead letter row: {e}"),
            }
        }
        Ok(letters)
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET state = 'ready', attempts = 0, available_at = ?1, last_error = NULL,
                     updated_at = ?1
                 WHERE id = ?2 AND state = 'dead'",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_dead_letter: {e}")))?;

        if updated > 0 {
            info!(job_id = %id, "Dead letter requeued");
        }
        Ok(updated > 0)
    }

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT state, COUNT(*) FROM jobs GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?;

        let mut stats = QueueStats::default();
        while let Ok(Some(row)) = rows.next().await {
            let state: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            let count = count.max(0) as u64;
            match state.as_str() {
                "ready" => stats.ready = count,
                "leased" => stats.leased = count,
                "dead" => stats.dead = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}
