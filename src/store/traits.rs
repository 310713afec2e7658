//! Storage traits: credential store, cursor store, and durable job queue.
//!
//! The pipeline only depends on these traits. `LibSqlBackend` implements
//! all three on one database; `Database` is the combined bound.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{
    DeadLetter, Delivery, HistoryId, Mailbox, NotificationJob, ProviderKind, QueueStats,
};

/// Bounded retries for a contended cursor compare-and-swap.
const MAX_CURSOR_CAS_ATTEMPTS: usize = 16;

/// Maps a mailbox to its provider and credential.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up a mailbox by email address.
    async fn get_credential(&self, email: &str) -> Result<Option<Mailbox>, DatabaseError>;

    /// Look up a mailbox by its provider-side account id.
    async fn find_by_account(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Option<Mailbox>, DatabaseError>;

    /// Create a mailbox, or replace its credential on re-authorization.
    ///
    /// Re-authorization resets the cursor and clears the re-auth flag.
    /// Changing the provider of an existing mailbox is a constraint error.
    async fn upsert_credential(
        &self,
        email: &str,
        provider: ProviderKind,
        account_id: &str,
        access_token: &str,
    ) -> Result<Mailbox, DatabaseError>;

    /// Mark a mailbox as needing re-authorization.
    async fn flag_reauth(&self, email: &str) -> Result<(), DatabaseError>;
}

/// Per-mailbox last-processed history position.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Current cursor; `NotFound` if the mailbox does not exist.
    async fn get_cursor(&self, email: &str) -> Result<Option<HistoryId>, DatabaseError>;

    /// Set the cursor to `new` only if it currently equals `expected`.
    async fn compare_and_set_cursor(
        &self,
        email: &str,
        expected: Option<HistoryId>,
        new: HistoryId,
    ) -> Result<bool, DatabaseError>;

    /// Move the cursor forward to `new`, never backward.
    ///
    /// Returns `false` when the stored cursor is already at or past `new`.
    async fn advance_cursor(&self, email: &str, new: HistoryId) -> Result<bool, DatabaseError> {
        for _ in 0..MAX_CURSOR_CAS_ATTEMPTS {
            let current = self.get_cursor(email).await?;
            if current.is_some_and(|c| c >= new) {
                return Ok(false);
            }
            if self.compare_and_set_cursor(email, current, new).await? {
                return Ok(true);
            }
            tracing::debug!(mailbox = email, new, "Cursor CAS lost a race, retrying");
        }
        Err(DatabaseError::Constraint(format!(
            "cursor for {email} still contended after {MAX_CURSOR_CAS_ATTEMPTS} attempts"
        )))
    }
}

/// At-least-once job queue with leases and a dead-letter state.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job and make it visible to workers.
    async fn enqueue(&self, job: &NotificationJob) -> Result<(), DatabaseError>;

    /// Claim the next available job for `lease`.
    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>, DatabaseError>;

    /// Remove a successfully processed job. `false` if the lease was lost.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, DatabaseError>;

    /// Return a job for redelivery after `retry_in`. `false` if the lease was lost.
    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<bool, DatabaseError>;

    /// Park a job for manual inspection. `false` if the lease was lost.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, DatabaseError>;

    /// Most recent dead-lettered jobs.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, DatabaseError>;

    /// Put a dead-lettered job back in the queue with a fresh attempt budget.
    async fn requeue_dead_letter(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Job counts per state.
    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError>;
}

/// Everything the service persists.
pub trait Database: CredentialStore + CursorStore + JobQueue {}

impl<T: CredentialStore + CursorStore + JobQueue> Database for T {}
