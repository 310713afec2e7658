//! Store double that wraps a real backend and injects stalls and missing rows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{
    DeadLetter, Delivery, HistoryId, Mailbox, NotificationJob, ProviderKind, QueueStats,
};
use crate::store::{CredentialStore, CursorStore, JobQueue, LibSqlBackend};

/// Delegates to an in-memory `LibSqlBackend` unless a switch is set.
pub struct FaultyStore {
    pub inner: LibSqlBackend,
    pub hang_enqueue: AtomicBool,
    pub hang_dequeue: AtomicBool,
    /// Stalls `ack`, `nack`, and `dead_letter`.
    pub hang_settle: AtomicBool,
    pub hang_flag_reauth: AtomicBool,
    /// Cursor reads and writes answer `NotFound`, as if the mailbox was removed.
    pub mailbox_removed: AtomicBool,
}

impl FaultyStore {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            hang_enqueue: AtomicBool::new(false),
            hang_dequeue: AtomicBool::new(false),
            hang_settle: AtomicBool::new(false),
            hang_flag_reauth: AtomicBool::new(false),
            mailbox_removed: AtomicBool::new(false),
        }
    }

    async fn stall_if(switch: &AtomicBool) {
        if switch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    fn check_mailbox(&self, email: &str) -> Result<(), DatabaseError> {
        if self.mailbox_removed.load(Ordering::SeqCst) {
            return Err(DatabaseError::NotFound {
                entity: "mailbox".into(),
                id: email.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FaultyStore {
    async fn get_credential(&self, email: &str) -> Result<Option<Mailbox>, DatabaseError> {
        self.inner.get_credential(email).await
    }

    async fn find_by_account(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Option<Mailbox>, DatabaseError> {
        self.inner.find_by_account(provider, account_id).await
    }

    async fn upsert_credential(
        &self,
        email: &str,
        provider: ProviderKind,
        account_id: &str,
        access_token: &str,
    ) -> Result<Mailbox, DatabaseError> {
        self.inner
            .upsert_credential(email, provider, account_id, access_token)
            .await
    }

    async fn flag_reauth(&self, email: &str) -> Result<(), DatabaseError> {
        Self::stall_if(&self.hang_flag_reauth).await;
        self.inner.flag_reauth(email).await
    }
}

#[async_trait]
impl CursorStore for FaultyStore {
    async fn get_cursor(&self, email: &str) -> Result<Option<HistoryId>, DatabaseError> {
        self.check_mailbox(email)?;
        self.inner.get_cursor(email).await
    }

    async fn compare_and_set_cursor(
        &self,
        email: &str,
        expected: Option<HistoryId>,
        new: HistoryId,
    ) -> Result<bool, DatabaseError> {
        self.check_mailbox(email)?;
        self.inner.compare_and_set_cursor(email, expected, new).await
    }
}

#[async_trait]
impl JobQueue for FaultyStore {
    async fn enqueue(&self, job: &NotificationJob) -> Result<(), DatabaseError> {
        Self::stall_if(&self.hang_enqueue).await;
        self.inner.enqueue(job).await
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>, DatabaseError> {
        Self::stall_if(&self.hang_dequeue).await;
        self.inner.dequeue(lease).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, DatabaseError> {
        Self::stall_if(&self.hang_settle).await;
        self.inner.ack(delivery).await
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        retry_in: Duration,
        error: &str,
    ) -> Result<bool, DatabaseError> {
        Self::stall_if(&self.hang_settle).await;
        self.inner.nack(delivery, retry_in, error).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<bool, DatabaseError> {
        Self::stall_if(&self.hang_settle).await;
        self.inner.dead_letter(delivery, reason).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, DatabaseError> {
        self.inner.list_dead_letters(limit).await
    }

    async fn requeue_dead_letter(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.requeue_dead_letter(id).await
    }

    async fn queue_stats(&self) -> Result<QueueStats, DatabaseError> {
        self.inner.queue_stats().await
    }
}
