//! Job processor: runs one notification job end to end.
//!
//! Flow:
//! 1. Resolve the mailbox (by email for Gmail, by account id for Graph)
//! 2. Resolve history bounds: stored cursor → job token (Gmail only)
//! 3. Enumerate candidates
//! 4. Per candidate: eligibility → prompt → generate → send → classify → label
//! 5. Commit: advance the cursor to the job token (monotonic CAS)
//!
//! Every awaited call runs under `call_timeout`. Authorization failures
//! flag the mailbox and abort the job. Transient failures before a reply is
//! sent abort the job so the queue retries it; anything else is logged and
//! the next candidate is processed. On the final attempt transient failures
//! are skipped too, so the cursor still moves past a message that keeps
//! failing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, LlmError, PipelineError, ProviderError};
use crate::llm::ReplyGenerator;
use crate::pipeline::classify::classify;
use crate::pipeline::labels::LabelResolver;
use crate::pipeline::prompt::build_reply_prompt;
use crate::pipeline::state::{JobStage, StageTracker};
use crate::pipeline::types::{
    ChangeToken, HistoryId, JobOutcome, JobReport, Mailbox, MessageRef, NotificationJob,
    ProviderKind,
};
use crate::providers::google::UNREAD_LABEL;
use crate::providers::{MailProvider, ProviderFactory};
use crate::store::Database;

/// Processor settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Upper bound for each provider, LLM, or store call.
    pub call_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(20),
        }
    }
}

/// Whether the queue will deliver a job again if it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Retryable,
    /// No redelivery follows. Failing candidates are skipped and counted so
    /// the cursor is committed past them; only authorization failures abort.
    Final,
}

/// Result of one candidate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    Replied { labeled: bool },
    Skipped(&'static str),
}

/// Why a candidate did not complete.
#[derive(Debug)]
enum CandidateError {
    /// Stop the whole job; the worker decides ack/nack/dead-letter.
    Abort(PipelineError),
    /// Give up on this candidate only.
    Failed(String),
}

impl From<PipelineError> for CandidateError {
    fn from(e: PipelineError) -> Self {
        Self::Abort(e)
    }
}

/// Map a provider failure that ends the whole job.
fn abort_error(mailbox: &str, operation: &str, e: ProviderError) -> PipelineError {
    match e {
        ProviderError::Unauthorized { .. } => PipelineError::AuthorizationExpired {
            mailbox: mailbox.to_string(),
        },
        ProviderError::RateLimited { retry_after, .. } => PipelineError::RateLimited {
            operation: operation.to_string(),
            retry_after,
        },
        other => PipelineError::Transient {
            operation: operation.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Route a provider failure that happened before the reply was sent.
fn before_send(mailbox: &str, operation: &str, e: ProviderError) -> CandidateError {
    if matches!(e, ProviderError::Unauthorized { .. }) || e.is_transient() {
        CandidateError::Abort(abort_error(mailbox, operation, e))
    } else {
        CandidateError::Failed(format!("{operation}: {e}"))
    }
}

/// Route a provider failure that happened after the reply was sent.
/// Only authorization failures stop the job; retrying would re-send.
fn after_send(mailbox: &str, operation: &str, e: ProviderError) -> CandidateError {
    match e {
        ProviderError::Unauthorized { .. } => {
            CandidateError::Abort(abort_error(mailbox, operation, e))
        }
        other => CandidateError::Failed(format!("{operation}: {other}")),
    }
}

/// An empty reply gives up on the message. Everything else, content policy
/// refusals included, aborts the job for redelivery.
fn generation_error(e: LlmError) -> CandidateError {
    match e {
        LlmError::EmptyResponse { .. } => CandidateError::Failed(format!("generate_reply: {e}")),
        LlmError::RateLimited { retry_after, .. } => {
            CandidateError::Abort(PipelineError::RateLimited {
                operation: "generate_reply".into(),
                retry_after,
            })
        }
        other => CandidateError::Abort(PipelineError::Transient {
            operation: "generate_reply".into(),
            reason: other.to_string(),
        }),
    }
}

fn mailbox_removed(mailbox: &Mailbox) -> JobOutcome {
    info!(mailbox = %mailbox.email, "Mailbox removed during job, discarding");
    JobOutcome::Discarded {
        reason: format!("mailbox {} removed", mailbox.email),
    }
}

/// Runs notification jobs. Holds no per-job state; safe to share across workers.
pub struct JobProcessor {
    db: Arc<dyn Database>,
    providers: Arc<dyn ProviderFactory>,
    generator: Arc<dyn ReplyGenerator>,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        providers: Arc<dyn ProviderFactory>,
        generator: Arc<dyn ReplyGenerator>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            db,
            providers,
            generator,
            config,
        }
    }

    /// Run `fut` under the per-call timeout.
    async fn timed<T, F: Future<Output = T>>(
        &self,
        operation: &str,
        fut: F,
    ) -> Result<T, PipelineError> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| PipelineError::Timeout {
                operation: operation.to_string(),
                timeout: self.config.call_timeout,
            })
    }

    /// Cursor store call under the per-call timeout. `Ok(None)` when the
    /// mailbox row no longer exists.
    async fn cursor_call<T, F>(&self, operation: &str, fut: F) -> Result<Option<T>, PipelineError>
    where
        F: Future<Output = Result<T, DatabaseError>>,
    {
        match self.timed(operation, fut).await? {
            Ok(value) => Ok(Some(value)),
            Err(DatabaseError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Process one job on an attempt that may be retried.
    pub async fn process(&self, job: &NotificationJob) -> Result<JobOutcome, PipelineError> {
        self.process_attempt(job, Attempt::Retryable).await
    }

    /// Process one job.
    pub async fn process_attempt(
        &self,
        job: &NotificationJob,
        attempt: Attempt,
    ) -> Result<JobOutcome, PipelineError> {
        info!(
            job_id = %job.id,
            provider = %job.provider,
            mailbox = %job.mailbox_key,
            change = %job.change.value(),
            ?attempt,
            "Processing notification job"
        );
        let mut stages = StageTracker::new();

        // Step 1: Mailbox
        let lookup = match job.provider {
            ProviderKind::Google => {
                self.timed("get_credential", self.db.get_credential(&job.mailbox_key))
                    .await??
            }
            ProviderKind::Microsoft => {
                self.timed(
                    "find_by_account",
                    self.db.find_by_account(ProviderKind::Microsoft, &job.mailbox_key),
                )
                .await??
            }
        };
        let Some(mailbox) = lookup else {
            info!(job_id = %job.id, mailbox = %job.mailbox_key, "Mailbox not registered, discarding");
            return Ok(JobOutcome::Discarded {
                reason: format!("no mailbox for {}", job.mailbox_key),
            });
        };
        if mailbox.needs_reauth {
            warn!(job_id = %job.id, mailbox = %mailbox.email, "Mailbox awaiting re-authorization");
            return Err(PipelineError::AuthorizationExpired {
                mailbox: mailbox.email.clone(),
            });
        }

        let provider = self.providers.for_mailbox(&mailbox);

        let result = self.run(job, &mailbox, provider, attempt, &mut stages).await;
        if let Err(PipelineError::AuthorizationExpired { .. }) = &result {
            let flagged = self
                .timed("flag_reauth", self.db.flag_reauth(&mailbox.email))
                .await
                .and_then(|r| r.map_err(PipelineError::from));
            if let Err(e) = flagged {
                error!(mailbox = %mailbox.email, error = %e, "Failed to flag mailbox for re-authorization");
            }
        }
        if let Ok(outcome) = &result {
            info!(job_id = %job.id, stages = ?stages.history(), ?outcome, "Job finished");
        }
        result
    }

    async fn run(
        &self,
        job: &NotificationJob,
        mailbox: &Mailbox,
        provider: Arc<dyn MailProvider>,
        attempt: Attempt,
        stages: &mut StageTracker,
    ) -> Result<JobOutcome, PipelineError> {
        // Step 2: Bounds
        let (candidates, commit_to) = match (&job.change, mailbox.provider) {
            (ChangeToken::History { history_id }, ProviderKind::Google) => {
                let token = *history_id;
                let Some(stored) = self
                    .cursor_call("get_cursor", self.db.get_cursor(&mailbox.email))
                    .await?
                else {
                    return Ok(mailbox_removed(mailbox));
                };
                stages.advance(JobStage::CursorResolved);

                match stored {
                    None => {
                        info!(mailbox = %mailbox.email, token, "No cursor yet, establishing baseline");
                        return self.commit(mailbox, Some(token), JobReport::default(), stages).await;
                    }
                    Some(cursor) if token <= cursor => {
                        debug!(mailbox = %mailbox.email, token, cursor, "Stale notification, nothing to enumerate");
                        let report = JobReport {
                            cursor: Some(cursor),
                            ..JobReport::default()
                        };
                        stages.advance(JobStage::Committed);
                        return Ok(JobOutcome::Committed(report));
                    }
                    Some(cursor) => {
                        let refs = self.enumerate(mailbox, provider.as_ref(), cursor, token).await?;
                        (refs, Some(token))
                    }
                }
            }
            (ChangeToken::Message { message_id }, ProviderKind::Microsoft) => {
                stages.advance(JobStage::CursorResolved);
                (vec![MessageRef::bare(message_id.clone())], None)
            }
            (change, kind) => {
                warn!(job_id = %job.id, change = change.kind(), provider = %kind, "Change token does not match provider");
                return Ok(JobOutcome::Discarded {
                    reason: format!("{} token for {kind} mailbox", change.kind()),
                });
            }
        };
        stages.advance(JobStage::CandidatesFetched);
        debug!(job_id = %job.id, count = candidates.len(), stage = %stages.current(), "Candidates fetched");

        // Step 3: Candidates
        let mut report = JobReport::default();
        let mut labels = LabelResolver::new(Arc::clone(&provider));
        for candidate in &candidates {
            let outcome = self
                .process_candidate(mailbox, provider.as_ref(), &mut labels, candidate, stages)
                .await;
            match outcome {
                Ok(CandidateOutcome::Replied { labeled }) => {
                    report.replied += 1;
                    if !labeled {
                        warn!(message_id = %candidate.id, "Reply sent but message left unlabeled");
                    }
                }
                Ok(CandidateOutcome::Skipped(reason)) => {
                    report.skipped += 1;
                    debug!(message_id = %candidate.id, reason, "Candidate skipped");
                }
                Err(CandidateError::Failed(reason)) => {
                    report.failed += 1;
                    warn!(message_id = %candidate.id, reason = %reason, "Candidate failed");
                }
                Err(CandidateError::Abort(e))
                    if attempt == Attempt::Final
                        && !matches!(e, PipelineError::AuthorizationExpired { .. }) =>
                {
                    report.failed += 1;
                    warn!(job_id = %job.id, message_id = %candidate.id, error = %e, "Final attempt, skipping message");
                }
                Err(CandidateError::Abort(e)) => {
                    warn!(job_id = %job.id, message_id = %candidate.id, stage = %stages.current(), error = %e, "Aborting job");
                    return Err(e);
                }
            }
            if stages.current() != JobStage::CandidatesFetched {
                stages.advance(JobStage::CandidatesFetched);
            }
        }

        // Step 4: Commit
        self.commit(mailbox, commit_to, report, stages).await
    }

    /// History records in `(cursor, token]`. Expired history yields nothing.
    async fn enumerate(
        &self,
        mailbox: &Mailbox,
        provider: &dyn MailProvider,
        cursor: HistoryId,
        token: HistoryId,
    ) -> Result<Vec<MessageRef>, PipelineError> {
        let listed = self
            .timed("fetch_changes", provider.fetch_changes_since(cursor, token))
            .await?;
        match listed {
            Ok(refs) => Ok(refs),
            Err(ProviderError::NotFound { .. }) => {
                warn!(mailbox = %mailbox.email, cursor, "History expired, skipping to token");
                Ok(Vec::new())
            }
            Err(e) => Err(abort_error(&mailbox.email, "fetch_changes", e)),
        }
    }

    async fn process_candidate(
        &self,
        mailbox: &Mailbox,
        provider: &dyn MailProvider,
        labels: &mut LabelResolver,
        candidate: &MessageRef,
        stages: &mut StageTracker,
    ) -> Result<CandidateOutcome, CandidateError> {
        let email = mailbox.email.as_str();

        // Eligibility: unread, not from us, alone in its thread, not yet labeled.
        if let Some(ids) = &candidate.label_ids {
            if !ids.iter().any(|l| l == UNREAD_LABEL) {
                stages.advance(JobStage::Filtered);
                return Ok(CandidateOutcome::Skipped("read"));
            }
        }

        let message = match self
            .timed("fetch_message", provider.fetch_message(&candidate.id))
            .await?
        {
            Ok(message) => message,
            Err(ProviderError::NotFound { .. }) => {
                stages.advance(JobStage::Filtered);
                return Ok(CandidateOutcome::Skipped("message no longer exists"));
            }
            Err(e) => return Err(before_send(email, "fetch_message", e)),
        };

        if !message.is_unread {
            stages.advance(JobStage::Filtered);
            return Ok(CandidateOutcome::Skipped("read"));
        }
        if message.sender_address().eq_ignore_ascii_case(email) {
            stages.advance(JobStage::Filtered);
            return Ok(CandidateOutcome::Skipped("sent by mailbox owner"));
        }

        let thread_size = self
            .timed("thread_size", provider.thread_message_count(&message.thread_id))
            .await?
            .map_err(|e| before_send(email, "thread_size", e))?;
        if thread_size != 1 {
            stages.advance(JobStage::Filtered);
            return Ok(CandidateOutcome::Skipped("thread has more than one message"));
        }

        let labeled = self
            .timed("list_labels", labels.already_labeled(&message))
            .await?
            .map_err(|e| before_send(email, "list_labels", e))?;
        if labeled {
            stages.advance(JobStage::Filtered);
            return Ok(CandidateOutcome::Skipped("already labeled"));
        }
        stages.advance(JobStage::Processed);

        // Reply
        let prompt = build_reply_prompt(&message);
        debug!(message_id = %message.id, model = self.generator.model_name(), "Generating reply");
        let reply = self
            .timed("generate_reply", self.generator.generate(&prompt))
            .await?
            .map_err(generation_error)?;

        let sent_id = self
            .timed("send_reply", provider.send_reply(&message, &reply))
            .await?
            .map_err(|e| before_send(email, "send_reply", e))?;
        stages.advance(JobStage::ReplySent);
        info!(
            mailbox = email,
            message_id = %message.id,
            sent_id = sent_id.as_deref().unwrap_or("-"),
            "Auto-reply sent"
        );

        // Label. Failures from here on must not trigger a retry.
        let class = classify(&reply);
        let label = match self.timed("resolve_label", labels.resolve(class)).await {
            Ok(Ok(label)) => label,
            Ok(Err(e)) => return after_send(email, "resolve_label", e).into_unlabeled(),
            Err(timeout) => {
                warn!(message_id = %message.id, error = %timeout, "Label resolution timed out");
                return Ok(CandidateOutcome::Replied { labeled: false });
            }
        };
        let Some(label) = label else {
            warn!(message_id = %message.id, class = %class, "No label available");
            return Ok(CandidateOutcome::Replied { labeled: false });
        };

        match self
            .timed("apply_label", provider.apply_label(&message.id, &label))
            .await
        {
            Ok(Ok(())) => {
                stages.advance(JobStage::Labeled);
                info!(message_id = %message.id, label = %label.name, "Label applied");
                Ok(CandidateOutcome::Replied { labeled: true })
            }
            Ok(Err(e)) => after_send(email, "apply_label", e).into_unlabeled(),
            Err(timeout) => {
                warn!(message_id = %message.id, error = %timeout, "Label apply timed out");
                Ok(CandidateOutcome::Replied { labeled: false })
            }
        }
    }

    /// Advance the cursor (Gmail) and finish the job.
    async fn commit(
        &self,
        mailbox: &Mailbox,
        commit_to: Option<HistoryId>,
        mut report: JobReport,
        stages: &mut StageTracker,
    ) -> Result<JobOutcome, PipelineError> {
        if let Some(token) = commit_to {
            let Some(advanced) = self
                .cursor_call("advance_cursor", self.db.advance_cursor(&mailbox.email, token))
                .await?
            else {
                return Ok(mailbox_removed(mailbox));
            };
            if !advanced {
                debug!(mailbox = %mailbox.email, token, "Cursor already at or past token");
            }
            let Some(stored) = self
                .cursor_call("get_cursor", self.db.get_cursor(&mailbox.email))
                .await?
            else {
                return Ok(mailbox_removed(mailbox));
            };
            report.cursor = stored;
        }
        stages.advance(JobStage::Committed);
        Ok(JobOutcome::Committed(report))
    }
}

impl CandidateError {
    /// After a reply went out: abort on auth failure, otherwise count the
    /// candidate as replied but unlabeled.
    fn into_unlabeled(self) -> Result<CandidateOutcome, CandidateError> {
        match self {
            Self::Abort(e) => Err(Self::Abort(e)),
            Self::Failed(reason) => {
                warn!(reason = %reason, "Labeling failed after reply");
                Ok(CandidateOutcome::Replied { labeled: false })
            }
        }
    }
}
