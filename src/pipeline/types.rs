//! Shared types for the notification pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position in a Gmail mailbox's change history.
pub type HistoryId = u64;

// ── Provider kind ───────────────────────────────────────────────────

/// Which mail provider a mailbox belongs to. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Gmail: push notifications carry a history id.
    Google,
    /// Microsoft Graph: notifications carry a message resource path.
    Microsoft,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" | "gmail" => Ok(Self::Google),
            "microsoft" | "outlook" => Ok(Self::Microsoft),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

// ── Mailbox identity ────────────────────────────────────────────────

/// A mailbox bound to a provider and its credential.
#[derive(Debug, Clone)]
pub struct Mailbox {
    /// Email address, unique key.
    pub email: String,
    pub provider: ProviderKind,
    /// Provider-side account identifier (Graph user id for Microsoft).
    pub account_id: String,
    pub access_token: SecretString,
    /// Last committed history position (Gmail only).
    pub cursor: Option<HistoryId>,
    /// Set when the provider rejected the credential; cleared on re-authorization.
    pub needs_reauth: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Notification job ────────────────────────────────────────────────

/// What changed, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeToken {
    /// The mailbox history advanced to this position.
    History { history_id: HistoryId },
    /// A specific message was created.
    Message { message_id: String },
}

impl ChangeToken {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::History { .. } => "history",
            Self::Message { .. } => "message",
        }
    }

    /// The raw token value as stored in the queue.
    pub fn value(&self) -> String {
        match self {
            Self::History { history_id } => history_id.to_string(),
            Self::Message { message_id } => message_id.clone(),
        }
    }

    /// Rebuild a token from its stored kind and value.
    pub fn from_parts(kind: &str, value: &str) -> Option<Self> {
        match kind {
            "history" => value
                .parse()
                .ok()
                .map(|history_id| Self::History { history_id }),
            "message" if !value.is_empty() => Some(Self::Message {
                message_id: value.to_string(),
            }),
            _ => None,
        }
    }
}

/// One "something changed" signal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: Uuid,
    pub provider: ProviderKind,
    /// Email address (Google) or provider account id (Microsoft).
    pub mailbox_key: String,
    pub change: ChangeToken,
    pub enqueued_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn new(provider: ProviderKind, mailbox_key: impl Into<String>, change: ChangeToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            mailbox_key: mailbox_key.into(),
            change,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job handed to one worker under a lease.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: NotificationJob,
    /// Delivery attempts including this one.
    pub attempts: u32,
    /// Identifies this lease; settling with a stale lease is a no-op.
    pub lease_id: Uuid,
}

/// A job parked after exhausting retries or failing authorization.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job: NotificationJob,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub dead_at: DateTime<Utc>,
}

/// Job counts per queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub leased: u64,
    pub dead: u64,
}

// ── Messages ────────────────────────────────────────────────────────

/// A message discovered in a change range, not yet checked for eligibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: Option<String>,
    /// Label ids known from the change listing, if the provider reports them.
    pub label_ids: Option<Vec<String>>,
}

impl MessageRef {
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
            label_ids: None,
        }
    }
}

/// A fetched email. Read-only, fetched fresh for every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Provider-native message id.
    pub id: String,
    /// Thread (Gmail) or conversation (Graph) id.
    pub thread_id: String,
    /// Raw sender, e.g. `Alice <alice@example.com>`.
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: Option<String>,
    /// Snippet or body preview.
    pub body: String,
    pub is_unread: bool,
    /// RFC 5322 `Message-ID` header, used for reply threading.
    pub internet_message_id: Option<String>,
    /// Gmail label ids or Outlook category names currently on the message.
    pub labels: Vec<String>,
}

impl MessageEnvelope {
    /// The bare address of the sender (`alice@example.com`).
    pub fn sender_address(&self) -> &str {
        extract_address(&self.from)
    }
}

/// Pull the address out of a `Name <addr>` header value.
pub fn extract_address(raw: &str) -> &str {
    match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => raw[start + 1..end].trim(),
        _ => raw.trim(),
    }
}

// ── Labels ──────────────────────────────────────────────────────────

/// A provider label (Gmail label or Outlook category).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// The fixed classification universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassLabel {
    Interested,
    NotInterested,
    MoreInformation,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 3] = [
        ClassLabel::Interested,
        ClassLabel::NotInterested,
        ClassLabel::MoreInformation,
    ];

    /// Display name, also the label name created in the mailbox.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interested => "Interested",
            Self::NotInterested => "Not Interested",
            Self::MoreInformation => "More Information",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Counters for one processed job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Cursor after commit (Gmail only).
    pub cursor: Option<HistoryId>,
}

/// Successful end states of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// All candidates handled and state committed.
    Committed(JobReport),
    /// Nothing to do, e.g. the mailbox is no longer authorized here.
    Discarded { reason: String },
}
