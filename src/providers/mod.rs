//! Mail provider adapters.
//!
//! The orchestrator only talks to `MailProvider`. Each mailbox gets its own
//! adapter bound to its own credential (`ProviderFactory::for_mailbox`);
//! the underlying `reqwest::Client` connection pool is shared.
//!
//! - **Gmail** (`google`): REST v1, history-based change enumeration.
//! - **Microsoft Graph** (`microsoft`): v1.0, notifications name the message.

pub mod google;
pub mod microsoft;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;

use crate::error::ProviderError;
use crate::pipeline::types::{HistoryId, Label, Mailbox, MessageEnvelope, MessageRef, ProviderKind};

pub use google::GmailProvider;
pub use microsoft::GraphProvider;

pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Capability set the pipeline needs from a mail provider.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Messages added in the history range `(since, until]`.
    async fn fetch_changes_since(
        &self,
        since: HistoryId,
        until: HistoryId,
    ) -> Result<Vec<MessageRef>, ProviderError>;

    async fn fetch_message(&self, message_id: &str) -> Result<MessageEnvelope, ProviderError>;

    /// Number of messages currently in a thread / conversation.
    async fn thread_message_count(&self, thread_id: &str) -> Result<usize, ProviderError>;

    /// Reply in-thread to `original`. Returns the sent message id when known.
    async fn send_reply(
        &self,
        original: &MessageEnvelope,
        reply_text: &str,
    ) -> Result<Option<String>, ProviderError>;

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError>;

    /// Create a label. `Conflict` if one with the same name already exists.
    async fn create_label(&self, name: &str) -> Result<Label, ProviderError>;

    async fn apply_label(&self, message_id: &str, label: &Label) -> Result<(), ProviderError>;

    /// Fallback label when a classification label cannot be resolved.
    fn default_label(&self) -> Option<Label>;
}

/// Builds a credential-bound adapter for a mailbox.
pub trait ProviderFactory: Send + Sync {
    fn for_mailbox(&self, mailbox: &Mailbox) -> Arc<dyn MailProvider>;
}

/// API base URLs. Overridable so tests can point adapters at local fakes.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub gmail_api_base: String,
    pub graph_api_base: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            gmail_api_base: DEFAULT_GMAIL_API_BASE.to_string(),
            graph_api_base: DEFAULT_GRAPH_API_BASE.to_string(),
        }
    }
}

/// Production factory: REST adapters over one shared HTTP client.
pub struct HttpProviderFactory {
    client: reqwest::Client,
    endpoints: ProviderEndpoints,
}

impl HttpProviderFactory {
    pub fn new(endpoints: ProviderEndpoints) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn for_mailbox(&self, mailbox: &Mailbox) -> Arc<dyn MailProvider> {
        match mailbox.provider {
            ProviderKind::Google => Arc::new(GmailProvider::new(
                self.client.clone(),
                &self.endpoints.gmail_api_base,
                &mailbox.email,
                mailbox.access_token.clone(),
            )),
            ProviderKind::Microsoft => Arc::new(GraphProvider::new(
                self.client.clone(),
                &self.endpoints.graph_api_base,
                &mailbox.account_id,
                &mailbox.email,
                mailbox.access_token.clone(),
            )),
        }
    }
}

/// `Re: {subject}`, without stacking prefixes on an existing reply.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

// ── HTTP helpers shared by both adapters ────────────────────────────

/// Map a transport-level failure. Connect errors and timeouts are retryable.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> ProviderError {
    ProviderError::Transient {
        provider: provider.to_string(),
        reason: e.to_string(),
    }
}

/// Map a non-success HTTP status onto the provider error taxonomy.
pub(crate) fn map_status(
    provider: &str,
    resource: &str,
    status: u16,
    retry_after: Option<Duration>,
    body: String,
) -> ProviderError {
    let provider = provider.to_string();
    match status {
        401 | 403 => ProviderError::Unauthorized { provider },
        404 => ProviderError::NotFound {
            provider,
            resource: resource.to_string(),
        },
        409 => ProviderError::Conflict {
            provider,
            reason: body,
        },
        429 => ProviderError::RateLimited {
            provider,
            retry_after,
        },
        500..=599 => ProviderError::Transient {
            provider,
            reason: format!("status {status}: {body}"),
        },
        _ => ProviderError::Rejected {
            provider,
            status,
            body,
        },
    }
}

/// `Retry-After` in delta-seconds form.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Pass through a success response, otherwise turn it into a `ProviderError`.
pub(crate) async fn ensure_success(
    provider: &str,
    resource: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    tracing::debug!(provider, resource, status = status.as_u16(), "Provider request failed");
    Err(map_status(provider, resource, status.as_u16(), retry_after, body))
}

/// Decode a JSON response body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &str,
    resp: reqwest::Response,
) -> Result<T, ProviderError> {
    resp.json::<T>()
        .await
        .map_err(|e| ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::net::TcpListener;

    /// Serve `app` on a random local port and return its base URL.
    pub async fn spawn_fake(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}
