//! Gmail adapter (REST v1).
//!
//! Change enumeration walks `users/me/history` from the stored cursor.
//! Replies are built as RFC 5322 messages with `lettre`, base64url-encoded,
//! and sent with the original `threadId` so Gmail threads them.

use std::collections::HashSet;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox as Address, Message};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::pipeline::types::{HistoryId, Label, MessageEnvelope, MessageRef, ProviderKind};
use crate::providers::{MailProvider, ensure_success, read_json, reply_subject, transport_error};

const PROVIDER: &str = "gmail";

/// Headers requested with `format=metadata`.
const METADATA_HEADERS: [&str; 5] = ["From", "To", "Subject", "Date", "Message-ID"];

pub const INBOX_LABEL: &str = "INBOX";
pub const UNREAD_LABEL: &str = "UNREAD";

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    id: String,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MinimalMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MinimalMessage {
    id: String,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct Thread {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: Option<String>,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn into_envelope(self) -> MessageEnvelope {
        let from = self.header("From").unwrap_or_default().to_string();
        let to = self
            .header("To")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let subject = self.header("Subject").unwrap_or_default().to_string();
        let date = self.header("Date").map(String::from);
        let internet_message_id = self.header("Message-ID").map(String::from);

        MessageEnvelope {
            is_unread: self.label_ids.iter().any(|l| l == UNREAD_LABEL),
            id: self.id,
            thread_id: self.thread_id,
            from,
            to,
            subject,
            date,
            body: self.snippet,
            internet_message_id,
            labels: self.label_ids,
        }
    }
}

// ── Adapter ─────────────────────────────────────────────────────────

/// Gmail adapter bound to one mailbox's access token.
pub struct GmailProvider {
    client: reqwest::Client,
    base_url: String,
    email: String,
    token: SecretString,
}

impl GmailProvider {
    pub fn new(client: reqwest::Client, base_url: &str, email: &str, token: SecretString) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let resp = ensure_success(PROVIDER, path, resp).await?;
        read_json(PROVIDER, resp).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        ensure_success(PROVIDER, path, resp).await
    }

    /// Build the raw RFC 5322 reply.
    fn build_reply(&self, original: &MessageEnvelope, text: &str) -> Result<Vec<u8>, ProviderError> {
        let invalid = |reason: String| ProviderError::InvalidMessage {
            provider: PROVIDER.to_string(),
            reason,
        };

        let from: Address = self
            .email
            .parse()
            .map_err(|e| invalid(format!("sender {}: {e}", self.email)))?;
        let to: Address = original
            .from
            .parse::<Address>()
            .or_else(|_| original.sender_address().parse::<Address>())
            .map_err(|e| invalid(format!("recipient {}: {e}", original.from)))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(reply_subject(&original.subject))
            .header(ContentType::TEXT_PLAIN);
        if let Some(parent) = &original.internet_message_id {
            builder = builder.in_reply_to(parent.clone()).references(parent.clone());
        }

        let message = builder
            .body(text.to_string())
            .map_err(|e| invalid(e.to_string()))?;
        Ok(message.formatted())
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn fetch_changes_since(
        &self,
        since: HistoryId,
        until: HistoryId,
    ) -> Result<Vec<MessageRef>, ProviderError> {
        let start = since.to_string();
        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", start.as_str()),
                ("historyTypes", "messageAdded"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page: HistoryPage = self.get_json("history", &query).await?;

            for record in page.history {
                let Ok(record_id) = record.id.parse::<HistoryId>() else {
                    continue;
                };
                if record_id <= since || record_id > until {
                    continue;
                }
                for added in record.messages_added {
                    if seen.insert(added.message.id.clone()) {
                        refs.push(MessageRef {
                            id: added.message.id,
                            thread_id: added.message.thread_id,
                            label_ids: added.message.label_ids,
                        });
                    }
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(mailbox = %self.email, since, until, count = refs.len(), "History listed");
        Ok(refs)
    }

    async fn fetch_message(&self, message_id: &str) -> Result<MessageEnvelope, ProviderError> {
        let mut query = vec![("format", "metadata")];
        query.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", *h)));
        let message: GmailMessage = self
            .get_json(&format!("messages/{message_id}"), &query)
            .await?;
        Ok(message.into_envelope())
    }

    async fn thread_message_count(&self, thread_id: &str) -> Result<usize, ProviderError> {
        let thread: Thread = self
            .get_json(&format!("threads/{thread_id}"), &[("format", "minimal")])
            .await?;
        Ok(thread.messages.len())
    }

    async fn send_reply(
        &self,
        original: &MessageEnvelope,
        reply_text: &str,
    ) -> Result<Option<String>, ProviderError> {
        let raw = URL_SAFE.encode(self.build_reply(original, reply_text)?);
        let resp = self
            .post_json(
                "messages/send",
                &json!({ "raw": raw, "threadId": original.thread_id }),
            )
            .await?;
        let sent: SentMessage = read_json(PROVIDER, resp).await?;
        Ok(sent.id)
    }

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
        let list: LabelList = self.get_json("labels", &[]).await?;
        Ok(list.labels)
    }

    async fn create_label(&self, name: &str) -> Result<Label, ProviderError> {
        let resp = self
            .post_json(
                "labels",
                &json!({
                    "name": name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                }),
            )
            .await?;
        read_json(PROVIDER, resp).await
    }

    async fn apply_label(&self, message_id: &str, label: &Label) -> Result<(), ProviderError> {
        self.post_json(
            &format!("messages/{message_id}/modify"),
            &json!({ "addLabelIds": [label.id] }),
        )
        .await?;
        Ok(())
    }

    fn default_label(&self) -> Option<Label> {
        Some(Label {
            id: INBOX_LABEL.to_string(),
            name: INBOX_LABEL.to_string(),
        })
    }
}
