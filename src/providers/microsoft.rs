//! Microsoft Graph adapter (v1.0).
//!
//! Change notifications already name the message, so there is no history
//! enumeration. Labels are Outlook master categories; applying one merges
//! it into the message's existing `categories`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::pipeline::types::{HistoryId, Label, MessageEnvelope, MessageRef, ProviderKind};
use crate::providers::{MailProvider, ensure_success, read_json, transport_error};

const PROVIDER: &str = "graph";

const MESSAGE_SELECT: &str = "id,conversationId,from,toRecipients,subject,receivedDateTime,\
                              bodyPreview,isRead,internetMessageId,categories";

/// Upper bound when counting a conversation; anything above 1 disqualifies it.
const CONVERSATION_PROBE_SIZE: &str = "10";

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: EmailAddress,
}

impl Recipient {
    fn display(&self) -> String {
        let address = self.email_address.address.as_deref().unwrap_or_default();
        match self.email_address.name.as_deref() {
            Some(name) if !name.is_empty() && name != address => format!("{name} <{address}>"),
            _ => address.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    conversation_id: String,
    from: Option<Recipient>,
    #[serde(default)]
    to_recipients: Vec<Recipient>,
    subject: Option<String>,
    received_date_time: Option<String>,
    #[serde(default)]
    body_preview: String,
    #[serde(default)]
    is_read: bool,
    internet_message_id: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
}

impl From<GraphMessage> for MessageEnvelope {
    fn from(m: GraphMessage) -> Self {
        MessageEnvelope {
            id: m.id,
            thread_id: m.conversation_id,
            from: m.from.map(|r| r.display()).unwrap_or_default(),
            to: m.to_recipients.iter().map(Recipient::display).collect(),
            subject: m.subject.unwrap_or_default(),
            date: m.received_date_time,
            body: m.body_preview,
            is_unread: !m.is_read,
            internet_message_id: m.internet_message_id,
            labels: m.categories,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Category {
    id: String,
    display_name: String,
}

impl From<Category> for Label {
    fn from(c: Category) -> Self {
        Label {
            id: c.id,
            name: c.display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageCategories {
    #[serde(default)]
    categories: Vec<String>,
}

/// Escape a value for use inside an OData string literal.
fn odata_quote(value: &str) -> String {
    value.replace('\'', "''")
}

// ── Adapter ─────────────────────────────────────────────────────────

/// Graph adapter bound to one user's access token.
pub struct GraphProvider {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
    email: String,
    token: SecretString,
}

impl GraphProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        user_id: &str,
        email: &str,
        token: SecretString,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            email: email.to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/{}/{path}", self.base_url, self.user_id)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = request
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        ensure_success(PROVIDER, resource, resp).await
    }
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Microsoft
    }

    async fn fetch_changes_since(
        &self,
        _since: HistoryId,
        _until: HistoryId,
    ) -> Result<Vec<MessageRef>, ProviderError> {
        Ok(Vec::new())
    }

    async fn fetch_message(&self, message_id: &str) -> Result<MessageEnvelope, ProviderError> {
        let path = format!("messages/{message_id}");
        let req = self
            .client
            .get(self.url(&path))
            .query(&[("$select", MESSAGE_SELECT)]);
        let message: GraphMessage = read_json(PROVIDER, self.send(req, &path).await?).await?;
        Ok(message.into())
    }

    async fn thread_message_count(&self, thread_id: &str) -> Result<usize, ProviderError> {
        let filter = format!("conversationId eq '{}'", odata_quote(thread_id));
        let req = self.client.get(self.url("messages")).query(&[
            ("$filter", filter.as_str()),
            ("$select", "id"),
            ("$top", CONVERSATION_PROBE_SIZE),
        ]);
        let page: Collection<serde_json::Value> =
            read_json(PROVIDER, self.send(req, "messages").await?).await?;
        Ok(page.value.len())
    }

    async fn send_reply(
        &self,
        original: &MessageEnvelope,
        reply_text: &str,
    ) -> Result<Option<String>, ProviderError> {
        let path = format!("messages/{}/reply", original.id);
        let req = self
            .client
            .post(self.url(&path))
            .json(&json!({ "comment": reply_text }));
        self.send(req, &path).await?;
        debug!(user_id = %self.user_id, mailbox = %self.email, message_id = %original.id, "Graph reply sent");
        // The reply action returns 202 with no body.
        Ok(None)
    }

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
        let path = "outlook/masterCategories";
        let req = self.client.get(self.url(path));
        let page: Collection<Category> = read_json(PROVIDER, self.send(req, path).await?).await?;
        Ok(page.value.into_iter().map(Label::from).collect())
    }

    async fn create_label(&self, name: &str) -> Result<Label, ProviderError> {
        let path = "outlook/masterCategories";
        let req = self
            .client
            .post(self.url(path))
            .json(&json!({ "displayName": name, "color": "preset0" }));
        let category: Category = read_json(PROVIDER, self.send(req, path).await?).await?;
        Ok(category.into())
    }

    async fn apply_label(&self, message_id: &str, label: &Label) -> Result<(), ProviderError> {
        let path = format!("messages/{message_id}");
        let req = self
            .client
            .get(self.url(&path))
            .query(&[("$select", "categories")]);
        let current: MessageCategories = read_json(PROVIDER, self.send(req, &path).await?).await?;

        if current.categories.iter().any(|c| c == &label.name) {
            return Ok(());
        }
        let mut categories = current.categories;
        categories.push(label.name.clone());

        let req = self
            .client
            .patch(self.url(&path))
            .json(&json!({ "categories": categories }));
        self.send(req, &path).await?;
        Ok(())
    }

    fn default_label(&self) -> Option<Label> {
        None
    }
}
