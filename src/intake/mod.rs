//! Notification intake: turns provider webhook payloads into jobs.
//!
//! Parsing is pure and lives here; the axum endpoints that call it are in
//! `routes`. A malformed payload never fails the webhook: the route logs,
//! counts, and acknowledges it.
//!
//! - **Gmail push**: `message.data` is base64 JSON `{emailAddress, historyId}`.
//! - **Graph notifications**: `value[]` entries each name one message via
//!   their `resource` path.

pub mod routes;

use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::IntakeError;
use crate::pipeline::types::{ChangeToken, HistoryId, NotificationJob, ProviderKind};

pub use routes::{IntakeConfig, IntakeState, IntakeStats, webhook_routes};

/// `users/{userId}/messages/{messageId}`, optionally under `mailFolders/{id}`.
static GRAPH_RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^/?users/([^/]+)/(?:mailfolders/[^/]+/)?messages(?:/([^/]+))?/?$")
        .expect("static regex")
});

// ── Gmail push ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailNotice {
    email_address: String,
    history_id: serde_json::Value,
}

/// Pub/Sub uses the standard alphabet; accept URL-safe and unpadded too.
fn decode_base64(data: &str) -> Option<Vec<u8>> {
    let data = data.trim();
    [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(data).ok())
}

fn parse_history_id(value: &serde_json::Value) -> Option<HistoryId> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a Gmail push notification into exactly one job.
pub fn parse_google_push(body: &[u8]) -> Result<NotificationJob, IntakeError> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| IntakeError::MalformedPayload(format!("push envelope: {e}")))?;

    let decoded = decode_base64(&envelope.message.data)
        .ok_or_else(|| IntakeError::MalformedPayload("message.data is not base64".into()))?;

    let notice: GmailNotice = serde_json::from_slice(&decoded)
        .map_err(|e| IntakeError::MalformedPayload(format!("push data: {e}")))?;

    let email = notice.email_address.trim();
    if email.is_empty() {
        return Err(IntakeError::MalformedPayload("emailAddress is empty".into()));
    }
    let history_id = parse_history_id(&notice.history_id).ok_or_else(|| {
        IntakeError::MalformedPayload(format!("historyId is not numeric: {}", notice.history_id))
    })?;

    Ok(NotificationJob::new(
        ProviderKind::Google,
        email,
        ChangeToken::History { history_id },
    ))
}

// ── Graph change notifications ──────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NotificationBatch {
    value: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphNotification {
    resource: Option<String>,
    client_state: Option<String>,
    resource_data: Option<ResourceData>,
}

#[derive(Debug, Deserialize)]
struct ResourceData {
    id: Option<String>,
}

/// Jobs accepted from one Graph batch, plus how many entries were dropped.
#[derive(Debug, Default)]
pub struct MicrosoftBatch {
    pub jobs: Vec<NotificationJob>,
    pub dropped: usize,
}

/// Extract `(user_id, message_id)` from a Graph resource path.
pub fn parse_graph_resource(resource: &str) -> Option<(String, Option<String>)> {
    let caps = GRAPH_RESOURCE.captures(resource.trim())?;
    let user_id = caps.get(1)?.as_str().to_string();
    let message_id = caps
        .get(2)
        .map(|m| m.as_str().to_string())
        .filter(|m| !m.is_empty());
    Some((user_id, message_id))
}

fn notification_to_job(
    entry: GraphNotification,
    expected_client_state: Option<&str>,
) -> Result<NotificationJob, String> {
    if let Some(expected) = expected_client_state {
        if entry.client_state.as_deref() != Some(expected) {
            return Err("clientState mismatch".into());
        }
    }

    let resource = entry.resource.ok_or("missing resource")?;
    let (user_id, path_message_id) =
        parse_graph_resource(&resource).ok_or_else(|| format!("unrecognized resource {resource}"))?;

    let message_id = path_message_id
        .or_else(|| entry.resource_data.and_then(|d| d.id))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| format!("no message id in {resource}"))?;

    Ok(NotificationJob::new(
        ProviderKind::Microsoft,
        user_id,
        ChangeToken::Message { message_id },
    ))
}

/// Parse a Graph notification batch. Bad entries are dropped individually.
pub fn parse_microsoft_batch(
    body: &[u8],
    expected_client_state: Option<&str>,
) -> Result<MicrosoftBatch, IntakeError> {
    let batch: NotificationBatch = serde_json::from_slice(body)
        .map_err(|e| IntakeError::MalformedPayload(format!("notification batch: {e}")))?;

    let mut result = MicrosoftBatch::default();
    for (index, raw) in batch.value.into_iter().enumerate() {
        let parsed = serde_json::from_value::<GraphNotification>(raw)
            .map_err(|e| e.to_string())
            .and_then(|entry| notification_to_job(entry, expected_client_state));
        match parsed {
            Ok(job) => result.jobs.push(job),
            Err(reason) => {
                warn!(index, reason = %reason, "Dropping Graph notification entry");
                result.dropped += 1;
            }
        }
    }
    Ok(result)
}
