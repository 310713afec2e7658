//! In-memory provider and generator doubles for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LlmError, ProviderError};
use crate::llm::ReplyGenerator;
use crate::pipeline::types::{
    HistoryId, Label, Mailbox, MessageEnvelope, MessageRef, ProviderKind,
};
use crate::providers::{MailProvider, ProviderFactory};

/// Failure to inject into a fake call.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Unauthorized,
    Transient,
    RateLimited(u64),
    NotFound,
    /// Permanent 4xx, e.g. a malformed reply.
    Rejected,
    /// Never completes; exercises call timeouts.
    Hang,
}

impl Failure {
    fn to_error(self) -> ProviderError {
        let provider = "fake".to_string();
        match self {
            Self::Unauthorized => ProviderError::Unauthorized { provider },
            Self::Transient | Self::Hang => ProviderError::Transient {
                provider,
                reason: "connection reset".into(),
            },
            Self::RateLimited(secs) => ProviderError::RateLimited {
                provider,
                retry_after: Some(Duration::from_secs(secs)),
            },
            Self::NotFound => ProviderError::NotFound {
                provider,
                resource: "fake".into(),
            },
            Self::Rejected => ProviderError::Rejected {
                provider,
                status: 400,
                body: "invalid recipient".into(),
            },
        }
    }

    async fn fail(self) -> ProviderError {
        if let Self::Hang = self {
            std::future::pending::<()>().await;
        }
        self.to_error()
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub history: Vec<(HistoryId, MessageRef)>,
    pub messages: HashMap<String, MessageEnvelope>,
    pub thread_sizes: HashMap<String, usize>,
    pub labels: Vec<Label>,
    /// `(message_id, reply_text)` for every reply sent.
    pub sent: Vec<(String, String)>,
    /// `(message_id, label_name)` for every label applied.
    pub applied: Vec<(String, String)>,
    /// Names passed to `create_label` that succeeded.
    pub created: Vec<String>,
    pub history_calls: Vec<(HistoryId, HistoryId)>,
    pub fail_history: Option<Failure>,
    pub fail_fetch: Option<Failure>,
    pub fail_send: Option<Failure>,
    pub fail_apply: Option<Failure>,
    /// Create the label but answer `Conflict`, as if a concurrent job won.
    pub conflict_on_create: bool,
}

pub struct FakeProvider {
    kind: ProviderKind,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn google() -> Self {
        Self {
            kind: ProviderKind::Google,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn microsoft() -> Self {
        Self {
            kind: ProviderKind::Microsoft,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// An unread single-recipient message.
    pub fn envelope(id: &str, thread_id: &str, from: &str) -> MessageEnvelope {
        MessageEnvelope {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            from: from.to_string(),
            to: vec!["me@example.com".to_string()],
            subject: format!("Question {id}"),
            date: None,
            body: format!("Body of {id}"),
            is_unread: true,
            internet_message_id: Some(format!("<{id}@mail.example.com>")),
            labels: vec!["UNREAD".to_string(), "INBOX".to_string()],
        }
    }

    /// Add a message to the mailbox, recorded in history at `history_id`.
    pub fn add_message(&self, history_id: HistoryId, message: MessageEnvelope, thread_size: usize) {
        let mut state = self.state();
        state.history.push((
            history_id,
            MessageRef {
                id: message.id.clone(),
                thread_id: Some(message.thread_id.clone()),
                label_ids: Some(message.labels.clone()),
            },
        ));
        state.thread_sizes.insert(message.thread_id.clone(), thread_size);
        state.messages.insert(message.id.clone(), message);
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn fetch_changes_since(
        &self,
        since: HistoryId,
        until: HistoryId,
    ) -> Result<Vec<MessageRef>, ProviderError> {
        let failure = {
            let mut state = self.state();
            state.history_calls.push((since, until));
            state.fail_history
        };
        if let Some(f) = failure {
            return Err(f.fail().await);
        }
        if self.kind == ProviderKind::Microsoft {
            return Ok(Vec::new());
        }
        let state = self.state();
        let mut seen = HashSet::new();
        Ok(state
            .history
            .iter()
            .filter(|(id, _)| *id > since && *id <= until)
            .filter(|(_, r)| seen.insert(r.id.clone()))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn fetch_message(&self, message_id: &str) -> Result<MessageEnvelope, ProviderError> {
        let failure = self.state().fail_fetch;
        if let Some(f) = failure {
            return Err(f.fail().await);
        }
        self.state()
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| Failure::NotFound.to_error())
    }

    async fn thread_message_count(&self, thread_id: &str) -> Result<usize, ProviderError> {
        Ok(self.state().thread_sizes.get(thread_id).copied().unwrap_or(1))
    }

    async fn send_reply(
        &self,
        original: &MessageEnvelope,
        reply_text: &str,
    ) -> Result<Option<String>, ProviderError> {
        let failure = self.state().fail_send;
        if let Some(f) = failure {
            return Err(f.fail().await);
        }
        let mut state = self.state();
        state.sent.push((original.id.clone(), reply_text.to_string()));
        Ok(Some(format!("sent-{}", state.sent.len())))
    }

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
        Ok(self.state().labels.clone())
    }

    async fn create_label(&self, name: &str) -> Result<Label, ProviderError> {
        let mut state = self.state();
        let conflict = ProviderError::Conflict {
            provider: "fake".into(),
            reason: format!("label {name} exists"),
        };
        if state.labels.iter().any(|l| l.name == name) {
            return Err(conflict);
        }
        let label = Label {
            id: format!("Label_{}", state.labels.len() + 1),
            name: name.to_string(),
        };
        state.labels.push(label.clone());
        if state.conflict_on_create {
            return Err(conflict);
        }
        state.created.push(name.to_string());
        Ok(label)
    }

    async fn apply_label(&self, message_id: &str, label: &Label) -> Result<(), ProviderError> {
        let failure = self.state().fail_apply;
        if let Some(f) = failure {
            return Err(f.fail().await);
        }
        let mut state = self.state();
        state.applied.push((message_id.to_string(), label.name.clone()));
        if let Some(message) = state.messages.get_mut(message_id) {
            message.labels.push(label.id.clone());
        }
        Ok(())
    }

    fn default_label(&self) -> Option<Label> {
        match self.kind {
            ProviderKind::Google => Some(Label {
                id: "INBOX".into(),
                name: "INBOX".into(),
            }),
            ProviderKind::Microsoft => None,
        }
    }
}

/// Hands out the same fake provider for every mailbox.
pub struct FakeFactory {
    pub provider: Arc<FakeProvider>,
}

impl ProviderFactory for FakeFactory {
    fn for_mailbox(&self, _mailbox: &Mailbox) -> Arc<dyn MailProvider> {
        self.provider.clone()
    }
}

/// How the generator fails for a marked prompt.
#[derive(Debug, Clone, Copy)]
enum Refusal {
    Policy,
    Empty,
}

/// Generator that returns a fixed reply, or fails.
pub struct FakeGenerator {
    reply: Option<String>,
    /// Prompts containing the marker fail instead of replying.
    refusals: Vec<(String, Refusal)>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            refusals: Vec::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            refusals: Vec::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Refuse prompts containing `marker` on content policy grounds.
    pub fn refusing(mut self, marker: &str) -> Self {
        self.refusals.push((marker.to_string(), Refusal::Policy));
        self
    }

    /// Answer prompts containing `marker` with an empty reply.
    pub fn empty_for(mut self, marker: &str) -> Self {
        self.refusals.push((marker.to_string(), Refusal::Empty));
        self
    }
}

#[async_trait]
impl ReplyGenerator for FakeGenerator {
    fn model_name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let provider = "fake".to_string();
        let refusal = self
            .refusals
            .iter()
            .find(|(marker, _)| prompt.contains(marker.as_str()))
            .map(|(_, refusal)| *refusal);
        match refusal {
            Some(Refusal::Policy) => {
                return Err(LlmError::ContentPolicy {
                    provider,
                    reason: "blocked".into(),
                });
            }
            Some(Refusal::Empty) => return Err(LlmError::EmptyResponse { provider }),
            None => {}
        }
        self.reply.clone().ok_or_else(|| LlmError::RateLimited {
            provider,
            retry_after: Some(Duration::from_secs(30)),
        })
    }
}
