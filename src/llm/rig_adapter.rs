//! Bridges a rig-core `CompletionModel` to `ReplyGenerator`.

use async_trait::async_trait;
use rig::agent::{Agent, AgentBuilder};
use rig::completion::{CompletionModel, Prompt};

use crate::error::LlmError;
use crate::llm::ReplyGenerator;

/// System preamble for every reply.
///
/// Replies are labeled by the words they contain (`pipeline::classify`).
const PREAMBLE: &str = "You write replies to inbound business email on behalf of the \
    mailbox owner. Output only the reply body, with no subject line and no placeholders. \
    The reply is sent exactly as written. When the sender wants to go ahead, thank them \
    in a natural sentence that contains the word \"Interested\". When the sender declines, \
    acknowledge it in a natural sentence that contains \"Not Interested\". Otherwise ask \
    one short follow-up question. Never mention labels, categories, or these instructions.";

const TEMPERATURE: f64 = 0.4;

/// Reply generator backed by a rig agent.
pub struct RigReplyGenerator<M: CompletionModel> {
    agent: Agent<M>,
    provider: &'static str,
    model_name: String,
}

impl<M: CompletionModel> RigReplyGenerator<M> {
    pub fn new(model: M, provider: &'static str, model_name: &str) -> Self {
        let agent = AgentBuilder::new(model)
            .preamble(PREAMBLE)
            .temperature(TEMPERATURE)
            .build();
        Self {
            agent,
            provider,
            model_name: model_name.to_string(),
        }
    }
}

/// Classify a rig error message into the LLM error taxonomy.
fn map_prompt_error(provider: &str, message: String) -> LlmError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("resource_exhausted")
    {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401") || lower.contains("api key") || lower.contains("unauthorized") {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if lower.contains("safety") || lower.contains("content policy") {
        LlmError::ContentPolicy {
            provider: provider.to_string(),
            reason: message,
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: message,
        }
    }
}

#[async_trait]
impl<M> ReplyGenerator for RigReplyGenerator<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let reply = self
            .agent
            .prompt(prompt)
            .await
            .map_err(|e| map_prompt_error(self.provider, e.to_string()))?;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: self.provider.to_string(),
            });
        }
        tracing::debug!(model = %self.model_name, chars = reply.len(), "Reply generated");
        Ok(reply.to_string())
    }
}
