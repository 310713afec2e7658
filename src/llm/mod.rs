//! Reply generation.
//!
//! Supports:
//! - **Gemini**: Google AI Studio via rig-core (default)
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! The pipeline only sees `ReplyGenerator`; `RigReplyGenerator` bridges a
//! rig `CompletionModel` to it.

mod rig_adapter;

pub use rig_adapter::RigReplyGenerator;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Turns a prompt into reply text.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate reply text. `EmptyResponse` is final for the message; other
    /// failures are retried.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Gemini,
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend: {other}")),
        }
    }
}

/// Configuration for creating a reply generator.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create a reply generator from configuration.
///
/// Must be called from within a Tokio runtime: building the rig agent
/// spawns its tool server task.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn ReplyGenerator>, LlmError> {
    match config.backend {
        LlmBackend::Gemini => create_gemini_generator(config),
        LlmBackend::Anthropic => create_anthropic_generator(config),
        LlmBackend::OpenAi => create_openai_generator(config),
    }
}

fn create_gemini_generator(config: &LlmConfig) -> Result<Arc<dyn ReplyGenerator>, LlmError> {
    use rig::providers::gemini;

    let client: rig::client::Client<gemini::client::GeminiExt> =
        gemini::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "gemini".to_string(),
                reason: format!("Failed to create Gemini client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Gemini (model: {})", config.model);
    Ok(Arc::new(RigReplyGenerator::new(model, "gemini", &config.model)))
}

fn create_anthropic_generator(config: &LlmConfig) -> Result<Arc<dyn ReplyGenerator>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigReplyGenerator::new(model, "anthropic", &config.model)))
}

fn create_openai_generator(config: &LlmConfig) -> Result<Arc<dyn ReplyGenerator>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigReplyGenerator::new(model, "openai", &config.model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_gemini_generator_with_any_key() {
        // rig-core clients accept any string as API key at construction time.
        // The actual auth failure happens when making a request.
        let config = LlmConfig {
            backend: LlmBackend::Gemini,
            api_key: secrecy::SecretString::from("test-key"),
            model: "gemini-1.5-flash".to_string(),
        };
        let generator = create_generator(&config);
        assert!(generator.is_ok());
        assert_eq!(generator.unwrap().model_name(), "gemini-1.5-flash");
    }

    #[tokio::test]
    async fn test_create_anthropic_generator() {
        let config = LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: secrecy::SecretString::from("sk-ant-test"),
            model: "claude-3-5-haiku-latest".to_string(),
        };
        let generator = create_generator(&config);
        assert!(generator.is_ok());
        assert_eq!(generator.unwrap().model_name(), "claude-3-5-haiku-latest");
    }

    #[tokio::test]
    async fn test_create_openai_generator() {
        let config = LlmConfig {
            backend: LlmBackend::OpenAi,
            api_key: secrecy::SecretString::from("sk-test"),
            model: "gpt-4o-mini".to_string(),
        };
        assert!(create_generator(&config).is_ok());
    }

    #[test]
    fn backend_parsing() {
        assert_eq!("Gemini".parse::<LlmBackend>(), Ok(LlmBackend::Gemini));
        assert_eq!("claude".parse::<LlmBackend>(), Ok(LlmBackend::Anthropic));
        assert_eq!("openai".parse::<LlmBackend>(), Ok(LlmBackend::OpenAi));
        assert!("llama".parse::<LlmBackend>().is_err());
    }
}
