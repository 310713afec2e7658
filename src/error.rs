//! Error types for autoreply.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail provider API errors.
///
/// Authorization failures are kept apart from transient failures so the
/// worker can route them to re-authorization instead of retrying.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} rejected the credential")]
    Unauthorized { provider: String },

    #[error("{provider} resource not found: {resource}")]
    NotFound { provider: String, resource: String },

    #[error("{provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} conflict: {reason}")]
    Conflict { provider: String, reason: String },

    #[error("{provider} request failed: {reason}")]
    Transient { provider: String, reason: String },

    #[error("{provider} rejected request with status {status}: {body}")]
    Rejected {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Could not build message for {provider}: {reason}")]
    InvalidMessage { provider: String, reason: String },
}

impl ProviderError {
    /// Whether redelivering the job later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} refused to generate: {reason}")]
    ContentPolicy { provider: String, reason: String },

    #[error("Provider {provider} returned an empty reply")]
    EmptyResponse { provider: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Webhook intake errors. These never leave the intake layer.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Failures of a single job inside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Transient failure during {operation}: {reason}")]
    Transient { operation: String, reason: String },

    #[error("Authorization expired for mailbox {mailbox}")]
    AuthorizationExpired { mailbox: String },

    #[error("Rate limited during {operation}, retry after {retry_after:?}")]
    RateLimited {
        operation: String,
        retry_after: Option<Duration>,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// What the worker should do with a delivery after a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Negatively acknowledge; the queue redelivers after a backoff.
    Retry { retry_after: Option<Duration> },
    /// Stop retrying and hold the job for manual inspection.
    DeadLetter,
}

impl PipelineError {
    /// Route this failure to the queue's ack/nack decision.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::AuthorizationExpired { .. } => Disposition::DeadLetter,
            Self::RateLimited { retry_after, .. } => Disposition::Retry {
                retry_after: *retry_after,
            },
            Self::Transient { .. } | Self::Timeout { .. } | Self::Database(_) => {
                Disposition::Retry { retry_after: None }
            }
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
