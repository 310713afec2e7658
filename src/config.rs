//! Service configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::intake::IntakeConfig;
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::ProcessorConfig;
use crate::providers::ProviderEndpoints;
use crate::worker::{RetryPolicy, WorkerConfig};

/// Everything `main` needs to assemble the service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Daily-rotated log files are written here when set.
    pub log_dir: Option<PathBuf>,
    pub llm: LlmConfig,
    pub intake: IntakeConfig,
    pub worker: WorkerConfig,
    pub processor: ProcessorConfig,
    pub endpoints: ProviderEndpoints,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("AUTOREPLY_LLM_API_KEY")
            .or_else(|| get("GEMINI_KEY"))
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTOREPLY_LLM_API_KEY".into()))?;

        let llm = LlmConfig {
            backend: parse_or(&get, "AUTOREPLY_LLM_BACKEND", LlmBackend::Gemini)?,
            api_key: SecretString::from(api_key),
            model: get("AUTOREPLY_LLM_MODEL").unwrap_or_else(|| "gemini-1.5-flash".to_string()),
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "AUTOREPLY_MAX_ATTEMPTS", 5u32)?.max(1),
            base_backoff: secs(&get, "AUTOREPLY_BACKOFF_BASE_SECS", 5)?,
            max_backoff: secs(&get, "AUTOREPLY_BACKOFF_MAX_SECS", 600)?,
        };
        if retry.base_backoff > retry.max_backoff {
            return Err(ConfigError::InvalidValue {
                key: "AUTOREPLY_BACKOFF_BASE_SECS".into(),
                message: "must not exceed AUTOREPLY_BACKOFF_MAX_SECS".into(),
            });
        }

        let call_timeout = secs(&get, "AUTOREPLY_CALL_TIMEOUT_SECS", 20)?;

        let worker = WorkerConfig {
            concurrency: parse_or(&get, "AUTOREPLY_WORKERS", 4usize)?.max(1),
            lease: secs(&get, "AUTOREPLY_LEASE_SECS", 120)?,
            max_job_duration: secs(&get, "AUTOREPLY_MAX_JOB_SECS", 90)?,
            poll_interval: Duration::from_millis(parse_or(&get, "AUTOREPLY_POLL_INTERVAL_MS", 1000u64)?),
            store_timeout: call_timeout,
            retry,
        };
        if worker.lease <= worker.max_job_duration {
            tracing::warn!(
                lease_secs = worker.lease.as_secs(),
                max_job_secs = worker.max_job_duration.as_secs(),
                "AUTOREPLY_LEASE_SECS should exceed AUTOREPLY_MAX_JOB_SECS"
            );
        }

        let defaults = ProviderEndpoints::default();
        let endpoints = ProviderEndpoints {
            gmail_api_base: get("AUTOREPLY_GMAIL_API_BASE").unwrap_or(defaults.gmail_api_base),
            graph_api_base: get("AUTOREPLY_GRAPH_API_BASE").unwrap_or(defaults.graph_api_base),
        };

        Ok(Self {
            port: parse_or(&get, "AUTOREPLY_PORT", 3000u16)?,
            db_path: get("AUTOREPLY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/autoreply.db")),
            log_dir: get("AUTOREPLY_LOG_DIR").map(PathBuf::from),
            llm,
            intake: IntakeConfig {
                client_state: get("OUTLOOK_CLIENT_STATE"),
                admin_token: get("AUTOREPLY_ADMIN_TOKEN").map(SecretString::from),
                ..IntakeConfig::default()
            },
            worker,
            processor: ProcessorConfig { call_timeout },
            endpoints,
        })
    }

    /// Create the database and log directories if they are missing.
    pub fn prepare_dirs(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(dir) = &self.log_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_with_only_a_key() {
        let cfg = config(&[("AUTOREPLY_LLM_API_KEY", "k")]).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.db_path, PathBuf::from("./data/autoreply.db"));
        assert_eq!(cfg.llm.backend, LlmBackend::Gemini);
        assert_eq!(cfg.llm.model, "gemini-1.5-flash");
        assert_eq!(cfg.worker.concurrency, 4);
        assert_eq!(cfg.worker.retry.max_attempts, 5);
        assert_eq!(cfg.worker.lease, Duration::from_secs(120));
        assert_eq!(cfg.processor.call_timeout, Duration::from_secs(20));
        assert_eq!(cfg.worker.store_timeout, Duration::from_secs(20));
        assert_eq!(cfg.intake.enqueue_timeout, Duration::from_millis(800));
        assert!(cfg.intake.admin_token.is_none());
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn gemini_key_is_a_fallback() {
        let cfg = config(&[("GEMINI_KEY", "legacy")]).unwrap();
        assert_eq!(cfg.llm.api_key.expose_secret(), "legacy");

        let cfg = config(&[("GEMINI_KEY", "legacy"), ("AUTOREPLY_LLM_API_KEY", "new")]).unwrap();
        assert_eq!(cfg.llm.api_key.expose_secret(), "new");
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = config(&[("AUTOREPLY_LLM_API_KEY", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("AUTOREPLY_LLM_API_KEY", "k"),
            ("AUTOREPLY_LLM_BACKEND", "anthropic"),
            ("AUTOREPLY_PORT", "8081"),
            ("AUTOREPLY_WORKERS", "0"),
            ("AUTOREPLY_POLL_INTERVAL_MS", "250"),
            ("OUTLOOK_CLIENT_STATE", "secret"),
            ("AUTOREPLY_ADMIN_TOKEN", "admin"),
            ("AUTOREPLY_GRAPH_API_BASE", "http://127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(cfg.llm.backend, LlmBackend::Anthropic);
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.worker.concurrency, 1);
        assert_eq!(cfg.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.intake.client_state.as_deref(), Some("secret"));
        assert!(cfg.intake.admin_token.is_some());
        assert_eq!(cfg.endpoints.graph_api_base, "http://127.0.0.1:9000");
        assert_eq!(cfg.endpoints.gmail_api_base, crate::providers::DEFAULT_GMAIL_API_BASE);
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = config(&[("AUTOREPLY_LLM_API_KEY", "k"), ("AUTOREPLY_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("AUTOREPLY_PORT"));

        let err = config(&[("AUTOREPLY_LLM_API_KEY", "k"), ("AUTOREPLY_LLM_BACKEND", "llama")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = config(&[
            ("AUTOREPLY_LLM_API_KEY", "k"),
            ("AUTOREPLY_BACKOFF_BASE_SECS", "700"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn prepare_dirs_creates_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(&[("AUTOREPLY_LLM_API_KEY", "k")]).unwrap();
        cfg.db_path = tmp.path().join("data").join("autoreply.db");
        cfg.log_dir = Some(tmp.path().join("logs"));

        cfg.prepare_dirs().unwrap();

        assert!(tmp.path().join("data").is_dir());
        assert!(tmp.path().join("logs").is_dir());
    }

    #[test]
    fn prepare_dirs_reports_io_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let mut cfg = config(&[("AUTOREPLY_LLM_API_KEY", "k")]).unwrap();
        cfg.log_dir = Some(blocker.join("logs"));
        cfg.db_path = tmp.path().join("autoreply.db");

        let err = cfg.prepare_dirs().unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
