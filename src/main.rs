use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Notify;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autoreply::config::AppConfig;
use autoreply::intake::{IntakeState, webhook_routes};
use autoreply::llm::{ReplyGenerator, create_generator};
use autoreply::pipeline::JobProcessor;
use autoreply::providers::HttpProviderFactory;
use autoreply::store::{Database, LibSqlBackend};
use autoreply::worker::WorkerPool;

/// Console logging, plus a daily-rotated file when `log_dir` is set.
/// The log directory must already exist.
fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return None;
    };

    let (non_blocking, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "autoreply.log"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Some(guard)
}

/// Open the store and build the reply generator.
async fn open_services(
    config: &AppConfig,
) -> autoreply::error::Result<(Arc<dyn Database>, Arc<dyn ReplyGenerator>)> {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    tracing::info!(path = %config.db_path.display(), "Database ready");

    let generator = create_generator(&config.llm)?;
    tracing::info!(model = generator.model_name(), "Reply generator ready");
    Ok((db, generator))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = AppConfig::from_env().context("invalid configuration")?;
    config
        .prepare_dirs()
        .context("failed to create data or log directory")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.llm.backend,
        model = %config.llm.model,
        workers = config.worker.concurrency,
        "Starting autoreply"
    );

    // ── Services ─────────────────────────────────────────────────────────
    let (db, generator) = open_services(&config)
        .await
        .context("failed to open database or reply generator")?;

    // ── Pipeline ─────────────────────────────────────────────────────────
    let providers = Arc::new(HttpProviderFactory::new(config.endpoints.clone()));
    let processor = Arc::new(JobProcessor::new(
        Arc::clone(&db),
        providers,
        generator,
        config.processor.clone(),
    ));

    // ── Workers ──────────────────────────────────────────────────────────
    let wake = Arc::new(Notify::new());
    let workers = WorkerPool::spawn(
        Arc::clone(&db),
        processor,
        Arc::clone(&wake),
        config.worker.clone(),
    );

    // ── Intake ───────────────────────────────────────────────────────────
    if config.intake.admin_token.is_none() {
        tracing::info!("AUTOREPLY_ADMIN_TOKEN not set, admin routes disabled");
    }
    let app = webhook_routes(IntakeState::new(Arc::clone(&db), wake, config.intake.clone()));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("webhook server failed")?;

    workers.shutdown().await;
    tracing::info!("Autoreply stopped");
    Ok(())
}
