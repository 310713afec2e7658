//! Webhook, health, and admin endpoints.
//!
//! Webhooks always answer 2xx: Gmail push gets 204, Graph gets 200 (or the
//! validation token echoed back). A webhook's jobs are enqueued together under
//! one short deadline; failures are logged and counted, never surfaced to the
//! provider.
//!
//! Admin routes are mounted only when an admin token is configured and
//! require `Authorization: Bearer <token>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::intake::{parse_google_push, parse_microsoft_batch};
use crate::pipeline::types::{NotificationJob, ProviderKind};
use crate::store::Database;

/// Default page size for the dead-letter listing.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

// ── State ───────────────────────────────────────────────────────────

/// Intake counters, surfaced on `/health`.
#[derive(Debug, Default)]
pub struct IntakeStats {
    accepted: AtomicU64,
    malformed: AtomicU64,
    dropped_entries: AtomicU64,
    enqueue_failures: AtomicU64,
}

/// Point-in-time copy of `IntakeStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeStatsSnapshot {
    pub accepted: u64,
    pub malformed: u64,
    pub dropped_entries: u64,
    pub enqueue_failures: u64,
}

impl IntakeStats {
    pub fn snapshot(&self) -> IntakeStatsSnapshot {
        IntakeStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped_entries: self.dropped_entries.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
        }
    }
}

/// Intake settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Upper bound on storing one webhook's jobs before it answers anyway.
    pub enqueue_timeout: Duration,
    /// Expected Graph `clientState`; unchecked when `None`.
    pub client_state: Option<String>,
    /// Enables the admin routes.
    pub admin_token: Option<SecretString>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_millis(800),
            client_state: None,
            admin_token: None,
        }
    }
}

/// Shared state for intake routes.
#[derive(Clone)]
pub struct IntakeState {
    pub db: Arc<dyn Database>,
    /// Signalled after every successful enqueue to wake idle workers.
    pub wake: Arc<Notify>,
    pub stats: Arc<IntakeStats>,
    pub config: IntakeConfig,
}

impl IntakeState {
    pub fn new(db: Arc<dyn Database>, wake: Arc<Notify>, config: IntakeConfig) -> Self {
        Self {
            db,
            wake,
            stats: Arc::new(IntakeStats::default()),
            config,
        }
    }

    /// Best-effort enqueue of one webhook's jobs. Never fails the caller.
    ///
    /// The jobs are stored concurrently under a single `enqueue_timeout`;
    /// those still pending at the deadline are counted as failures.
    async fn enqueue_all(&self, jobs: Vec<NotificationJob>) {
        if jobs.is_empty() {
            return;
        }
        let total = jobs.len() as u64;
        let finished = AtomicU64::new(0);
        let finished = &finished;
        let stores = jobs.iter().map(|job| async move {
            let result = self.db.enqueue(job).await;
            self.record(job, result);
            finished.fetch_add(1, Ordering::Relaxed);
        });

        let deadline = tokio::time::timeout(
            self.config.enqueue_timeout,
            futures::future::join_all(stores),
        );
        if deadline.await.is_err() {
            let pending = total.saturating_sub(finished.load(Ordering::Relaxed));
            self.stats.enqueue_failures.fetch_add(pending, Ordering::Relaxed);
            error!(
                pending,
                total,
                timeout_ms = self.config.enqueue_timeout.as_millis() as u64,
                "Enqueue timed out"
            );
        }
    }

    fn record(&self, job: &NotificationJob, result: Result<(), DatabaseError>) {
        match result {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                self.wake.notify_one();
                info!(
                    job_id = %job.id,
                    provider = %job.provider,
                    mailbox = %job.mailbox_key,
                    change = %job.change.value(),
                    "Notification enqueued"
                );
            }
            Err(e) => {
                self.stats.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                error!(job_id = %job.id, mailbox = %job.mailbox_key, error = %e, "Enqueue failed");
            }
        }
    }
}

// ── Webhooks ────────────────────────────────────────────────────────

/// POST /email/gmail
async fn gmail_push(State(state): State<IntakeState>, body: Bytes) -> StatusCode {
    match parse_google_push(&body) {
        Ok(job) => state.enqueue_all(vec![job]).await,
        Err(e) => {
            state.stats.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Ignoring malformed Gmail push");
        }
    }
    StatusCode::NO_CONTENT
}

/// POST /email/outlook
///
/// Subscription validation arrives as `?validationToken=...` and must be
/// echoed back verbatim as text/plain.
async fn outlook_notification(
    State(state): State<IntakeState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Some(token) = query.get("validationToken") {
        info!("Answering Graph subscription validation");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token.clone(),
        )
            .into_response();
    }

    match parse_microsoft_batch(&body, state.config.client_state.as_deref()) {
        Ok(batch) => {
            if batch.dropped > 0 {
                state
                    .stats
                    .dropped_entries
                    .fetch_add(batch.dropped as u64, Ordering::Relaxed);
            }
            state.enqueue_all(batch.jobs).await;
        }
        Err(e) => {
            state.stats.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Ignoring malformed Graph notification");
        }
    }
    StatusCode::OK.into_response()
}

// ── Health ──────────────────────────────────────────────────────────

/// GET /health
async fn health(State(state): State<IntakeState>) -> Response {
    let intake = state.stats.snapshot();
    match state.db.queue_stats().await {
        Ok(queue) => Json(serde_json::json!({
            "status": "ok",
            "service": "autoreply",
            "queue": queue,
            "intake": intake,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Health check could not read queue stats");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "degraded",
                    "service": "autoreply",
                    "error": e.to_string(),
                    "intake": intake,
                })),
            )
                .into_response()
        }
    }
}

// ── Admin ───────────────────────────────────────────────────────────

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check the bearer token against the configured admin token.
fn authorize(state: &IntakeState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.config.admin_token.as_ref() else {
        return Err(StatusCode::NOT_FOUND.into_response());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.expose_secret().as_bytes()) => {
            Ok(())
        }
        _ => Err(error_json(StatusCode::UNAUTHORIZED, "invalid admin token")),
    }
}

#[derive(Debug, Deserialize)]
struct UpsertMailbox {
    email: String,
    provider: String,
    account_id: String,
    access_token: String,
}

/// PUT /admin/mailboxes
async fn upsert_mailbox(
    State(state): State<IntakeState>,
    headers: HeaderMap,
    Json(req): Json<UpsertMailbox>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let provider: ProviderKind = match req.provider.parse() {
        Ok(p) => p,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, e),
    };
    if req.email.trim().is_empty() || req.account_id.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "email and account_id are required");
    }

    match state
        .db
        .upsert_credential(req.email.trim(), provider, req.account_id.trim(), &req.access_token)
        .await
    {
        Ok(mailbox) => Json(serde_json::json!({
            "email": mailbox.email,
            "provider": mailbox.provider,
            "account_id": mailbox.account_id,
            "cursor": mailbox.cursor,
            "needs_reauth": mailbox.needs_reauth,
        }))
        .into_response(),
        Err(DatabaseError::Constraint(msg)) => error_json(StatusCode::CONFLICT, msg),
        Err(e) => {
            error!(error = %e, "Mailbox upsert failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    limit: Option<usize>,
}

/// GET /admin/dead-letters
async fn list_dead_letters(
    State(state): State<IntakeState>,
    headers: HeaderMap,
    Query(query): Query<DeadLetterQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    match state.db.list_dead_letters(limit).await {
        Ok(letters) => Json(letters).into_response(),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /admin/dead-letters/{id}/requeue
async fn requeue_dead_letter(
    State(state): State<IntakeState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.db.requeue_dead_letter(id).await {
        Ok(true) => {
            state.wake.notify_one();
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_json(StatusCode::NOT_FOUND, format!("no dead letter {id}")),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Build the webhook, health, and (when enabled) admin routes.
pub fn webhook_routes(state: IntakeState) -> Router {
    let mut router = Router::new()
        .route("/email/gmail", post(gmail_push))
        .route("/email/outlook", post(outlook_notification))
        .route("/health", get(health));

    if state.config.admin_token.is_some() {
        router = router
            .route("/admin/mailboxes", put(upsert_mailbox))
            .route("/admin/dead-letters", get(list_dead_letters))
            .route("/admin/dead-letters/{id}/requeue", post(requeue_dead_letter));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine as _;
    use tower::ServiceExt;

    use crate::store::fake::FaultyStore;
    use crate::store::{CredentialStore, JobQueue, LibSqlBackend};

    async fn test_state(admin_token: Option<&str>) -> (IntakeState, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = IntakeConfig {
            admin_token: admin_token.map(SecretString::from),
            ..IntakeConfig::default()
        };
        let state = IntakeState::new(db.clone(), Arc::new(Notify::new()), config);
        (state, db)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn gmail_push_body(email: &str, history_id: u64) -> serde_json::Value {
        let data = serde_json::json!({ "emailAddress": email, "historyId": history_id });
        serde_json::json!({
            "message": {
                "data": base64::engine::general_purpose::STANDARD.encode(data.to_string())
            },
            "subscription": "projects/demo/subscriptions/gmail"
        })
    }

    #[tokio::test]
    async fn gmail_push_enqueues_and_returns_no_content() {
        let (state, db) = test_state(None).await;
        let app = webhook_routes(state.clone());

        let resp = app
            .oneshot(post_json("/email/gmail", gmail_push_body("alice@example.com", 105)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        assert_eq!(db.queue_stats().await.unwrap().ready, 1);
        assert_eq!(state.stats.snapshot().accepted, 1);
    }

    #[tokio::test]
    async fn malformed_gmail_push_is_acknowledged_without_job() {
        let (state, db) = test_state(None).await;
        let app = webhook_routes(state.clone());

        let resp = app
            .oneshot(post_json("/email/gmail", serde_json::json!({ "message": {} })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(db.queue_stats().await.unwrap().ready, 0);
        assert_eq!(state.stats.snapshot().malformed, 1);
    }

    #[tokio::test]
    async fn outlook_validation_echoes_token() {
        let (state, db) = test_state(None).await;
        let app = webhook_routes(state);

        let req = Request::builder()
            .method("POST")
            .uri("/email/outlook?validationToken=Validation%3A%20Testing%20client%20application")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(
            body_string(resp).await,
            "Validation: Testing client application"
        );
        assert_eq!(db.queue_stats().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn outlook_batch_enqueues_valid_entries() {
        let (state, db) = test_state(None).await;
        let app = webhook_routes(state.clone());

        let body = serde_json::json!({ "value": [
            { "resource": "Users/u1/Messages/m1", "changeType": "created" },
            { "resource": "Users/u2/Messages/m2", "changeType": "created" },
            { "resource": "not-a-resource", "changeType": "created" }
        ]});
        let resp = app.oneshot(post_json("/email/outlook", body)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(db.queue_stats().await.unwrap().ready, 2);
        let stats = state.stats.snapshot();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.dropped_entries, 1);
    }

    #[tokio::test]
    async fn stalled_batch_answers_within_one_deadline() {
        let db = Arc::new(FaultyStore::new().await);
        db.hang_enqueue.store(true, Ordering::SeqCst);
        let config = IntakeConfig {
            enqueue_timeout: Duration::from_millis(150),
            ..IntakeConfig::default()
        };
        let state = IntakeState::new(db.clone(), Arc::new(Notify::new()), config);

        let body = serde_json::json!({ "value": [
            { "resource": "Users/u1/Messages/m1", "changeType": "created" },
            { "resource": "Users/u1/Messages/m2", "changeType": "created" },
            { "resource": "Users/u1/Messages/m3", "changeType": "created" },
            { "resource": "Users/u1/Messages/m4", "changeType": "created" }
        ]});
        let started = std::time::Instant::now();
        let resp = webhook_routes(state.clone())
            .oneshot(post_json("/email/outlook", body))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(started.elapsed() < Duration::from_millis(450));
        let stats = state.stats.snapshot();
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.enqueue_failures, 4);
    }

    #[tokio::test]
    async fn health_reports_queue_and_intake() {
        let (state, _db) = test_state(None).await;
        let app = webhook_routes(state);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["queue"]["ready"], 0);
        assert_eq!(json["intake"]["accepted"], 0);
    }

    #[tokio::test]
    async fn admin_routes_absent_without_token() {
        let (state, _db) = test_state(None).await;
        let app = webhook_routes(state);

        let req = Request::builder()
            .uri("/admin/dead-letters")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_upsert_requires_bearer_token() {
        let (state, db) = test_state(Some("admin-secret")).await;
        let body = serde_json::json!({
            "email": "alice@example.com",
            "provider": "gmail",
            "account_id": "g-1",
            "access_token": "ya29.token"
        });

        let unauthorized = Request::builder()
            .method("PUT")
            .uri("/admin/mailboxes")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = webhook_routes(state.clone()).oneshot(unauthorized).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let authorized = Request::builder()
            .method("PUT")
            .uri("/admin/mailboxes")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer admin-secret")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = webhook_routes(state).oneshot(authorized).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json["provider"], "google");
        assert!(json.get("access_token").is_none());
        assert!(db.get_credential("alice@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn admin_requeue_unknown_dead_letter_is_not_found() {
        let (state, _db) = test_state(Some("admin-secret")).await;
        let req = Request::builder()
            .method("POST")
            .uri(format!("/admin/dead-letters/{}/requeue", Uuid::new_v4()))
            .header(header::AUTHORIZATION, "Bearer admin-secret")
            .body(Body::empty())
            .unwrap();
        let resp = webhook_routes(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq(b"admin-secret", b"admin-secret"));
        assert!(!constant_time_eq(b"admin-secret", b"admin-secreT"));
        assert!(!constant_time_eq(b"admin", b"admin-secret"));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn admin_rejects_wrong_token() {
        let (state, _db) = test_state(Some("admin-secret")).await;
        let req = Request::builder()
            .uri("/admin/dead-letters")
            .header(header::AUTHORIZATION, "Bearer admin-secreT")
            .body(Body::empty())
            .unwrap();
        let resp = webhook_routes(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
