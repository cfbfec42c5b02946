use std::sync::Arc;
use std::sync::Mutex;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use futures::future::BoxFuture;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use tracing::warn;

use crate::dedupe::DedupeSet;
use crate::envelope::normalize;
use crate::envelope::workflow_id_for;
use crate::signature::verify;

/// Keys remembered for dedupe before oldest entries are evicted.
const DEDUPE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A workflow with the same id already exists; counted as success
    /// because the orchestrator is the durable dedupe layer.
    AlreadyRunning,
}

/// Seam to the workflow orchestrator.
pub trait WorkflowStarter: Send + Sync {
    fn start_workflow<'a>(
        &'a self,
        workflow_id: &'a str,
        args: Value,
    ) -> BoxFuture<'a, Result<StartOutcome, String>>;
}

pub struct WebhookState {
    pub secret: Option<String>,
    /// Hardened mode refuses unsigned deliveries outright.
    pub production: bool,
    pub workflow_slug: String,
    pub starter: Arc<dyn WorkflowStarter>,
    dedupe: Mutex<DedupeSet>,
}

impl WebhookState {
    pub fn new(
        secret: Option<String>,
        production: bool,
        workflow_slug: &str,
        starter: Arc<dyn WorkflowStarter>,
    ) -> Self {
        Self {
            secret,
            production,
            workflow_slug: workflow_slug.to_string(),
            starter,
            dedupe: Mutex::new(DedupeSet::new(DEDUPE_CAPACITY)),
        }
    }

    fn first_seen(&self, key: &str) -> bool {
        match self.dedupe.lock() {
            Ok(mut set) => set.insert(key),
            Err(poisoned) => poisoned.into_inner().insert(key),
        }
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks/github/app", post(handle_github))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn handle_github(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = header(&headers, "x-github-event");
    let delivery_id = header(&headers, "x-github-delivery");
    let signature = header(&headers, "x-hub-signature-256");

    match &state.secret {
        Some(secret) => {
            if !verify(&body, signature, secret) {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "signature verification failed"})),
                )
                    .into_response();
            }
        }
        None if state.production => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "webhook secret not configured"})),
            )
                .into_response();
        }
        None => {
            warn!("webhook secret not configured; accepting unsigned delivery (dev mode)");
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid JSON payload: {err}")})),
            )
                .into_response();
        }
    };

    let envelope = normalize(event, delivery_id, &payload);

    if !state.first_seen(&envelope.dedupe_key) {
        info!(dedupe_key = %envelope.dedupe_key, "duplicate delivery dropped");
        return (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response();
    }

    let workflow_id = workflow_id_for(&state.workflow_slug, &envelope.dedupe_key);
    let args = match serde_json::to_value(&envelope) {
        Ok(args) => args,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("envelope serialization failed: {err}")})),
            )
                .into_response();
        }
    };

    match state.starter.start_workflow(&workflow_id, args).await {
        Ok(StartOutcome::Started) => {
            info!(workflow_id = %workflow_id, event = %envelope.event, "workflow enqueued");
        }
        Ok(StartOutcome::AlreadyRunning) => {
            info!(workflow_id = %workflow_id, "workflow already running; delivery collapsed");
        }
        Err(err) => {
            warn!(workflow_id = %workflow_id, "failed to start workflow: {err}");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "failed to enqueue workflow"})),
            )
                .into_response();
        }
    }

    (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response()
}
