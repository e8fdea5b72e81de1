//! Signed webhook intake server.
//!
//! `POST /webhook/{platform}` with a platform-specific HMAC-SHA256
//! signature header. Signature verification is a hard precondition:
//! unsigned or mis-signed payloads get 401 and are counted, malformed
//! bodies get 400, downstream backpressure gets 503.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use adbandit_connectors::RawPayload;

use crate::ingestor::{IngestOutcome, Ingestor};
use crate::IngestError;

type HmacSha256 = Hmac<Sha256>;

/// Signature header per platform. Unknown platforms use the generic name.
pub fn signature_header(platform: &str) -> &'static str {
    match platform {
        "google" => "x-goog-signature",
        "meta" => "x-hub-signature-256",
        "tradedesk" => "x-ttd-signature",
        _ => "x-adbandit-signature",
    }
}

/// Constant-time HMAC-SHA256 verification of a hex signature.
///
/// Accepts an optional `sha256=` prefix (Meta-style).
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let hex_part = signature.trim().trim_start_matches("sha256=");
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Shared webhook server state.
pub struct WebhookState {
    pub ingestor: Arc<Ingestor>,
    /// Webhook secret per platform; platforms without one reject all posts.
    pub secrets: HashMap<String, String>,
    pub rejected_signatures: AtomicU64,
    pub accepted: AtomicU64,
}

impl WebhookState {
    pub fn new(ingestor: Arc<Ingestor>, secrets: HashMap<String, String>) -> Self {
        Self {
            ingestor,
            secrets,
            rejected_signatures: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
        }
    }
}

/// Build the webhook router (exposed separately for handler tests).
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/:platform", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve webhooks until the task is cancelled.
pub async fn serve_webhooks(state: Arc<WebhookState>, port: u16) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook server listening");
    axum::serve(listener, app).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "adbandit-webhooks",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn webhook_handler(
    State(state): State<Arc<WebhookState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(secret) = state.secrets.get(&platform) else {
        state.rejected_signatures.fetch_add(1, Ordering::Relaxed);
        return reject(StatusCode::UNAUTHORIZED, "platform has no webhook secret");
    };

    let signature = headers
        .get(signature_header(&platform))
        .and_then(|v| v.to_str().ok());
    let Some(signature) = signature else {
        state.rejected_signatures.fetch_add(1, Ordering::Relaxed);
        return reject(StatusCode::UNAUTHORIZED, "missing signature header");
    };
    if !verify_signature(secret, &body, signature) {
        state.rejected_signatures.fetch_add(1, Ordering::Relaxed);
        warn!(platform, "webhook signature verification failed");
        return reject(StatusCode::UNAUTHORIZED, "signature verification failed");
    }

    let payload = match RawPayload::parse(&platform, &body) {
        Ok(p) => p,
        Err(e) => return reject(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let mut accepted = 0u64;
    let mut hints = 0u64;
    for nm in payload.normalize() {
        match state.ingestor.ingest_normalized(nm) {
            Ok(IngestOutcome::HintApplied) => {
                accepted += 1;
                hints += 1;
            }
            Ok(IngestOutcome::Duplicate) | Ok(IngestOutcome::Recorded)
            | Ok(IngestOutcome::RecordedSuspect) => accepted += 1,
            Err(IngestError::Backpressure) => {
                return reject(StatusCode::SERVICE_UNAVAILABLE, "intake queue full");
            }
            Err(IngestError::Validation(e)) => {
                return reject(StatusCode::BAD_REQUEST, &e.to_string());
            }
            Err(IngestError::UnknownArm(key)) => {
                return reject(StatusCode::BAD_REQUEST, &format!("no arm bound to `{key}`"));
            }
            Err(e) => {
                warn!(platform, error = %e, "webhook ingest failed downstream");
                return reject(StatusCode::SERVICE_UNAVAILABLE, "store unavailable");
            }
        }
    }
    state.accepted.fetch_add(accepted, Ordering::Relaxed);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "accepted": accepted, "hints_applied": hints })),
    )
}

fn reject(status: StatusCode, detail: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": detail })))
}

/// Sign a body the way platforms do (used by tests and the simulator).
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
