//! Webhook ingest endpoint: HMAC-authenticated job submissions plus fate
//! lookups for previously submitted items.

use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use super::WebState;
use super::error::ApiError;
use crate::data::models::{IngestSource, ItemType};
use crate::ingest::{Candidate, IngestOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Signature header carrying hex-encoded HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-ingest-signature";

/// Verify a hex signature against the raw body. Constant-time on the MAC
/// comparison.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Tracks recently seen signatures so an identical body+signature replay
/// inside the window is rejected.
pub struct ReplayGuard {
    seen: DashMap<String, Instant>,
    window: Duration,
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
        }
    }

    /// Record a signature; returns false when it was already seen within
    /// the window.
    pub fn register(&self, signature: &str) -> bool {
        let now = Instant::now();
        // Opportunistic sweep keeps the map bounded under sustained load.
        if self.seen.len() > 4096 {
            let window = self.window;
            self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < window);
        }

        if let Some(seen_at) = self.seen.get(signature) {
            if now.duration_since(*seen_at) < self.window {
                return false;
            }
        }
        self.seen.insert(signature.to_string(), now);
        true
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub url: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub source_label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn source_from_label(label: Option<&str>) -> IngestSource {
    match label.map(str::to_lowercase).as_deref() {
        Some("email") => IngestSource::Email,
        Some("user") | Some("user_submission") => IngestSource::UserSubmission,
        _ => IngestSource::Webhook,
    }
}

/// `POST /ingest/job`
pub async fn ingest_job(
    State(state): State<WebState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    if state.limiter.check().is_err() {
        return Err(ApiError::rate_limited());
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing signature"))?;

    if !verify_signature(&state.webhook_secret, &body, signature) {
        warn!("webhook signature verification failed");
        return Err(ApiError::unauthorized("invalid signature"));
    }

    if !state.replay.register(signature) {
        warn!("webhook replay rejected");
        return Err(ApiError::unauthorized("replayed request"));
    }

    let mut deserializer = serde_json::Deserializer::from_slice(&body);
    let request: IngestRequest = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))?;

    if request.url.trim().is_empty() {
        return Err(ApiError::bad_request("url must not be empty"));
    }

    let candidate = Candidate {
        url: request.url,
        company_name: request.company_name,
        website: request.website,
        source: source_from_label(request.source_label.as_deref()),
        submitted_by: None,
        scraped_data: None,
        item_type: ItemType::Job,
    };

    match state.intake.submit(candidate).await {
        Ok(IngestOutcome::Queued { id }) => {
            debug!(item_id = %id, "webhook submission queued");
            Ok(Json(IngestResponse {
                status: "queued",
                reason: None,
                id: Some(id),
            }))
        }
        Ok(IngestOutcome::Skipped { reason }) => Ok(Json(IngestResponse {
            status: "skipped",
            reason: Some(reason),
            id: None,
        })),
        Err(e) => {
            warn!(error = ?e, "webhook submission failed");
            Err(ApiError::internal("submission failed"))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ItemFate {
    pub id: String,
    pub status: &'static str,
    pub url: String,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /ingest/jobs/{id}`: observe a submitted item's fate.
pub async fn get_item(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<Json<ItemFate>, ApiError> {
    match state.queue.get(&id).await {
        Ok(Some(item)) => Ok(Json(ItemFate {
            id: item.id,
            status: item.status.as_str(),
            url: item.url,
            retry_count: item.retry_count,
            result_message: item.result_message,
            error: item
                .error_details
                .map(|d| format!("{}: {}", d.kind, d.message)),
        })),
        Ok(None) => Err(ApiError::not_found("no such item")),
        Err(e) => {
            warn!(error = %e, "item lookup failed");
            Err(ApiError::internal("lookup failed"))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// `GET /health`
pub async fn health(State(state): State<WebState>) -> Result<Json<HealthResponse>, ApiError> {
    match state.queue.stats().await {
        Ok(stats) => Ok(Json(HealthResponse {
            status: "ok",
            pending: stats.pending,
            processing: stats.processing,
            success: stats.success,
            skipped: stats.skipped,
            failed: stats.failed,
        })),
        Err(e) => {
            warn!(error = %e, "health check failed");
            Err(ApiError::internal("store unavailable"))
        }
    }
}
