//! Webhook web service: router assembly and the axum server wrapper.

pub mod error;
pub mod ingest;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, trace, warn};

use crate::ingest::IngestIntake;
use crate::queue::QueueManager;
use crate::services::Service;
use self::ingest::ReplayGuard;

pub type WebhookRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Build the webhook rate limiter from requests-per-minute and burst.
pub fn build_limiter(rpm: u32, burst: u32) -> anyhow::Result<WebhookRateLimiter> {
    let burst = std::num::NonZeroU32::new(burst.max(1))
        .ok_or_else(|| anyhow::anyhow!("invalid webhook burst"))?;
    let quota = Quota::with_period(Duration::from_secs(60) / rpm.max(1))
        .ok_or_else(|| anyhow::anyhow!("invalid webhook rate limit"))?
        .allow_burst(burst);
    Ok(RateLimiter::direct(quota))
}

/// Shared state for all webhook routes.
#[derive(Clone)]
pub struct WebState {
    pub intake: Arc<IngestIntake>,
    pub queue: Arc<QueueManager>,
    pub webhook_secret: Arc<str>,
    pub replay: Arc<ReplayGuard>,
    pub limiter: Arc<WebhookRateLimiter>,
}

/// Creates the web server router.
pub fn create_router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(ingest::health))
        .route("/ingest/job", post(ingest::ingest_job))
        .route("/ingest/jobs/{id}", get(ingest::get_item))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

/// Web server service implementation.
pub struct WebService {
    port: u16,
    state: WebState,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl WebService {
    pub fn new(port: u16, state: WebState) -> Self {
        Self {
            port,
            state,
            shutdown_tx: None,
        }
    }
}

#[async_trait::async_trait]
impl Service for WebService {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let app = create_router(self.state.clone());
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        info!(service = "web", address = %addr, "webhook server listening");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                trace!(service = "web", "starting graceful shutdown");
            })
            .await?;

        info!(service = "web", "webhook server stopped");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        } else {
            warn!(service = "web", "no shutdown channel, cannot stop gracefully");
        }
        Ok(())
    }
}
