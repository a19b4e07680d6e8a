//! Source rotation: deterministic pick of the next sources to scrape, and
//! the driver service that runs them through intake.
//!
//! Ordering is a lexicographic key: health first, then tier, then staleness,
//! then the owning company's recent scrape rate so one dominant company
//! cannot starve the rest. No randomization; ties break on `source_id`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::AdapterSet;
use crate::data::models::{IngestSource, ItemType, SourceRecord};
use crate::ingest::{Candidate, IngestIntake};
use crate::queue::QueueManager;
use crate::services::Service;
use crate::settings::SettingsCache;
use crate::sources::{SourceRegistry, company_scrape_rates};

/// Longest pause between cycles under backpressure.
const BACKOFF_CAP: Duration = Duration::from_secs(60 * 60);

/// Pick the next `k` sources to scrape from a registry snapshot.
///
/// Deterministic given the snapshot: higher health first, then tier
/// (S before D), then least-recently-scraped (never-scraped counts as
/// epoch), then lower company scrape rate, then `source_id`.
pub fn plan(
    sources: &[SourceRecord],
    rates: &HashMap<String, f64>,
    k: usize,
) -> Vec<SourceRecord> {
    let epoch = DateTime::<Utc>::MIN_UTC;
    let mut eligible: Vec<&SourceRecord> = sources.iter().filter(|s| s.enabled).collect();

    eligible.sort_by(|a, b| {
        b.health_score
            .total_cmp(&a.health_score)
            .then_with(|| a.tier.rank().cmp(&b.tier.rank()))
            .then_with(|| {
                let last_a = a.last_scraped_at.unwrap_or(epoch);
                let last_b = b.last_scraped_at.unwrap_or(epoch);
                last_a.cmp(&last_b)
            })
            .then_with(|| {
                let rate_a = rates.get(&a.company_id).copied().unwrap_or(0.0);
                let rate_b = rates.get(&b.company_id).copied().unwrap_or(0.0);
                rate_a.total_cmp(&rate_b)
            })
            .then_with(|| a.source_id.cmp(&b.source_id))
    });

    eligible.into_iter().take(k).cloned().collect()
}

#[cfg(test)]
fn compare_for_test(a: &SourceRecord, b: &SourceRecord) -> std::cmp::Ordering {
    plan(&[a.clone(), b.clone()], &HashMap::new(), 2)
        .first()
        .map(|first| {
            if first.source_id == a.source_id {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        })
        .unwrap_or(std::cmp::Ordering::Equal)
}

/// Long-running driver: plans a rotation, invokes the scraper adapters,
/// funnels discovered URLs through intake, and feeds results back into the
/// health tracker. Slows down exponentially while the queue is saturated.
pub struct RotationService {
    registry: Arc<SourceRegistry>,
    queue: Arc<QueueManager>,
    intake: Arc<IngestIntake>,
    settings: Arc<SettingsCache>,
    adapters: Arc<AdapterSet>,
    interval: Duration,
    batch: usize,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl RotationService {
    pub fn new(
        registry: Arc<SourceRegistry>,
        queue: Arc<QueueManager>,
        intake: Arc<IngestIntake>,
        settings: Arc<SettingsCache>,
        adapters: Arc<AdapterSet>,
        interval: Duration,
        batch: usize,
    ) -> Self {
        Self {
            registry,
            queue,
            intake,
            settings,
            adapters,
            interval,
            batch,
            shutdown_tx: None,
        }
    }

    /// One rotation cycle. Returns the number of URLs queued.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> crate::error::Result<usize> {
        let snapshot = self.registry.list_enabled().await?;
        if snapshot.is_empty() {
            debug!("no enabled sources");
            return Ok(0);
        }

        let rates = company_scrape_rates(&snapshot, Utc::now());
        let picks = plan(&snapshot, &rates, self.batch);
        info!(
            eligible = snapshot.len(),
            picked = picks.len(),
            "rotation cycle planned"
        );

        let mut queued_total = 0;
        for source in picks {
            if cancel.is_cancelled() {
                break;
            }

            let Some(scraper) = self.adapters.scraper_for(&source.kind) else {
                warn!(source_id = %source.source_id, kind = %source.kind, "no adapter for source kind");
                self.registry
                    .record_failure(&source.source_id, "PARSE_FAILED")
                    .await?;
                continue;
            };

            let started = Instant::now();
            match scraper.scrape(&source).await {
                Ok(raw_jobs) => {
                    let duration_ms = started.elapsed().as_millis() as i64;
                    let found = raw_jobs.len() as u64;

                    let candidates: Vec<Candidate> = raw_jobs
                        .into_iter()
                        .map(|job| Candidate {
                            url: job.url.clone(),
                            company_name: job.company_name.clone(),
                            website: None,
                            source: IngestSource::Scraper,
                            submitted_by: None,
                            scraped_data: serde_json::to_value(&job).ok(),
                            item_type: ItemType::Job,
                        })
                        .collect();

                    let outcomes = self.intake.submit_batch(candidates).await?;
                    let queued = outcomes.iter().filter(|o| o.is_queued()).count();
                    queued_total += queued;

                    info!(
                        source_id = %source.source_id,
                        found,
                        queued,
                        duration_ms,
                        "source scraped"
                    );
                    self.registry
                        .record_success(&source.source_id, found, duration_ms)
                        .await?;
                }
                Err(e) => {
                    self.registry
                        .record_failure(&source.source_id, e.kind().as_str())
                        .await?;
                }
            }
        }

        Ok(queued_total)
    }

    /// Whether the queue is saturated enough to slow the rotation down.
    async fn over_watermark(&self) -> bool {
        let watermark = self.settings.current().queue.queue_high_watermark;
        match self.queue.stats().await {
            Ok(stats) => stats.pending > watermark,
            Err(e) => {
                warn!(error = %e, "queue stats unavailable, assuming saturated");
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for RotationService {
    fn name(&self) -> &'static str {
        "rotation"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let cancel = CancellationToken::new();
        let mut backoff_exp: u32 = 0;
        let mut next_run = time::Instant::now();

        loop {
            tokio::select! {
                _ = time::sleep_until(next_run) => {
                    let delay = if self.over_watermark().await {
                        backoff_exp = (backoff_exp + 1).min(10);
                        let base = self.interval.as_secs_f64() * f64::from(1u32 << backoff_exp.min(6));
                        let capped = base.min(BACKOFF_CAP.as_secs_f64());
                        // Jitter so parallel drivers do not re-align.
                        let jitter = rand::rng().random_range(0.8..1.2);
                        let delay = Duration::from_secs_f64(capped * jitter);
                        warn!(
                            backoff_exp,
                            delay = ?delay,
                            "queue over high watermark, backing off rotation"
                        );
                        delay
                    } else {
                        backoff_exp = 0;
                        match self.run_cycle(&cancel).await {
                            Ok(queued) => debug!(queued, "rotation cycle complete"),
                            Err(e) => warn!(error = ?e, "rotation cycle failed"),
                        }
                        self.interval
                    };
                    next_run = time::Instant::now() + delay;
                }
                _ = shutdown_rx.recv() => {
                    cancel.cancel();
                    info!("rotation driver exiting");
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}
