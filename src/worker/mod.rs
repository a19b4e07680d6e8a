//! Queue worker: claims batches, fans out per-item pipelines, and maps
//! stage outcomes back onto the queue.
//!
//! One claim loop per process with bounded per-item concurrency; more
//! throughput comes from running more worker processes. Shutdown stops
//! claiming and lets in-flight items finish; anything still PROCESSING at
//! exit is recovered by stale-lease cleanup on the next run.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data::models::{ItemStatus, QueueItem};
use crate::pipeline::{ItemPipeline, StageOutcome};
use crate::queue::QueueManager;
use crate::services::Service;
use crate::settings::SettingsCache;
use crate::store::StoreError;

/// Pause after a failed claim before polling again.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// How often terminal items are swept out.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Apply one pipeline outcome to the queue.
pub async fn dispatch_outcome(queue: &QueueManager, item: &QueueItem, outcome: StageOutcome) {
    let result = match outcome {
        StageOutcome::Success(message) => {
            queue
                .complete(&item.id, ItemStatus::Success, Some(&message))
                .await
        }
        StageOutcome::Skip(reason) => {
            queue
                .complete(&item.id, ItemStatus::Skipped, Some(&reason))
                .await
        }
        StageOutcome::Retry(kind, message) if kind.is_retryable() => queue
            .release(&item.id, kind, &message)
            .await
            .map(|_| ()),
        StageOutcome::Retry(kind, message) | StageOutcome::Terminal(kind, message) => {
            queue
                .complete(
                    &item.id,
                    ItemStatus::Failed,
                    Some(&format!("{kind}: {message}")),
                )
                .await
        }
    };

    if let Err(e) = result {
        error!(item_id = %item.id, error = %e, "failed to record item outcome");
    }
}

/// Claim one batch and run it through the pipeline, up to `concurrency`
/// items at a time. Returns how many items were claimed.
pub async fn drain_once(
    queue: &QueueManager,
    pipeline: &ItemPipeline,
    batch_size: usize,
    lease: Duration,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<usize, StoreError> {
    let items = queue.claim(batch_size, lease).await?;
    if items.is_empty() {
        return Ok(0);
    }

    let claimed = items.len();
    futures::stream::iter(items)
        .for_each_concurrent(concurrency.max(1), |item| async move {
            // Between items: claimed-but-unstarted work is abandoned on
            // shutdown and recovered via lease expiry.
            if cancel.is_cancelled() {
                return;
            }
            debug!(item_id = %item.id, "processing item");
            let outcome = pipeline.run(&item).await;
            dispatch_outcome(queue, &item, outcome).await;
        })
        .await;

    Ok(claimed)
}

/// The worker daemon's main service.
pub struct WorkerService {
    queue: Arc<QueueManager>,
    pipeline: Arc<ItemPipeline>,
    settings: Arc<SettingsCache>,
    cancel: CancellationToken,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerService {
    pub fn new(
        queue: Arc<QueueManager>,
        pipeline: Arc<ItemPipeline>,
        settings: Arc<SettingsCache>,
    ) -> Self {
        Self {
            queue,
            pipeline,
            settings,
            cancel: CancellationToken::new(),
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    async fn claim_loop(
        queue: Arc<QueueManager>,
        pipeline: Arc<ItemPipeline>,
        settings: Arc<SettingsCache>,
        cancel: CancellationToken,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("worker claim loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let tunables = settings.current().queue.clone();
            let result = drain_once(
                &queue,
                &pipeline,
                tunables.batch_size,
                tunables.lease(),
                tunables.concurrency,
                &cancel,
            )
            .await;

            let idle = match result {
                Ok(0) => Some(tunables.poll_interval()),
                Ok(claimed) => {
                    debug!(claimed, "batch processed");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "claim failed");
                    Some(CLAIM_ERROR_BACKOFF)
                }
            };

            if let Some(pause) = idle {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }
        info!("worker claim loop exiting");
    }

    async fn cleanup_loop(
        queue: Arc<QueueManager>,
        settings: Arc<SettingsCache>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let retention = settings.current().queue.retention();
                    match queue.cleanup(retention).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "retention sweep removed terminal items"),
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for WorkerService {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        // Surface work orphaned by an unclean shutdown before claiming.
        match self.queue.recover_stale_leases().await {
            Ok(0) => {}
            Ok(count) => warn!(count, "recovered items from previous run"),
            Err(e) => warn!(error = %e, "startup lease recovery failed"),
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        self.handles.push(tokio::spawn(Self::claim_loop(
            self.queue.clone(),
            self.pipeline.clone(),
            self.settings.clone(),
            self.cancel.clone(),
            shutdown_tx.subscribe(),
        )));
        self.handles.push(tokio::spawn(Self::cleanup_loop(
            self.queue.clone(),
            self.settings.clone(),
            shutdown_tx.subscribe(),
        )));

        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        info!("worker shutting down, waiting for in-flight items");
        self.cancel.cancel();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let handles = std::mem::take(&mut self.handles);
        let results = futures::future::join_all(handles).await;
        let panicked = results.iter().filter(|r| r.is_err()).count();
        if panicked > 0 {
            return Err(anyhow::anyhow!("{panicked} worker task(s) panicked"));
        }
        Ok(())
    }
}
