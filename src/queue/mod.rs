//! Durable FIFO work queue over the document store.
//!
//! Items move PENDING -> PROCESSING -> {SUCCESS, SKIPPED, FAILED}; a
//! release returns a PROCESSING item to PENDING with its original
//! `created_at`, so FIFO order survives retries. Claims are conditional
//! updates keyed on `status == PENDING`, which is what makes concurrent
//! workers safe without cross-process coordination.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data::models::{
    ErrorDetails, IngestSource, ItemStatus, ItemType, QueueItem,
};
use crate::error::ErrorKind;
use crate::store::{
    Collection, Cond, DocumentStore, Filter, OrderKind, Query, StoreError, collections,
};

/// How many expired leases one claim call will recover.
const STALE_SWEEP_LIMIT: usize = 50;

/// Overfetch factor for claim candidates, to absorb lost races.
const CLAIM_OVERFETCH: usize = 2;

const NON_TERMINAL: [&str; 2] = ["PENDING", "PROCESSING"];

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("another live item already holds url_hash {url_hash}")]
    Duplicate { url_hash: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fields for a new item; the queue assigns id, status, and timestamps.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub item_type: ItemType,
    pub url: String,
    pub url_hash: String,
    pub company_name: String,
    pub source: IngestSource,
    pub submitted_by: Option<String>,
    pub scraped_data: Option<Value>,
    pub max_retries: u32,
}

/// Whether a release re-queued the item or exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Requeued { retry_count: u32 },
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct QueueManager {
    items: Collection<QueueItem>,
    store: Arc<dyn DocumentStore>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            items: Collection::new(store.clone(), collections::QUEUE),
            store,
        }
    }

    fn build_item(new: NewItem, status: ItemStatus) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: Uuid::new_v4().to_string(),
            item_type: new.item_type,
            status,
            url: new.url,
            url_hash: new.url_hash,
            company_name: new.company_name,
            company_id: None,
            source: new.source,
            submitted_by: new.submitted_by,
            scraped_data: new.scraped_data,
            retry_count: 0,
            max_retries: new.max_retries,
            error_details: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            completed_at: if status.is_terminal() { Some(now) } else { None },
            lease_expires_at: None,
            result_message: None,
        }
    }

    /// Insert a PENDING item, rejecting it when another non-terminal item
    /// already holds the same `url_hash`.
    ///
    /// The check-then-insert window is closed by the intake's dedup step;
    /// this is the best-effort backstop.
    pub async fn enqueue(&self, new: NewItem) -> Result<QueueItem, QueueError> {
        let live = self
            .find_nonterminal_hashes(std::slice::from_ref(&new.url_hash))
            .await?;
        if live.contains(&new.url_hash) {
            return Err(QueueError::Duplicate {
                url_hash: new.url_hash,
            });
        }

        let item = Self::build_item(new, ItemStatus::Pending);
        self.items.insert(&item.id, &item).await?;
        debug!(item_id = %item.id, url_hash = %item.url_hash, "item enqueued");
        Ok(item)
    }

    /// Write a terminal SKIPPED row so a rejected submission's fate stays
    /// observable.
    pub async fn record_skipped(
        &self,
        new: NewItem,
        reason: &str,
    ) -> Result<QueueItem, QueueError> {
        let mut item = Self::build_item(new, ItemStatus::Skipped);
        item.result_message = Some(reason.to_string());
        self.items.insert(&item.id, &item).await?;
        Ok(item)
    }

    /// Atomically claim up to `batch_size` of the oldest PENDING items.
    ///
    /// Also sweeps expired leases back to PENDING first, so work lost to a
    /// crashed worker reappears here. Items whose conditional update fails
    /// were taken by another worker and are skipped.
    pub async fn claim(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<QueueItem>, StoreError> {
        self.recover_stale_leases().await?;

        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .items
            .query(
                &Query::new()
                    .filter(Filter::Eq("status".into(), json!("PENDING")))
                    .order_asc("created_at", OrderKind::Numeric)
                    .order_asc("id", OrderKind::Text)
                    .limit(batch_size * CLAIM_OVERFETCH),
            )
            .await?;

        let now = Utc::now();
        let lease_expires =
            now + chrono::Duration::milliseconds(lease.as_millis() as i64);

        let mut claimed = Vec::with_capacity(batch_size);
        for mut item in candidates {
            if claimed.len() >= batch_size {
                break;
            }
            let prior_updated = item.updated_at.timestamp_millis();
            item.status = ItemStatus::Processing;
            item.lease_expires_at = Some(lease_expires);
            item.processed_at = Some(now);
            item.updated_at = now;

            // Guarding on updated_at as well keeps a stale snapshot from
            // clobbering a claim-release cycle that raced this read.
            match self
                .items
                .update_if(
                    &item.id,
                    &[
                        Cond::Eq("status".into(), json!("PENDING")),
                        Cond::Eq("updated_at".into(), json!(prior_updated)),
                    ],
                    &item,
                )
                .await
            {
                Ok(()) => claimed.push(item),
                // Another worker won the race for this item.
                Err(StoreError::Precondition { .. }) | Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed queue items");
        }
        Ok(claimed)
    }

    /// Return expired PROCESSING items to PENDING without touching
    /// `retry_count`: the previous worker crashed rather than observed a
    /// failure, and `created_at` keeps the item's FIFO position.
    pub async fn recover_stale_leases(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let expired = self
            .items
            .query(
                &Query::new()
                    .filter(Filter::Eq("status".into(), json!("PROCESSING")))
                    .filter(Filter::Lt(
                        "lease_expires_at".into(),
                        json!(now.timestamp_millis()),
                    ))
                    .limit(STALE_SWEEP_LIMIT),
            )
            .await?;

        let mut recovered = 0;
        for mut item in expired {
            let old_lease = match item.lease_expires_at {
                Some(lease) => lease,
                None => continue,
            };
            item.status = ItemStatus::Pending;
            item.lease_expires_at = None;
            item.updated_at = now;

            // Guard on the old lease value too, so a freshly re-claimed item
            // (new lease, same PROCESSING status) is left alone.
            match self
                .items
                .update_if(
                    &item.id,
                    &[
                        Cond::Eq("status".into(), json!("PROCESSING")),
                        Cond::Eq(
                            "lease_expires_at".into(),
                            json!(old_lease.timestamp_millis()),
                        ),
                    ],
                    &item,
                )
                .await
            {
                Ok(()) => recovered += 1,
                Err(StoreError::Precondition { .. }) | Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if recovered > 0 {
            warn!(count = recovered, "recovered stale leases");
        }
        Ok(recovered)
    }

    /// Finish a PROCESSING item with a terminal status. No-op if the item
    /// is already terminal.
    pub async fn complete(
        &self,
        id: &str,
        terminal: ItemStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        debug_assert!(terminal.is_terminal());

        let mut item = match self.items.get(id).await? {
            Some(item) => item,
            None => {
                return Err(StoreError::NotFound {
                    collection: collections::QUEUE.to_string(),
                    key: id.to_string(),
                });
            }
        };

        if item.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        item.status = terminal;
        item.completed_at = Some(now);
        item.updated_at = now;
        item.lease_expires_at = None;
        if let Some(message) = message {
            item.result_message = Some(message.to_string());
        }

        match self
            .items
            .update_if(id, &[Cond::Eq("status".into(), json!("PROCESSING"))], &item)
            .await
        {
            Ok(()) => {
                info!(item_id = id, status = terminal.as_str(), "item completed");
                Ok(())
            }
            Err(StoreError::Precondition { .. }) => {
                // Lost a race with another finisher; terminal is terminal.
                match self.items.get(id).await? {
                    Some(current) if current.status.is_terminal() => Ok(()),
                    _ => Err(StoreError::Precondition {
                        collection: collections::QUEUE.to_string(),
                        key: id.to_string(),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Record a failure on a PROCESSING item and either return it to
    /// PENDING for retry or fail it when retries are exhausted.
    ///
    /// The original `created_at` is preserved so the item keeps its FIFO
    /// position; the worker's poll interval provides the retry delay.
    pub async fn release(
        &self,
        id: &str,
        kind: ErrorKind,
        message: &str,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut item = match self.items.get(id).await? {
            Some(item) => item,
            None => {
                return Err(StoreError::NotFound {
                    collection: collections::QUEUE.to_string(),
                    key: id.to_string(),
                });
            }
        };

        let now = Utc::now();
        let retry_count = item.retry_count + 1;
        item.retry_count = retry_count;
        item.error_details = Some(ErrorDetails {
            kind,
            message: message.to_string(),
            at: now,
        });
        item.updated_at = now;
        item.lease_expires_at = None;

        let outcome = if retry_count >= item.max_retries {
            item.status = ItemStatus::Failed;
            item.completed_at = Some(now);
            item.result_message = Some(format!("{kind}: {message}"));
            ReleaseOutcome::Exhausted
        } else {
            item.status = ItemStatus::Pending;
            ReleaseOutcome::Requeued { retry_count }
        };

        self.items
            .update_if(id, &[Cond::Eq("status".into(), json!("PROCESSING"))], &item)
            .await?;

        match outcome {
            ReleaseOutcome::Requeued { retry_count } => {
                info!(item_id = id, retry_count, error_kind = %kind, "item released for retry");
            }
            ReleaseOutcome::Exhausted => {
                warn!(item_id = id, error_kind = %kind, "item failed, retries exhausted");
            }
        }
        Ok(outcome)
    }

    /// Record the resolved company on an in-flight item. Best-effort.
    pub async fn set_company(&self, id: &str, company_id: &str) -> Result<(), StoreError> {
        let mut item = match self.items.get(id).await? {
            Some(item) => item,
            None => return Ok(()),
        };
        if item.status != ItemStatus::Processing {
            return Ok(());
        }
        item.company_id = Some(company_id.to_string());
        item.updated_at = Utc::now();
        match self
            .items
            .update_if(id, &[Cond::Eq("status".into(), json!("PROCESSING"))], &item)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::Precondition { .. }) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        self.items.get(id).await
    }

    /// Which of the given hashes are held by non-terminal items.
    ///
    /// Chunked to the same fan-in bound as key-based existence checks.
    pub async fn find_nonterminal_hashes(
        &self,
        hashes: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let mut live = HashSet::new();
        for chunk in hashes.chunks(crate::store::BATCH_EXISTS_CHUNK) {
            let found = self
                .items
                .query(
                    &Query::new()
                        .filter(Filter::In("url_hash".into(), chunk.to_vec()))
                        .filter(Filter::In(
                            "status".into(),
                            NON_TERMINAL.iter().map(|s| s.to_string()).collect(),
                        )),
                )
                .await?;
            live.extend(found.into_iter().map(|item| item.url_hash));
        }
        Ok(live)
    }

    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let count = |status: &'static str| async move {
            self.store
                .count(
                    collections::QUEUE,
                    &[Filter::Eq("status".into(), json!(status))],
                )
                .await
        };

        Ok(QueueStats {
            pending: count("PENDING").await?,
            processing: count("PROCESSING").await?,
            success: count("SUCCESS").await?,
            skipped: count("SKIPPED").await?,
            failed: count("FAILED").await?,
        })
    }

    /// Delete terminal items older than the retention window. Returns the
    /// number removed.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        let stale = self
            .items
            .query(
                &Query::new()
                    .filter(Filter::In(
                        "status".into(),
                        ["SUCCESS", "SKIPPED", "FAILED"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    ))
                    .filter(Filter::Lt(
                        "completed_at".into(),
                        json!(cutoff.timestamp_millis()),
                    )),
            )
            .await?;

        let mut removed = 0;
        for item in stale {
            self.items.delete(&item.id).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "cleaned up terminal queue items");
        }
        Ok(removed)
    }
}
