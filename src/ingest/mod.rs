//! Ingest intake: the single entry point for candidate URLs.
//!
//! Every candidate runs canonicalize -> stop list -> dedup -> enqueue.
//! The dedup step consults the in-process cache first and falls back to
//! the queue's live items and the matches collection; the cache is
//! advisory, the store is the source of truth.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::data::models::{IngestSource, ItemType};
use crate::dedup::DedupCache;
use crate::queue::{NewItem, QueueError, QueueManager};
use crate::settings::SettingsCache;
use crate::store::{DocumentStore, batch_exists, collections};
use crate::urlnorm;

pub const REASON_DUPLICATE: &str = "duplicate";

/// One (URL, company?, source) submission.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: String,
    pub company_name: Option<String>,
    pub website: Option<String>,
    pub source: IngestSource,
    pub submitted_by: Option<String>,
    pub scraped_data: Option<Value>,
    pub item_type: ItemType,
}

impl Candidate {
    pub fn job(url: impl Into<String>, source: IngestSource) -> Self {
        Self {
            url: url.into(),
            company_name: None,
            website: None,
            source,
            submitted_by: None,
            scraped_data: None,
            item_type: ItemType::Job,
        }
    }

    fn scraped_field(&self, name: &str) -> String {
        self.scraped_data
            .as_ref()
            .and_then(|d| d.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued { id: String },
    Skipped { reason: String },
}

impl IngestOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, IngestOutcome::Queued { .. })
    }
}

pub struct IngestIntake {
    queue: Arc<QueueManager>,
    store: Arc<dyn DocumentStore>,
    dedup: Arc<DedupCache>,
    settings: Arc<SettingsCache>,
}

impl IngestIntake {
    pub fn new(
        queue: Arc<QueueManager>,
        store: Arc<dyn DocumentStore>,
        dedup: Arc<DedupCache>,
        settings: Arc<SettingsCache>,
    ) -> Self {
        Self {
            queue,
            store,
            dedup,
            settings,
        }
    }

    pub async fn submit(&self, candidate: Candidate) -> crate::error::Result<IngestOutcome> {
        let mut outcomes = self.submit_batch(vec![candidate]).await?;
        Ok(outcomes
            .pop()
            .unwrap_or(IngestOutcome::Skipped {
                reason: "empty batch".to_string(),
            }))
    }

    /// Process a batch: in-batch duplicates collapse before any store
    /// round-trip, then existence checks run chunked against the queue's
    /// live items and the matches collection.
    pub async fn submit_batch(
        &self,
        batch: Vec<Candidate>,
    ) -> crate::error::Result<Vec<IngestOutcome>> {
        let snapshot = self.settings.current();
        let mut outcomes: Vec<Option<IngestOutcome>> = vec![None; batch.len()];

        // Canonicalize everything up front.
        let canonical: Vec<urlnorm::CanonicalUrl> =
            batch.iter().map(|c| urlnorm::canonicalize(&c.url)).collect();

        // Stop list, then in-batch dedup (first occurrence wins).
        let mut seen_in_batch: HashSet<&str> = HashSet::new();
        let mut to_check: Vec<usize> = Vec::new();
        for (i, candidate) in batch.iter().enumerate() {
            let host = url::Url::parse(&canonical[i].url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();

            if let Some(stop) = snapshot.stop_list.is_excluded(
                candidate.company_name.as_deref().unwrap_or_default(),
                &candidate.scraped_field("title"),
                &candidate.scraped_field("description"),
                &host,
            ) {
                info!(url = %canonical[i].url, reason = stop.reason(), "candidate stop-listed");
                self.record_rejection(candidate, &canonical[i], stop.reason())
                    .await?;
                outcomes[i] = Some(IngestOutcome::Skipped {
                    reason: stop.reason().to_string(),
                });
                continue;
            }

            if !seen_in_batch.insert(canonical[i].hash.as_str()) {
                outcomes[i] = Some(IngestOutcome::Skipped {
                    reason: REASON_DUPLICATE.to_string(),
                });
                continue;
            }
            to_check.push(i);
        }

        // Dedup cache, then the store for the misses.
        let mut known: HashMap<String, bool> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();
        for &i in &to_check {
            let hash = &canonical[i].hash;
            match self.dedup.check(hash) {
                Some(exists) => {
                    known.insert(hash.clone(), exists);
                }
                None => misses.push(hash.clone()),
            }
        }

        if !misses.is_empty() {
            let live = self.queue.find_nonterminal_hashes(&misses).await?;
            let matched =
                batch_exists(self.store.as_ref(), collections::MATCHES, &misses).await?;
            for hash in &misses {
                let exists = live.contains(hash) || matched.contains(hash);
                known.insert(hash.clone(), exists);
            }
            self.dedup
                .set_many(known.iter().map(|(h, e)| (h.as_str(), *e)));
        }

        for i in to_check {
            let candidate = &batch[i];
            let canon = &canonical[i];

            if known.get(&canon.hash).copied().unwrap_or(false) {
                debug!(url = %canon.url, "candidate already known");
                self.record_rejection(candidate, canon, REASON_DUPLICATE)
                    .await?;
                outcomes[i] = Some(IngestOutcome::Skipped {
                    reason: REASON_DUPLICATE.to_string(),
                });
                continue;
            }

            // The website hint travels inside the scraped payload; the
            // pipeline reads it back during company resolution.
            let scraped_data = match (&candidate.scraped_data, &candidate.website) {
                (Some(data), Some(website)) => {
                    let mut data = data.clone();
                    if let Some(obj) = data.as_object_mut() {
                        obj.entry("website")
                            .or_insert_with(|| Value::String(website.clone()));
                    }
                    Some(data)
                }
                (Some(data), None) => Some(data.clone()),
                (None, Some(website)) => {
                    Some(serde_json::json!({ "website": website }))
                }
                (None, None) => None,
            };

            let new = NewItem {
                item_type: candidate.item_type,
                url: canon.url.clone(),
                url_hash: canon.hash.clone(),
                company_name: candidate
                    .company_name
                    .clone()
                    .or_else(|| {
                        let from_scrape = candidate.scraped_field("company_name");
                        (!from_scrape.is_empty()).then_some(from_scrape)
                    })
                    .unwrap_or_default(),
                source: candidate.source,
                submitted_by: candidate.submitted_by.clone(),
                scraped_data,
                max_retries: snapshot.queue.max_retries,
            };

            match self.queue.enqueue(new).await {
                Ok(item) => {
                    self.dedup.set(&canon.hash, true);
                    outcomes[i] = Some(IngestOutcome::Queued { id: item.id });
                }
                // Lost an ingest race; same answer as a dedup hit.
                Err(QueueError::Duplicate { .. }) => {
                    self.dedup.set(&canon.hash, true);
                    outcomes[i] = Some(IngestOutcome::Skipped {
                        reason: REASON_DUPLICATE.to_string(),
                    });
                }
                Err(QueueError::Store(e)) => return Err(e.into()),
            }
        }

        Ok(outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or(IngestOutcome::Skipped {
                    reason: "unprocessed".to_string(),
                })
            })
            .collect())
    }

    /// Keep a terminal SKIPPED row for rejected user-facing submissions so
    /// their fate can be queried later. Scraper rejections are routine and
    /// would flood the queue; they are only logged.
    async fn record_rejection(
        &self,
        candidate: &Candidate,
        canon: &urlnorm::CanonicalUrl,
        reason: &str,
    ) -> crate::error::Result<()> {
        if candidate.source == IngestSource::Scraper {
            return Ok(());
        }
        let snapshot = self.settings.current();
        self.queue
            .record_skipped(
                NewItem {
                    item_type: candidate.item_type,
                    url: canon.url.clone(),
                    url_hash: canon.hash.clone(),
                    company_name: candidate.company_name.clone().unwrap_or_default(),
                    source: candidate.source,
                    submitted_by: candidate.submitted_by.clone(),
                    scraped_data: candidate.scraped_data.clone(),
                    max_retries: snapshot.queue.max_retries,
                },
                reason,
            )
            .await?;
        Ok(())
    }
}
