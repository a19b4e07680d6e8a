//! Per-item pipeline: company resolution, detail scrape, stop-list
//! recheck, scoring, and match persistence.
//!
//! Every stage returns a tagged outcome instead of raising through the
//! stack; the worker dispatches on the tag. Matches resolve write
//! conflicts with "strictly higher score wins, newer result wins ties",
//! enforced by a guarded conditional update.

use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::adapters::{AdapterSet, CompanyFacts, JobDetail, ScoreRequest};
use crate::data::company::{company_slug, mark_analyzed, merge_company, minimal_company, website_host};
use crate::data::models::{
    AnalysisStatus, Company, CompanySnapshot, ItemType, JobMatch, JobPosting, QueueItem,
};
use crate::error::ErrorKind;
use crate::queue::QueueManager;
use crate::settings::SettingsCache;
use crate::store::{Collection, Cond, DocumentStore, StoreError, collections};

/// Attempts at the guarded match write before giving up on the race.
const MATCH_WRITE_ATTEMPTS: usize = 4;

pub const REASON_BELOW_THRESHOLD: &str = "below_threshold";

/// How one pipeline run ended. The worker maps this onto the queue's
/// complete/release operations.
#[derive(Debug)]
pub enum StageOutcome {
    Success(String),
    Skip(String),
    Retry(ErrorKind, String),
    Terminal(ErrorKind, String),
}

/// Tracks scoring spend against the daily budget. Counter only; resets at
/// UTC midnight.
pub struct DailyBudget {
    inner: Mutex<(NaiveDate, f64)>,
}

impl Default for DailyBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl DailyBudget {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((Utc::now().date_naive(), 0.0)),
        }
    }

    fn roll(&self) -> std::sync::MutexGuard<'_, (NaiveDate, f64)> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let today = Utc::now().date_naive();
        if guard.0 != today {
            *guard = (today, 0.0);
        }
        guard
    }

    pub fn spent_today(&self) -> f64 {
        self.roll().1
    }

    pub fn exhausted(&self, budget: f64) -> bool {
        budget > 0.0 && self.spent_today() >= budget
    }

    pub fn record(&self, cost: f64) {
        let mut guard = self.roll();
        guard.1 += cost.max(0.0);
    }
}

pub struct ItemPipeline {
    companies: Collection<Company>,
    matches: Collection<JobMatch>,
    queue: Arc<QueueManager>,
    settings: Arc<SettingsCache>,
    adapters: Arc<AdapterSet>,
    profile: Value,
    budget: Arc<DailyBudget>,
}

impl ItemPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Arc<QueueManager>,
        settings: Arc<SettingsCache>,
        adapters: Arc<AdapterSet>,
        profile: Value,
    ) -> Self {
        Self {
            companies: Collection::new(store.clone(), collections::COMPANIES),
            matches: Collection::new(store, collections::MATCHES),
            queue,
            settings,
            adapters,
            profile,
            budget: Arc::new(DailyBudget::new()),
        }
    }

    pub fn budget(&self) -> &Arc<DailyBudget> {
        &self.budget
    }

    /// Run the full pipeline for one claimed item.
    pub async fn run(&self, item: &QueueItem) -> StageOutcome {
        match item.item_type {
            ItemType::Company => self.run_company(item).await,
            ItemType::Job => self.run_job(item).await,
        }
    }

    async fn run_company(&self, item: &QueueItem) -> StageOutcome {
        match self.resolve_company(item).await {
            Ok(company) => StageOutcome::Success(format!("company {} resolved", company.slug)),
            Err(outcome) => outcome,
        }
    }

    async fn run_job(&self, item: &QueueItem) -> StageOutcome {
        let snapshot = self.settings.current();

        // 1. Resolve or create the company record.
        let company = match self.resolve_company(item).await {
            Ok(company) => company,
            Err(outcome) => return outcome,
        };

        // 2. Fetch full detail when the scraped payload is sparse.
        let detail = match self.ensure_detail(item).await {
            Ok(detail) => detail,
            Err(outcome) => return outcome,
        };

        let posting = build_posting(item, &company, &detail);

        // 3. Re-check the stop list against the enriched text.
        let host = url::Url::parse(&item.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if let Some(stop) = snapshot.stop_list.is_excluded(
            &posting.company_name,
            &posting.title,
            &posting.description,
            &host,
        ) {
            return StageOutcome::Skip(stop.reason().to_string());
        }

        // 4. Score against the profile, under the daily budget.
        if self.budget.exhausted(snapshot.ai.daily_cost_budget) {
            return StageOutcome::Retry(
                ErrorKind::RateLimited,
                format!(
                    "daily scoring budget {:.2} exhausted",
                    snapshot.ai.daily_cost_budget
                ),
            );
        }

        let request = ScoreRequest {
            profile: &self.profile,
            job: &posting,
            company: &company,
            model: &snapshot.ai.model,
        };
        let outcome = match self.adapters.scorer.score(&request).await {
            Ok(outcome) => outcome,
            Err(e) => return StageOutcome::Retry(e.kind(), e.to_string()),
        };
        self.budget
            .record(outcome.cost.unwrap_or(snapshot.ai.estimated_call_cost));

        // 5. Threshold.
        if outcome.score < snapshot.ai.min_match_score {
            debug!(
                item_id = %item.id,
                score = outcome.score,
                threshold = snapshot.ai.min_match_score,
                "score below threshold"
            );
            return StageOutcome::Skip(REASON_BELOW_THRESHOLD.to_string());
        }

        // 6. Persist the match.
        let job_match = JobMatch {
            url_hash: item.url_hash.clone(),
            url: item.url.clone(),
            title: posting.title.clone(),
            company: CompanySnapshot::from(&company),
            score: outcome.score,
            priority: outcome.priority,
            matched_skills: outcome.matched_skills,
            missing_skills: outcome.missing_skills,
            keywords: outcome.keywords,
            reasoning: outcome.reasoning,
            source: item.source,
            item_id: item.id.clone(),
            scored_at: Utc::now(),
        };

        match self.write_match(job_match).await {
            Ok(written) => {
                let message = if written {
                    format!("matched with score {:.0}", outcome.score)
                } else {
                    "existing match retained (higher score)".to_string()
                };
                info!(item_id = %item.id, score = outcome.score, written, "job scored");
                StageOutcome::Success(message)
            }
            Err(outcome) => outcome,
        }
    }

    /// Resolve the item's company by slug, creating and enriching it on
    /// first sight. Enrichment failures degrade to a minimal FAILED record
    /// rather than blocking the item.
    async fn resolve_company(&self, item: &QueueItem) -> Result<Company, StageOutcome> {
        let scraped = |name: &str| -> Option<String> {
            item.scraped_data
                .as_ref()
                .and_then(|d| d.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        if let Some(company_id) = &item.company_id {
            match self.companies.get(company_id).await {
                Ok(Some(company)) => return Ok(company),
                Ok(None) => {}
                Err(e) => return Err(store_outcome(e)),
            }
        }

        let website = scraped("website").or_else(|| {
            // A careers URL on the company's own site doubles as a website hint.
            website_host(&item.url).map(|h| format!("https://{h}"))
        });
        let name = if item.company_name.is_empty() {
            scraped("company_name")
                .filter(|n| !n.is_empty())
                .or_else(|| website_host(&item.url))
                .unwrap_or_else(|| "unknown".to_string())
        } else {
            item.company_name.clone()
        };

        let slug = company_slug(&name, website.as_deref());

        match self.companies.get(&slug).await {
            Ok(Some(existing)) => {
                let _ = self.queue.set_company(&item.id, &slug).await;
                return Ok(existing);
            }
            Ok(None) => {}
            Err(e) => return Err(store_outcome(e)),
        }

        // First sight: reserve the slug, then enrich.
        let mut company = minimal_company(&slug, &name, website.as_deref());
        company.analysis_status = AnalysisStatus::Analyzing;
        match self.companies.insert(&slug, &company).await {
            Ok(()) => {}
            Err(StoreError::Precondition { .. }) => {
                // Another pipeline created it first.
                match self.companies.get(&slug).await {
                    Ok(Some(existing)) => {
                        let _ = self.queue.set_company(&item.id, &slug).await;
                        return Ok(existing);
                    }
                    Ok(None) => {}
                    Err(e) => return Err(store_outcome(e)),
                }
            }
            Err(e) => return Err(store_outcome(e)),
        }

        let snapshot = self.settings.current();
        let enriched = tokio::time::timeout(
            snapshot.queue.company_analysis_timeout(),
            self.adapters.enrichment.enrich(&name, website.as_deref()),
        )
        .await;

        let company = match enriched {
            Ok(Ok(facts)) => {
                let enriched = apply_facts(company.clone(), facts);
                mark_analyzed(enriched, AnalysisStatus::Complete)
            }
            Ok(Err(e)) => {
                warn!(slug = %slug, error = %e, "company enrichment failed, proceeding minimal");
                mark_analyzed(company, AnalysisStatus::Failed)
            }
            Err(_) => {
                warn!(slug = %slug, "company enrichment timed out, proceeding minimal");
                mark_analyzed(company, AnalysisStatus::Failed)
            }
        };

        // Field-level merge so a racing writer's facts are never clobbered
        // by our empties.
        let merged = match self.companies.get(&slug).await {
            Ok(Some(current)) => merge_company(&current, &company),
            Ok(None) => company,
            Err(e) => return Err(store_outcome(e)),
        };
        if let Err(e) = self.companies.put(&slug, &merged).await {
            return Err(store_outcome(e));
        }

        let _ = self.queue.set_company(&item.id, &slug).await;
        Ok(merged)
    }

    /// Use the scraped payload when it already carries a description;
    /// otherwise fetch the posting.
    async fn ensure_detail(&self, item: &QueueItem) -> Result<JobDetail, StageOutcome> {
        let scraped = item.scraped_data.as_ref();
        let existing_description = scraped
            .and_then(|d| d.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if !existing_description.trim().is_empty() {
            return Ok(JobDetail {
                title: scraped
                    .and_then(|d| d.get("title"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                description: existing_description.to_string(),
                location: scraped
                    .and_then(|d| d.get("location"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        match self.adapters.detail.scrape_job(&item.url).await {
            Ok(detail) => Ok(detail),
            Err(e) => Err(StageOutcome::Retry(e.kind(), e.to_string())),
        }
    }

    /// Guarded write keyed by `url_hash`: strictly higher score wins; an
    /// equal score keeps the newer result. Returns whether our result was
    /// written.
    async fn write_match(&self, job_match: JobMatch) -> Result<bool, StageOutcome> {
        for _ in 0..MATCH_WRITE_ATTEMPTS {
            let existing = match self.matches.get(&job_match.url_hash).await {
                Ok(existing) => existing,
                Err(e) => return Err(store_outcome(e)),
            };

            match existing {
                None => match self.matches.insert(&job_match.url_hash, &job_match).await {
                    Ok(()) => return Ok(true),
                    Err(StoreError::Precondition { .. }) => continue,
                    Err(e) => return Err(store_outcome(e)),
                },
                Some(current) => {
                    let wins = job_match.score > current.score
                        || (job_match.score == current.score
                            && job_match.scored_at > current.scored_at);
                    if !wins {
                        return Ok(false);
                    }
                    match self
                        .matches
                        .update_if(
                            &job_match.url_hash,
                            &[Cond::Eq("score".into(), json!(current.score))],
                            &job_match,
                        )
                        .await
                    {
                        Ok(()) => return Ok(true),
                        Err(StoreError::Precondition { .. })
                        | Err(StoreError::NotFound { .. }) => continue,
                        Err(e) => return Err(store_outcome(e)),
                    }
                }
            }
        }

        Err(StageOutcome::Retry(
            ErrorKind::StorageTransient,
            "match write contention".to_string(),
        ))
    }
}

fn store_outcome(e: StoreError) -> StageOutcome {
    match e {
        StoreError::Transient(_) => StageOutcome::Retry(ErrorKind::StorageTransient, e.to_string()),
        StoreError::Precondition { .. } | StoreError::Decode { .. } => {
            StageOutcome::Terminal(ErrorKind::StoragePrecondition, e.to_string())
        }
        StoreError::NotFound { .. } => {
            StageOutcome::Retry(ErrorKind::StorageTransient, e.to_string())
        }
    }
}

fn apply_facts(mut company: Company, facts: CompanyFacts) -> Company {
    company.about = facts.about.or(company.about);
    company.mission = facts.mission.or(company.mission);
    company.culture = facts.culture.or(company.culture);
    company.headquarters = facts.headquarters.or(company.headquarters);
    if facts.size != crate::data::models::CompanySize::Unknown {
        company.size = facts.size;
    }
    company
}

fn build_posting(item: &QueueItem, company: &Company, detail: &JobDetail) -> JobPosting {
    let scraped_title = item
        .scraped_data
        .as_ref()
        .and_then(|d| d.get("title"))
        .and_then(Value::as_str)
        .map(str::to_string);

    JobPosting {
        url: item.url.clone(),
        title: detail
            .title
            .clone()
            .or(scraped_title)
            .unwrap_or_else(|| item.url.clone()),
        company_name: if item.company_name.is_empty() {
            company.name.clone()
        } else {
            item.company_name.clone()
        },
        description: detail.description.clone(),
        location: detail.location.clone(),
    }
}
