//! Shared fixtures: an in-memory stack and scripted adapters.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use jobflow::adapters::{
    AdapterSet, CompanyEnrichment, CompanyFacts, EnrichError, JobDetail, MatchScorer, RawJob,
    ScoreError, ScoreOutcome, ScoreRequest, ScrapeError, SourceScraper,
};
use jobflow::data::models::{IngestSource, ItemType, MatchPriority, SourceRecord, Tier};
use jobflow::dedup::DedupCache;
use jobflow::ingest::{Candidate, IngestIntake};
use jobflow::pipeline::ItemPipeline;
use jobflow::queue::QueueManager;
use jobflow::settings::{
    AI_SETTINGS_DOC, QUEUE_SETTINGS_DOC, STOP_LIST_DOC, SettingsCache,
};
use jobflow::sources::SourceRegistry;
use jobflow::store::memory::MemoryStore;
use jobflow::store::{DocumentStore, collections};

/// The whole in-memory stack, wired the way the daemon wires it.
pub struct Harness {
    pub store: Arc<dyn DocumentStore>,
    pub queue: Arc<QueueManager>,
    pub dedup: Arc<DedupCache>,
    pub settings: Arc<SettingsCache>,
    pub intake: Arc<IngestIntake>,
    pub registry: Arc<SourceRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(json!({}), json!({}), json!({})).await
    }

    /// Build with explicit config documents (stop list, queue, ai).
    pub async fn with_config(stop_list: Value, queue_settings: Value, ai_settings: Value) -> Self {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store
            .put(collections::CONFIG, STOP_LIST_DOC, stop_list)
            .await
            .unwrap();
        store
            .put(collections::CONFIG, QUEUE_SETTINGS_DOC, queue_settings)
            .await
            .unwrap();
        store
            .put(collections::CONFIG, AI_SETTINGS_DOC, ai_settings)
            .await
            .unwrap();

        let settings = Arc::new(SettingsCache::new(store.clone()));
        settings.load().await.unwrap();

        let queue = Arc::new(QueueManager::new(store.clone()));
        let dedup = Arc::new(DedupCache::default());
        let intake = Arc::new(IngestIntake::new(
            queue.clone(),
            store.clone(),
            dedup.clone(),
            settings.clone(),
        ));
        let registry = Arc::new(SourceRegistry::new(store.clone()));

        Self {
            store,
            queue,
            dedup,
            settings,
            intake,
            registry,
        }
    }

    /// Rewrite an item's `created_at` so FIFO assertions are deterministic.
    pub async fn backdate(&self, item_id: &str, created_at: DateTime<Utc>) {
        let mut doc = self
            .store
            .get(collections::QUEUE, item_id)
            .await
            .unwrap()
            .expect("item must exist");
        doc["created_at"] = json!(created_at.timestamp_millis());
        self.store
            .put(collections::QUEUE, item_id, doc)
            .await
            .unwrap();
    }
}

pub fn webhook_candidate(url: &str) -> Candidate {
    Candidate {
        url: url.to_string(),
        company_name: None,
        website: None,
        source: IngestSource::Webhook,
        submitted_by: None,
        scraped_data: None,
        item_type: ItemType::Job,
    }
}

pub fn scraper_candidate(url: &str, company: &str, title: &str, description: &str) -> Candidate {
    Candidate {
        url: url.to_string(),
        company_name: Some(company.to_string()),
        website: None,
        source: IngestSource::Scraper,
        submitted_by: None,
        scraped_data: Some(json!({
            "title": title,
            "description": description,
            "company_name": company,
        })),
        item_type: ItemType::Job,
    }
}

pub fn source_record(source_id: &str, company_id: &str, kind: &str) -> SourceRecord {
    SourceRecord {
        source_id: source_id.to_string(),
        company_id: company_id.to_string(),
        kind: kind.to_string(),
        enabled: true,
        tier: Tier::B,
        config: Value::Null,
        last_scraped_at: None,
        last_scrape_duration_ms: None,
        success_count: 0,
        failure_count: 0,
        total_jobs_found: 0,
        health_score: 1.0,
    }
}

// ── Scripted adapters ───────────────────────────────────────────────

/// Scraper returning a fixed listing and a fixed detail document.
pub struct StaticScraper {
    pub jobs: Vec<RawJob>,
    pub detail: JobDetail,
}

impl StaticScraper {
    pub fn with_detail(description: &str) -> Self {
        Self {
            jobs: Vec::new(),
            detail: JobDetail {
                title: Some("Senior Engineer".to_string()),
                description: description.to_string(),
                location: Some("Remote".to_string()),
            },
        }
    }
}

#[async_trait]
impl SourceScraper for StaticScraper {
    async fn scrape(&self, _source: &SourceRecord) -> Result<Vec<RawJob>, ScrapeError> {
        Ok(self.jobs.clone())
    }

    async fn scrape_job(&self, _url: &str) -> Result<JobDetail, ScrapeError> {
        Ok(JobDetail {
            title: self.detail.title.clone(),
            description: self.detail.description.clone(),
            location: self.detail.location.clone(),
        })
    }
}

/// Scraper that always fails the same way.
pub struct FailingScraper;

#[async_trait]
impl SourceScraper for FailingScraper {
    async fn scrape(&self, _source: &SourceRecord) -> Result<Vec<RawJob>, ScrapeError> {
        Err(ScrapeError::Transient("connection reset".to_string()))
    }

    async fn scrape_job(&self, _url: &str) -> Result<JobDetail, ScrapeError> {
        Err(ScrapeError::Transient("connection reset".to_string()))
    }
}

/// Enrichment returning fixed facts, or an error when `fail` is set.
pub struct StubEnrichment {
    pub facts: CompanyFacts,
    pub fail: bool,
}

impl StubEnrichment {
    pub fn ok() -> Self {
        Self {
            facts: CompanyFacts {
                about: Some("Builds things".to_string()),
                ..Default::default()
            },
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            facts: CompanyFacts::default(),
            fail: true,
        }
    }
}

#[async_trait]
impl CompanyEnrichment for StubEnrichment {
    async fn enrich(
        &self,
        _name: &str,
        _website: Option<&str>,
    ) -> Result<CompanyFacts, EnrichError> {
        if self.fail {
            Err(EnrichError::Transient("enrichment service down".to_string()))
        } else {
            Ok(CompanyFacts {
                about: self.facts.about.clone(),
                mission: self.facts.mission.clone(),
                culture: self.facts.culture.clone(),
                size: self.facts.size,
                headquarters: self.facts.headquarters.clone(),
            })
        }
    }
}

pub fn score_outcome(score: f64, priority: MatchPriority) -> ScoreOutcome {
    ScoreOutcome {
        score,
        priority,
        matched_skills: vec!["rust".to_string()],
        missing_skills: vec![],
        keywords: vec!["backend".to_string()],
        reasoning: Some("fixture".to_string()),
        cost: Some(0.01),
    }
}

/// Scorer that replays a script of responses, then repeats the last one.
pub struct ScriptedScorer {
    script: Mutex<VecDeque<Result<ScoreOutcome, ScoreErrorKind>>>,
    fallback: ScoreOutcome,
}

/// Cloneable stand-in for ScoreError, which is not Clone.
#[derive(Clone, Copy)]
pub enum ScoreErrorKind {
    RateLimited,
    Timeout,
    InvalidResponse,
}

impl ScoreErrorKind {
    fn into_error(self) -> ScoreError {
        match self {
            ScoreErrorKind::RateLimited => ScoreError::RateLimited("scripted".to_string()),
            ScoreErrorKind::Timeout => ScoreError::Timeout("scripted".to_string()),
            ScoreErrorKind::InvalidResponse => {
                ScoreError::InvalidResponse("scripted".to_string())
            }
        }
    }
}

impl ScriptedScorer {
    pub fn always(outcome: ScoreOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
        }
    }

    pub fn script(
        steps: Vec<Result<ScoreOutcome, ScoreErrorKind>>,
        fallback: ScoreOutcome,
    ) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            fallback,
        }
    }
}

#[async_trait]
impl MatchScorer for ScriptedScorer {
    async fn score(&self, _request: &ScoreRequest<'_>) -> Result<ScoreOutcome, ScoreError> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(kind)) => Err(kind.into_error()),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Assemble an adapter set around the given pieces.
pub fn adapter_set(
    scrapers: HashMap<String, Arc<dyn SourceScraper>>,
    detail: Arc<dyn SourceScraper>,
    enrichment: Arc<dyn CompanyEnrichment>,
    scorer: Arc<dyn MatchScorer>,
) -> Arc<AdapterSet> {
    Arc::new(AdapterSet {
        scrapers,
        detail,
        enrichment,
        scorer,
    })
}

/// Pipeline wired against the harness with the given adapters.
pub fn pipeline_with(harness: &Harness, adapters: Arc<AdapterSet>) -> Arc<ItemPipeline> {
    Arc::new(ItemPipeline::new(
        harness.store.clone(),
        harness.queue.clone(),
        harness.settings.clone(),
        adapters,
        json!({"skills": ["rust", "distributed systems"]}),
    ))
}
