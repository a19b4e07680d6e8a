//! HTTP-backed adapter implementations.
//!
//! The Greenhouse scraper speaks the public Job Board API v1; the careers
//! page scraper expects a JSON listing endpoint. Enrichment and scoring
//! POST to configured service endpoints with strict JSON contracts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    CompanyEnrichment, CompanyFacts, EnrichError, JobDetail, MatchScorer, RawJob, ScoreError,
    ScoreOutcome, ScoreRequest, ScrapeError, SourceScraper,
};
use crate::data::models::SourceRecord;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCORER_TIMEOUT: Duration = Duration::from_secs(120);

fn default_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("jobflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

fn scrape_status_error(status: StatusCode, context: &str) -> ScrapeError {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        ScrapeError::Blocked(format!("{context}: HTTP {status}"))
    } else {
        ScrapeError::Transient(format!("{context}: HTTP {status}"))
    }
}

// ── Greenhouse Job Board API v1 ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GreenhouseLocation {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseJob {
    title: String,
    #[serde(default)]
    absolute_url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    location: Option<GreenhouseLocation>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseBoardResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    jobs: Vec<GreenhouseJob>,
}

pub struct GreenhouseBoardScraper {
    client: reqwest::Client,
}

impl Default for GreenhouseBoardScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl GreenhouseBoardScraper {
    pub fn new() -> Self {
        Self {
            client: default_client(HTTP_TIMEOUT),
        }
    }

    fn board_token(source: &SourceRecord) -> Result<String, ScrapeError> {
        source
            .config
            .get("board_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ScrapeError::ParseFailed(format!(
                    "source {} has no board_token in config",
                    source.source_id
                ))
            })
    }
}

#[async_trait]
impl SourceScraper for GreenhouseBoardScraper {
    async fn scrape(&self, source: &SourceRecord) -> Result<Vec<RawJob>, ScrapeError> {
        let token = Self::board_token(source)?;
        let url = format!(
            "https://boards-api.greenhouse.io/v1/boards/{token}/jobs?content=true"
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ScrapeError::Transient(e.to_string()))?;

        // A vanished board is an empty listing, not a failure.
        if response.status() == StatusCode::NOT_FOUND {
            debug!(board = token, "greenhouse board returned 404, skipping");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(scrape_status_error(response.status(), "greenhouse board"));
        }

        let board: GreenhouseBoardResponse = response
            .json()
            .await
            .map_err(|e| ScrapeError::ParseFailed(e.to_string()))?;

        let company_name = board.name;
        Ok(board
            .jobs
            .into_iter()
            .filter_map(|job| {
                job.absolute_url.map(|url| RawJob {
                    url,
                    title: Some(job.title),
                    company_name: company_name.clone(),
                    description: job.content,
                    location: job.location.and_then(|l| l.name),
                })
            })
            .collect())
    }

    async fn scrape_job(&self, url: &str) -> Result<JobDetail, ScrapeError> {
        fetch_job_detail(&self.client, url).await
    }
}

// ── Generic JSON careers page ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CareersListingJob {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

/// Scrapes a configured endpoint that serves its openings as a JSON array.
pub struct CareersPageScraper {
    client: reqwest::Client,
}

impl Default for CareersPageScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl CareersPageScraper {
    pub fn new() -> Self {
        Self {
            client: default_client(HTTP_TIMEOUT),
        }
    }
}

#[async_trait]
impl SourceScraper for CareersPageScraper {
    async fn scrape(&self, source: &SourceRecord) -> Result<Vec<RawJob>, ScrapeError> {
        let endpoint = source
            .config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ScrapeError::ParseFailed(format!(
                    "source {} has no url in config",
                    source.source_id
                ))
            })?;

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| ScrapeError::Transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(scrape_status_error(response.status(), "careers page"));
        }

        let jobs: Vec<CareersListingJob> = response
            .json()
            .await
            .map_err(|e| ScrapeError::ParseFailed(e.to_string()))?;

        Ok(jobs
            .into_iter()
            .map(|job| RawJob {
                url: job.url,
                title: job.title,
                company_name: job.company_name,
                description: job.description,
                location: job.location,
            })
            .collect())
    }

    async fn scrape_job(&self, url: &str) -> Result<JobDetail, ScrapeError> {
        fetch_job_detail(&self.client, url).await
    }
}

/// Fetch one posting. A JSON body is decoded as a detail document; anything
/// else is taken as the posting text.
async fn fetch_job_detail(client: &reqwest::Client, url: &str) -> Result<JobDetail, ScrapeError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ScrapeError::Transient(e.to_string()))?;
    if !response.status().is_success() {
        return Err(scrape_status_error(response.status(), "job detail"));
    }

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false);

    if is_json {
        response
            .json()
            .await
            .map_err(|e| ScrapeError::ParseFailed(e.to_string()))
    } else {
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::Transient(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(ScrapeError::ParseFailed("empty job detail body".into()));
        }
        Ok(JobDetail {
            title: None,
            description: body,
            location: None,
        })
    }
}

// ── Enrichment service client ───────────────────────────────────────

pub struct HttpEnrichment {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEnrichment {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: default_client(HTTP_TIMEOUT),
            endpoint,
        }
    }
}

#[async_trait]
impl CompanyEnrichment for HttpEnrichment {
    async fn enrich(
        &self,
        name: &str,
        website: Option<&str>,
    ) -> Result<CompanyFacts, EnrichError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "name": name, "website": website }))
            .send()
            .await
            .map_err(|e| EnrichError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EnrichError::Transient(format!(
                "enrichment: HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| EnrichError::InvalidResponse(e.to_string()))
    }
}

/// Scorer placeholder for roles that never score (the rotation driver).
pub struct UnconfiguredScorer;

#[async_trait]
impl MatchScorer for UnconfiguredScorer {
    async fn score(&self, _request: &ScoreRequest<'_>) -> Result<ScoreOutcome, ScoreError> {
        Err(ScoreError::InvalidResponse(
            "no scorer endpoint configured".into(),
        ))
    }
}

/// Enrichment that reports nothing; used when no endpoint is configured.
pub struct NoEnrichment;

#[async_trait]
impl CompanyEnrichment for NoEnrichment {
    async fn enrich(
        &self,
        _name: &str,
        _website: Option<&str>,
    ) -> Result<CompanyFacts, EnrichError> {
        Ok(CompanyFacts::default())
    }
}

// ── Scorer service client ───────────────────────────────────────────

pub struct HttpScorer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScorer {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: default_client(SCORER_TIMEOUT),
            endpoint,
        }
    }
}

#[async_trait]
impl MatchScorer for HttpScorer {
    async fn score(&self, request: &ScoreRequest<'_>) -> Result<ScoreOutcome, ScoreError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScoreError::Timeout(e.to_string())
                } else {
                    ScoreError::Timeout(format!("scorer unreachable: {e}"))
                }
            })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ScoreError::RateLimited("scorer returned 429".into()));
            }
            status if !status.is_success() => {
                return Err(ScoreError::InvalidResponse(format!(
                    "scorer: HTTP {status}"
                )));
            }
            _ => {}
        }

        let outcome: ScoreOutcome = response
            .json()
            .await
            .map_err(|e| ScoreError::InvalidResponse(e.to_string()))?;

        if !(0.0..=100.0).contains(&outcome.score) {
            return Err(ScoreError::InvalidResponse(format!(
                "score {} out of range",
                outcome.score
            )));
        }
        Ok(outcome)
    }
}
