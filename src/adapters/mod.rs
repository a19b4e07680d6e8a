//! Capability interfaces for the external adapters the core consumes:
//! scrapers, company enrichment, and the LLM scorer. Each has a small
//! method set and a closed set of error kinds; concrete variants are
//! selected through a `kind -> factory` registry.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::models::{
    Company, CompanySize, JobPosting, MatchPriority, SourceRecord,
};
use crate::error::ErrorKind;

/// A job discovered while scraping a source listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawJob {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Full detail for one posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("transient scrape failure: {0}")]
    Transient(String),
    #[error("source blocked the scraper: {0}")]
    Blocked(String),
    #[error("could not parse scrape response: {0}")]
    ParseFailed(String),
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::Transient(_) => ErrorKind::ScraperFailed,
            ScrapeError::Blocked(_) => ErrorKind::Blocked,
            ScrapeError::ParseFailed(_) => ErrorKind::ParseFailed,
        }
    }
}

/// Scrapes job listings for one source and individual postings by URL.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    async fn scrape(&self, source: &SourceRecord) -> Result<Vec<RawJob>, ScrapeError>;
    async fn scrape_job(&self, url: &str) -> Result<JobDetail, ScrapeError>;
}

/// Facts returned by the company enrichment adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culture: Option<String>,
    #[serde(default)]
    pub size: CompanySize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headquarters: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("transient enrichment failure: {0}")]
    Transient(String),
    #[error("enrichment response unusable: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait CompanyEnrichment: Send + Sync {
    async fn enrich(&self, name: &str, website: Option<&str>)
    -> Result<CompanyFacts, EnrichError>;
}

/// Scoring request assembled by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest<'a> {
    pub profile: &'a Value,
    pub job: &'a JobPosting,
    pub company: &'a Company,
    pub model: &'a str,
}

/// What the scorer returns for one posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreOutcome {
    pub score: f64,
    pub priority: MatchPriority,
    #[serde(default)]
    pub matched_skills: Vec<String>,
    #[serde(default)]
    pub missing_skills: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Dollar cost of this call, if the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error("scorer rate limited: {0}")]
    RateLimited(String),
    #[error("scorer timed out: {0}")]
    Timeout(String),
    #[error("scorer response invalid: {0}")]
    InvalidResponse(String),
}

impl ScoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScoreError::RateLimited(_) => ErrorKind::RateLimited,
            ScoreError::Timeout(_) | ScoreError::InvalidResponse(_) => ErrorKind::LlmFailed,
        }
    }
}

#[async_trait]
pub trait MatchScorer: Send + Sync {
    async fn score(&self, request: &ScoreRequest<'_>) -> Result<ScoreOutcome, ScoreError>;
}

/// Everything the pipeline and rotation driver need to reach the outside.
pub struct AdapterSet {
    pub scrapers: HashMap<String, Arc<dyn SourceScraper>>,
    /// Used for per-posting detail fetches where the source kind is unknown.
    pub detail: Arc<dyn SourceScraper>,
    pub enrichment: Arc<dyn CompanyEnrichment>,
    pub scorer: Arc<dyn MatchScorer>,
}

impl AdapterSet {
    pub fn scraper_for(&self, kind: &str) -> Option<&Arc<dyn SourceScraper>> {
        self.scrapers.get(kind)
    }
}

type ScraperFactory =
    Box<dyn Fn(&Value) -> anyhow::Result<Arc<dyn SourceScraper>> + Send + Sync>;

/// Maps scraper kinds to constructors; source records select by `kind`.
#[derive(Default)]
pub struct ScraperRegistry {
    factories: HashMap<String, ScraperFactory>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP scrapers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("greenhouse-board", |_| {
            Ok(Arc::new(http::GreenhouseBoardScraper::new()) as Arc<dyn SourceScraper>)
        });
        registry.register("careers-page", |_| {
            Ok(Arc::new(http::CareersPageScraper::new()) as Arc<dyn SourceScraper>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn SourceScraper>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn build(&self, kind: &str, config: &Value) -> anyhow::Result<Arc<dyn SourceScraper>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| anyhow::anyhow!("no scraper registered for kind {kind}"))?;
        factory(config)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate every registered kind with an empty config.
    pub fn build_all(&self) -> HashMap<String, Arc<dyn SourceScraper>> {
        self.factories
            .iter()
            .filter_map(|(kind, factory)| {
                factory(&Value::Null).ok().map(|s| (kind.clone(), s))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_error_kinds_map_to_taxonomy() {
        assert_eq!(
            ScrapeError::Transient("x".into()).kind(),
            ErrorKind::ScraperFailed
        );
        assert_eq!(ScrapeError::Blocked("x".into()).kind(), ErrorKind::Blocked);
        assert_eq!(
            ScrapeError::ParseFailed("x".into()).kind(),
            ErrorKind::ParseFailed
        );
    }

    #[test]
    fn score_error_kinds_map_to_taxonomy() {
        assert_eq!(
            ScoreError::RateLimited("x".into()).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(ScoreError::Timeout("x".into()).kind(), ErrorKind::LlmFailed);
    }

    #[test]
    fn builtin_registry_has_expected_kinds() {
        let registry = ScraperRegistry::builtin();
        let mut kinds = registry.kinds();
        kinds.sort();
        assert_eq!(kinds, vec!["careers-page", "greenhouse-board"]);
        assert!(registry.build("greenhouse-board", &Value::Null).is_ok());
        assert!(registry.build("rss", &Value::Null).is_err());
    }
}
