//! Serde models for the document collections.
//!
//! Queue timestamps are serialized as epoch milliseconds so the store can
//! order them numerically; everything else round-trips through serde_json.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// What a queue item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    Job,
    Company,
}

/// Queue item state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Success | ItemStatus::Skipped | ItemStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::Processing => "PROCESSING",
            ItemStatus::Success => "SUCCESS",
            ItemStatus::Skipped => "SKIPPED",
            ItemStatus::Failed => "FAILED",
        }
    }
}

/// Where a candidate URL entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestSource {
    Scraper,
    UserSubmission,
    Webhook,
    Email,
}

/// The most recent failure recorded on a queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// A durable work item in the `job-queue` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub status: ItemStatus,
    pub url: String,
    pub url_hash: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    pub source: IngestSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_data: Option<Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_message: Option<String>,
}

/// Company size buckets from enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompanySize {
    Large,
    Medium,
    Small,
    #[default]
    Unknown,
}

/// Coarse quality bucket for companies and sources, ordering input only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Tier {
    S,
    A,
    #[default]
    B,
    C,
    D,
}

impl Tier {
    /// Rank for scheduling: S sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Tier::S => 0,
            Tier::A => 1,
            Tier::B => 2,
            Tier::C => 3,
            Tier::D => 4,
        }
    }
}

/// Company analysis lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Analyzing,
    Complete,
    Failed,
}

/// A company record in the `companies` collection, keyed by slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub slug: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
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
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub priority_score: f64,
    #[serde(default)]
    pub analysis_status: AnalysisStatus,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub analyzed_at: Option<DateTime<Utc>>,
}

/// One scraping endpoint in the `job-sources` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub company_id: String,
    /// Adapter kind, e.g. "greenhouse-board", "rss", "careers-page".
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tier: Tier,
    /// Adapter-specific configuration (board token, feed URL, ...).
    #[serde(default)]
    pub config: Value,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_scraped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scrape_duration_ms: Option<i64>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub total_jobs_found: u64,
    /// Running quality estimate in [0, 1].
    #[serde(default = "default_health")]
    pub health_score: f64,
}

fn default_health() -> f64 {
    1.0
}

/// Match priority tag from the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchPriority {
    High,
    Medium,
    Low,
}

/// Denormalized company fields embedded in a match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanySnapshot {
    pub slug: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub size: CompanySize,
    #[serde(default)]
    pub tier: Tier,
}

impl From<&Company> for CompanySnapshot {
    fn from(company: &Company) -> Self {
        Self {
            slug: company.slug.clone(),
            name: company.name.clone(),
            website: company.website.clone(),
            size: company.size,
            tier: company.tier,
        }
    }
}

/// A persisted scoring result in `job-matches`, keyed by `url_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMatch {
    pub url_hash: String,
    pub url: String,
    pub title: String,
    pub company: CompanySnapshot,
    /// Match score in [0, 100].
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
    pub source: IngestSource,
    /// The queue item that produced this match.
    pub item_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scored_at: DateTime<Utc>,
}

/// The posting handed to the scorer after enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPosting {
    pub url: String,
    pub title: String,
    pub company_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}
