//! Source registry and per-source health tracking.
//!
//! One row per scraping endpoint. Health is an exponentially weighted
//! average over recent attempt outcomes (success = 1, failure = 0) clamped
//! to [0, 1]; the window is ~20 attempts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::data::models::SourceRecord;
use crate::store::{Collection, DocumentStore, Filter, Query, StoreError, collections};

/// Attempt window for the health average.
const HEALTH_WINDOW: f64 = 20.0;

/// Window for deriving per-company scrape rates.
const RATE_WINDOW_DAYS: i64 = 30;

fn health_step(current: f64, outcome: f64) -> f64 {
    let alpha = 2.0 / (HEALTH_WINDOW + 1.0);
    (current + alpha * (outcome - current)).clamp(0.0, 1.0)
}

pub struct SourceRegistry {
    sources: Collection<SourceRecord>,
}

impl SourceRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            sources: Collection::new(store, collections::SOURCES),
        }
    }

    pub async fn get(&self, source_id: &str) -> Result<Option<SourceRecord>, StoreError> {
        self.sources.get(source_id).await
    }

    pub async fn upsert(&self, record: &SourceRecord) -> Result<(), StoreError> {
        self.sources.put(&record.source_id, record).await
    }

    pub async fn list_enabled(&self) -> Result<Vec<SourceRecord>, StoreError> {
        self.sources
            .query(&Query::new().filter(Filter::Eq("enabled".into(), json!(true))))
            .await
    }

    /// Record a successful scrape: counters, timing, and health toward 1.
    pub async fn record_success(
        &self,
        source_id: &str,
        jobs_found: u64,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        let Some(mut record) = self.sources.get(source_id).await? else {
            warn!(source_id, "recording success for unknown source");
            return Ok(());
        };
        record.success_count += 1;
        record.total_jobs_found += jobs_found;
        record.last_scraped_at = Some(Utc::now());
        record.last_scrape_duration_ms = Some(duration_ms);
        record.health_score = health_step(record.health_score, 1.0);
        debug!(
            source_id,
            jobs_found,
            duration_ms,
            health = record.health_score,
            "scrape succeeded"
        );
        self.sources.put(source_id, &record).await
    }

    /// Record a failed scrape: counters and health toward 0.
    pub async fn record_failure(
        &self,
        source_id: &str,
        error_kind: &str,
    ) -> Result<(), StoreError> {
        let Some(mut record) = self.sources.get(source_id).await? else {
            warn!(source_id, "recording failure for unknown source");
            return Ok(());
        };
        record.failure_count += 1;
        record.last_scraped_at = Some(Utc::now());
        record.health_score = health_step(record.health_score, 0.0);
        warn!(
            source_id,
            error_kind,
            health = record.health_score,
            "scrape failed"
        );
        self.sources.put(source_id, &record).await
    }
}

/// Approximate scrapes/day per company over the rate window, derived from
/// each source's `last_scraped_at`. Used only as a fairness ordering input.
pub fn company_scrape_rates(
    sources: &[SourceRecord],
    now: DateTime<Utc>,
) -> HashMap<String, f64> {
    let window_start = now - Duration::days(RATE_WINDOW_DAYS);
    let mut rates: HashMap<String, f64> = HashMap::new();
    for source in sources {
        let scraped_recently = source
            .last_scraped_at
            .map(|at| at > window_start)
            .unwrap_or(false);
        if scraped_recently {
            *rates.entry(source.company_id.clone()).or_default() += 1.0 / RATE_WINDOW_DAYS as f64;
        }
    }
    rates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::Tier;
    use crate::store::memory::MemoryStore;
    use serde_json::Value;

    fn record(source_id: &str, company_id: &str) -> SourceRecord {
        SourceRecord {
            source_id: source_id.into(),
            company_id: company_id.into(),
            kind: "greenhouse-board".into(),
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

    #[test]
    fn health_moves_toward_outcome_and_clamps() {
        let mut h = 1.0;
        for _ in 0..200 {
            h = health_step(h, 0.0);
        }
        assert!(h >= 0.0 && h < 0.01);

        for _ in 0..200 {
            h = health_step(h, 1.0);
        }
        assert!(h > 0.99 && h <= 1.0);
    }

    #[test]
    fn one_failure_barely_dents_a_healthy_source() {
        let h = health_step(1.0, 0.0);
        assert!(h > 0.85);
    }

    #[tokio::test]
    async fn success_and_failure_update_counters() {
        let store = Arc::new(MemoryStore::new());
        let registry = SourceRegistry::new(store);
        registry.upsert(&record("s1", "acme")).await.unwrap();

        registry.record_success("s1", 12, 340).await.unwrap();
        registry.record_failure("s1", "NETWORK").await.unwrap();

        let updated = registry.get("s1").await.unwrap().unwrap();
        assert_eq!(updated.success_count, 1);
        assert_eq!(updated.failure_count, 1);
        assert_eq!(updated.total_jobs_found, 12);
        assert_eq!(updated.last_scrape_duration_ms, Some(340));
        assert!(updated.last_scraped_at.is_some());
        assert!(updated.health_score < 1.0);
    }

    #[tokio::test]
    async fn list_enabled_filters_disabled_sources() {
        let store = Arc::new(MemoryStore::new());
        let registry = SourceRegistry::new(store);
        registry.upsert(&record("s1", "acme")).await.unwrap();
        let mut disabled = record("s2", "acme");
        disabled.enabled = false;
        registry.upsert(&disabled).await.unwrap();

        let enabled = registry.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source_id, "s1");
    }

    #[test]
    fn scrape_rates_count_recent_sources_per_company() {
        let now = Utc::now();
        let mut a = record("s1", "acme");
        a.last_scraped_at = Some(now - Duration::hours(2));
        let mut b = record("s2", "acme");
        b.last_scraped_at = Some(now - Duration::days(40));
        let c = record("s3", "other");

        let rates = company_scrape_rates(&[a, b, c], now);
        assert!(rates["acme"] > 0.0);
        assert!(!rates.contains_key("other"));
    }
}
