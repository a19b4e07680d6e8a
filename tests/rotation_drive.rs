//! Rotation driver cycles: scraping through intake and health feedback.

#[allow(dead_code)]
mod helpers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use helpers::{FailingScraper, Harness, StaticScraper, StubEnrichment, source_record};
use jobflow::adapters::{JobDetail, RawJob, SourceScraper};
use jobflow::data::models::ItemStatus;
use jobflow::rotation::RotationService;
use jobflow::store::{Query, collections};

fn listing_scraper(urls: &[&str]) -> StaticScraper {
    StaticScraper {
        jobs: urls
            .iter()
            .map(|url| RawJob {
                url: url.to_string(),
                title: Some("Engineer".to_string()),
                company_name: Some("Acme".to_string()),
                description: Some("Rust work".to_string()),
                location: None,
            })
            .collect(),
        detail: JobDetail {
            title: None,
            description: "Rust work".to_string(),
            location: None,
        },
    }
}

fn service(h: &Harness, scrapers: HashMap<String, Arc<dyn SourceScraper>>) -> RotationService {
    RotationService::new(
        h.registry.clone(),
        h.queue.clone(),
        h.intake.clone(),
        h.settings.clone(),
        helpers::adapter_set(
            scrapers,
            Arc::new(StaticScraper::with_detail("Rust work")),
            Arc::new(StubEnrichment::ok()),
            Arc::new(helpers::ScriptedScorer::always(helpers::score_outcome(
                90.0,
                jobflow::data::models::MatchPriority::High,
            ))),
        ),
        Duration::from_secs(300),
        5,
    )
}

#[tokio::test]
async fn cycle_scrapes_sources_and_queues_jobs() {
    let h = Harness::new().await;
    h.registry
        .upsert(&source_record("src-1", "acme", "mock"))
        .await
        .unwrap();

    let mut scrapers: HashMap<String, Arc<dyn SourceScraper>> = HashMap::new();
    scrapers.insert(
        "mock".to_string(),
        Arc::new(listing_scraper(&[
            "https://example.com/jobs/1",
            "https://example.com/jobs/2",
        ])),
    );

    let driver = service(&h, scrapers);
    let queued = driver.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(queued, 2);

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 2);

    let source = h.registry.get("src-1").await.unwrap().unwrap();
    assert_eq!(source.success_count, 1);
    assert_eq!(source.total_jobs_found, 2);
    assert!(source.last_scraped_at.is_some());

    // A second cycle rediscovers the same postings; dedup keeps them out.
    let queued = driver.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(queued, 0);
    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
}

#[tokio::test]
async fn failed_scrape_lowers_health() {
    let h = Harness::new().await;
    h.registry
        .upsert(&source_record("src-bad", "acme", "mock"))
        .await
        .unwrap();

    let mut scrapers: HashMap<String, Arc<dyn SourceScraper>> = HashMap::new();
    scrapers.insert("mock".to_string(), Arc::new(FailingScraper));

    let driver = service(&h, scrapers);
    let queued = driver.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(queued, 0);

    let source = h.registry.get("src-bad").await.unwrap().unwrap();
    assert_eq!(source.failure_count, 1);
    assert!(source.health_score < 1.0);
}

#[tokio::test]
async fn unknown_kind_records_failure_instead_of_crashing() {
    let h = Harness::new().await;
    h.registry
        .upsert(&source_record("src-odd", "acme", "no-such-kind"))
        .await
        .unwrap();

    let driver = service(&h, HashMap::new());
    let queued = driver.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(queued, 0);

    let source = h.registry.get("src-odd").await.unwrap().unwrap();
    assert_eq!(source.failure_count, 1);
}

#[tokio::test]
async fn scraped_jobs_flow_to_terminal_skip_rows_only_for_user_sources() {
    // Rotation uses the scraper source; rejected duplicates must not pile
    // up as SKIPPED rows.
    let h = Harness::new().await;
    h.registry
        .upsert(&source_record("src-1", "acme", "mock"))
        .await
        .unwrap();

    let mut scrapers: HashMap<String, Arc<dyn SourceScraper>> = HashMap::new();
    scrapers.insert(
        "mock".to_string(),
        Arc::new(listing_scraper(&["https://example.com/jobs/1"])),
    );

    let driver = service(&h, scrapers);
    driver.run_cycle(&CancellationToken::new()).await.unwrap();
    driver.run_cycle(&CancellationToken::new()).await.unwrap();

    let items = h
        .store
        .query(collections::QUEUE, &Query::new())
        .await
        .unwrap();
    assert_eq!(items.len(), 1, "duplicate scrapes leave no extra rows");
    let status: ItemStatus =
        serde_json::from_value(items[0].data["status"].clone()).unwrap();
    assert_eq!(status, ItemStatus::Pending);
}
