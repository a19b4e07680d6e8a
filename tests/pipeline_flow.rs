//! End-to-end pipeline behavior over the in-memory stack: retries, scoring,
//! thresholds, match conflicts, and company enrichment.

#[allow(dead_code)]
mod helpers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use helpers::{
    Harness, ScriptedScorer, ScoreErrorKind, StaticScraper, StubEnrichment, adapter_set,
    pipeline_with, score_outcome, scraper_candidate, webhook_candidate,
};
use jobflow::data::models::{
    AnalysisStatus, Company, IngestSource, ItemStatus, ItemType, JobMatch, MatchPriority,
};
use jobflow::ingest::{Candidate, IngestOutcome};
use jobflow::pipeline::ItemPipeline;
use jobflow::store::collections;
use jobflow::worker::drain_once;
use tokio_util::sync::CancellationToken;

const LEASE: Duration = Duration::from_secs(300);

fn default_adapters(scorer: ScriptedScorer) -> Arc<jobflow::adapters::AdapterSet> {
    adapter_set(
        HashMap::new(),
        Arc::new(StaticScraper::with_detail(
            "We need a senior Rust engineer for distributed systems work.",
        )),
        Arc::new(StubEnrichment::ok()),
        Arc::new(scorer),
    )
}

async fn run_one_batch(h: &Harness, pipeline: &ItemPipeline) -> usize {
    drain_once(
        &h.queue,
        pipeline,
        10,
        LEASE,
        4,
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}

async fn get_match(h: &Harness, url: &str) -> Option<JobMatch> {
    let hash = jobflow::urlnorm::canonicalize(url).hash;
    h.store
        .get(collections::MATCHES, &hash)
        .await
        .unwrap()
        .map(|v| serde_json::from_value(v).unwrap())
}

#[tokio::test]
async fn scorer_failure_retries_then_succeeds() {
    let h = Harness::new().await;
    let pipeline = pipeline_with(
        &h,
        default_adapters(ScriptedScorer::script(
            vec![
                Err(ScoreErrorKind::Timeout),
                Ok(score_outcome(88.0, MatchPriority::High)),
            ],
            score_outcome(88.0, MatchPriority::High),
        )),
    );

    let url = "https://example.com/jobs/42";
    let IngestOutcome::Queued { id } = h
        .intake
        .submit(scraper_candidate(url, "Acme", "Engineer", "Rust work"))
        .await
        .unwrap()
    else {
        panic!("expected queued");
    };

    // Attempt 1: the scorer times out; the item is released for retry.
    assert_eq!(run_one_batch(&h, &pipeline).await, 1);
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.retry_count, 1);

    // Attempt 2 succeeds and writes the match.
    assert_eq!(run_one_batch(&h, &pipeline).await, 1);
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Success);
    assert_eq!(item.retry_count, 1);

    let job_match = get_match(&h, url).await.expect("match written");
    assert_eq!(job_match.score, 88.0);
    assert_eq!(job_match.priority, MatchPriority::High);
    assert_eq!(job_match.item_id, id);
}

#[tokio::test]
async fn below_threshold_skips_without_match() {
    let h = Harness::with_config(json!({}), json!({}), json!({"minMatchScore": 75.0})).await;
    let pipeline = pipeline_with(
        &h,
        default_adapters(ScriptedScorer::always(score_outcome(
            60.0,
            MatchPriority::Low,
        ))),
    );

    let url = "https://example.com/jobs/low";
    let IngestOutcome::Queued { id } = h
        .intake
        .submit(scraper_candidate(url, "Acme", "Engineer", "desc"))
        .await
        .unwrap()
    else {
        panic!("expected queued");
    };

    run_one_batch(&h, &pipeline).await;
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Skipped);
    assert_eq!(item.result_message.as_deref(), Some("below_threshold"));
    assert!(get_match(&h, url).await.is_none());
}

#[tokio::test]
async fn enriched_description_can_trip_the_stop_list() {
    // The scraped payload passes intake, but the detail fetch reveals a
    // stop-listed keyword.
    let h = Harness::with_config(
        json!({"excludedKeywords": ["gambling"]}),
        json!({}),
        json!({}),
    )
    .await;
    let adapters = adapter_set(
        HashMap::new(),
        Arc::new(StaticScraper::with_detail(
            "High-volume gambling platform work.",
        )),
        Arc::new(StubEnrichment::ok()),
        Arc::new(ScriptedScorer::always(score_outcome(
            90.0,
            MatchPriority::High,
        ))),
    );
    let pipeline = pipeline_with(&h, adapters);

    let url = "https://example.com/jobs/hidden";
    let IngestOutcome::Queued { id } = h
        .intake
        .submit(webhook_candidate(url))
        .await
        .unwrap()
    else {
        panic!("expected queued");
    };

    run_one_batch(&h, &pipeline).await;
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Skipped);
    assert_eq!(
        item.result_message.as_deref(),
        Some("stop_listed:keyword")
    );
    assert!(get_match(&h, url).await.is_none());
}

#[tokio::test]
async fn higher_score_wins_match_conflicts() {
    let h = Harness::new().await;
    let url = "https://example.com/jobs/contested";
    let hash = jobflow::urlnorm::canonicalize(url).hash;

    // A previous pipeline left a weaker match behind.
    h.store
        .put(
            collections::MATCHES,
            &hash,
            serde_json::to_value(JobMatch {
                url_hash: hash.clone(),
                url: url.to_string(),
                title: "Old".to_string(),
                company: jobflow::data::models::CompanySnapshot {
                    slug: "acme".to_string(),
                    name: "Acme".to_string(),
                    website: None,
                    size: Default::default(),
                    tier: Default::default(),
                },
                score: 72.0,
                priority: MatchPriority::Low,
                matched_skills: vec![],
                missing_skills: vec![],
                keywords: vec![],
                reasoning: None,
                source: IngestSource::Scraper,
                item_id: "old-item".to_string(),
                scored_at: chrono::Utc::now() - chrono::Duration::hours(1),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let pipeline = pipeline_with(
        &h,
        default_adapters(ScriptedScorer::always(score_outcome(
            88.0,
            MatchPriority::High,
        ))),
    );

    // Enqueue directly: intake would treat the existing match as a dup.
    let item = h
        .queue
        .enqueue(jobflow::queue::NewItem {
            item_type: ItemType::Job,
            url: url.to_string(),
            url_hash: hash.clone(),
            company_name: "Acme".to_string(),
            source: IngestSource::Scraper,
            submitted_by: None,
            scraped_data: Some(json!({"title": "Engineer", "description": "Rust"})),
            max_retries: 3,
        })
        .await
        .unwrap();

    run_one_batch(&h, &pipeline).await;
    let stored = h.queue.get(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Success);

    let job_match = get_match(&h, url).await.unwrap();
    assert_eq!(job_match.score, 88.0, "higher score replaces the old match");
    assert_eq!(job_match.item_id, item.id);
}

#[tokio::test]
async fn lower_score_keeps_existing_match() {
    let h = Harness::new().await;
    let url = "https://example.com/jobs/strong";
    let hash = jobflow::urlnorm::canonicalize(url).hash;

    h.store
        .put(
            collections::MATCHES,
            &hash,
            json!({
                "url_hash": hash,
                "url": url,
                "title": "Strong",
                "company": {"slug": "acme", "name": "Acme"},
                "score": 95.0,
                "priority": "HIGH",
                "source": "SCRAPER",
                "item_id": "old-item",
                "scored_at": chrono::Utc::now().timestamp_millis(),
            }),
        )
        .await
        .unwrap();

    let pipeline = pipeline_with(
        &h,
        default_adapters(ScriptedScorer::always(score_outcome(
            80.0,
            MatchPriority::Medium,
        ))),
    );

    let item = h
        .queue
        .enqueue(jobflow::queue::NewItem {
            item_type: ItemType::Job,
            url: url.to_string(),
            url_hash: hash.clone(),
            company_name: "Acme".to_string(),
            source: IngestSource::Scraper,
            submitted_by: None,
            scraped_data: Some(json!({"title": "Engineer", "description": "Rust"})),
            max_retries: 3,
        })
        .await
        .unwrap();

    run_one_batch(&h, &pipeline).await;
    // The item still succeeds; the stronger match simply survives.
    let stored = h.queue.get(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ItemStatus::Success);

    let job_match = get_match(&h, url).await.unwrap();
    assert_eq!(job_match.score, 95.0);
    assert_eq!(job_match.item_id, "old-item");
}

#[tokio::test]
async fn company_is_created_and_enriched() {
    let h = Harness::new().await;
    let pipeline = pipeline_with(
        &h,
        default_adapters(ScriptedScorer::always(score_outcome(
            85.0,
            MatchPriority::Medium,
        ))),
    );

    let mut candidate = scraper_candidate(
        "https://example.com/jobs/1",
        "Acme Corp",
        "Engineer",
        "Rust things",
    );
    candidate.website = Some("https://www.acme.io".to_string());
    candidate.source = IngestSource::Webhook;
    let IngestOutcome::Queued { id } = h.intake.submit(candidate).await.unwrap() else {
        panic!("expected queued");
    };

    run_one_batch(&h, &pipeline).await;

    let company: Company = serde_json::from_value(
        h.store
            .get(collections::COMPANIES, "acme-corp--acme.io")
            .await
            .unwrap()
            .expect("company created"),
    )
    .unwrap();
    assert_eq!(company.analysis_status, AnalysisStatus::Complete);
    assert_eq!(company.about.as_deref(), Some("Builds things"));
    assert!(company.analyzed_at.is_some());

    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.company_id.as_deref(), Some("acme-corp--acme.io"));
}

#[tokio::test]
async fn enrichment_failure_degrades_to_minimal_company() {
    let h = Harness::new().await;
    let adapters = adapter_set(
        HashMap::new(),
        Arc::new(StaticScraper::with_detail("Rust work")),
        Arc::new(StubEnrichment::failing()),
        Arc::new(ScriptedScorer::always(score_outcome(
            85.0,
            MatchPriority::Medium,
        ))),
    );
    let pipeline = pipeline_with(&h, adapters);

    let url = "https://example.com/jobs/1";
    let IngestOutcome::Queued { id } = h
        .intake
        .submit(scraper_candidate(url, "Acme", "Engineer", "Rust"))
        .await
        .unwrap()
    else {
        panic!("expected queued");
    };

    run_one_batch(&h, &pipeline).await;

    // The item still completes; the company is minimal and marked FAILED.
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Success);

    let slug = item.company_id.expect("company resolved");
    let company: Company = serde_json::from_value(
        h.store
            .get(collections::COMPANIES, &slug)
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(company.analysis_status, AnalysisStatus::Failed);
    assert!(company.about.is_none());
}

#[tokio::test]
async fn company_items_resolve_without_writing_matches() {
    let h = Harness::new().await;
    let pipeline = pipeline_with(
        &h,
        default_adapters(ScriptedScorer::always(score_outcome(
            99.0,
            MatchPriority::High,
        ))),
    );

    let url = "https://acme.io/careers";
    let candidate = Candidate {
        url: url.to_string(),
        company_name: Some("Acme".to_string()),
        website: Some("https://acme.io".to_string()),
        source: IngestSource::UserSubmission,
        submitted_by: Some("someone".to_string()),
        scraped_data: None,
        item_type: ItemType::Company,
    };
    let IngestOutcome::Queued { id } = h.intake.submit(candidate).await.unwrap() else {
        panic!("expected queued");
    };

    run_one_batch(&h, &pipeline).await;

    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Success);
    assert!(get_match(&h, url).await.is_none());
    assert!(
        h.store
            .get(collections::COMPANIES, "acme--acme.io")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn exhausted_daily_budget_defers_scoring() {
    let h = Harness::with_config(json!({}), json!({}), json!({"dailyCostBudget": 0.05})).await;
    let pipeline = pipeline_with(
        &h,
        default_adapters(ScriptedScorer::always(score_outcome(
            90.0,
            MatchPriority::High,
        ))),
    );
    pipeline.budget().record(1.0);

    let IngestOutcome::Queued { id } = h
        .intake
        .submit(scraper_candidate(
            "https://example.com/jobs/1",
            "Acme",
            "Engineer",
            "Rust",
        ))
        .await
        .unwrap()
    else {
        panic!("expected queued");
    };

    run_one_batch(&h, &pipeline).await;
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Pending, "deferred, not failed");
    assert_eq!(item.retry_count, 1);
    let error = item.error_details.unwrap();
    assert_eq!(error.kind, jobflow::error::ErrorKind::RateLimited);
}
