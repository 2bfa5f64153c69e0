//! End-to-end pipeline tests: collectors feeding a full pipeline built on
//! the mock adapters, asserting the terminal state of each record.

use std::sync::Arc;
use std::time::Duration;

use fundflow::adapters::ClassifyTags;
use fundflow::collector::{Collector, SeenHashes};
use fundflow::config::PipelineConfig;
use fundflow::pipeline::{Adapters, Pipeline};
use fundflow::record::{
    CandidateRecord, CollectorKind, ExtractedFields, Priority, RawPayload,
};
use fundflow_collectors::{DeepCrawlCollector, Submission, UserSubmissionCollector};
use fundflow_testing::{MockFetcher, MockLlm, MockStore, MockVectorIndex};

fn adapters(store: Arc<MockStore>, llm: Arc<MockLlm>, fetcher: Arc<MockFetcher>) -> Adapters {
    Adapters {
        store,
        vector: Arc::new(MockVectorIndex::new(64)),
        llm,
        fetcher,
    }
}

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.scrape.poll_interval = Duration::from_millis(20);
    config.scrape.backoff_base = Duration::from_millis(10);
    config.publish.store_retry_base = Duration::from_millis(5);
    config
}

fn funding_candidate(title: &str, url: &str) -> CandidateRecord {
    CandidateRecord::new(
        CollectorKind::Rss,
        RawPayload::Text(format!("{title} coverage from {url}")),
        ExtractedFields {
            title: title.to_string(),
            description: "Funding round details for an African AI company.".to_string(),
            amount_usd: Some(5_000_000.0),
            transaction_date: chrono::NaiveDate::from_ymd_opt(2026, 1, 15),
            organizations: vec!["Foo Ltd".to_string()],
            geography: vec!["Kenya".to_string()],
            sectors: vec!["ai".to_string()],
            stage: Some("series a".to_string()),
            ..ExtractedFields::default()
        },
        vec![url.to_string()],
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn same_round_from_three_urls_collapses_to_one_record() {
    let store = Arc::new(MockStore::new());
    let llm = Arc::new(MockLlm::new());
    let fetcher = Arc::new(MockFetcher::new());
    let pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), llm, fetcher),
    )
    .await
    .unwrap();

    let router = pipeline.router_handle();
    router
        .submit(funding_candidate(
            "Foo Ltd Series A funding round details",
            "https://a.example/1",
        ))
        .unwrap();
    wait_for("first record published", || store.records().len() == 1).await;

    // Second and third arrivals: different URLs, same semantic record.
    router
        .submit(funding_candidate(
            "Series A funding details for Foo Ltd",
            "https://b.example/2",
        ))
        .unwrap();
    router
        .submit(funding_candidate(
            "Foo Ltd funding round, full details",
            "https://c.example/3",
        ))
        .unwrap();

    wait_for("source URLs to grow to 3", || {
        store
            .records()
            .first()
            .is_some_and(|r| r.source_urls.len() == 3)
    })
    .await;

    let records = store.records();
    assert_eq!(records.len(), 1, "duplicates must merge, not insert");
    let record = &records[0];
    assert_eq!(record.merged_from.len(), 3);
    // Confidence is monotonically non-decreasing across merges.
    assert!(record.confidence > 0.0);

    let audits = store.audit_log();
    assert_eq!(audits.iter().filter(|a| a.action == "insert").count(), 1);
    assert_eq!(audits.iter().filter(|a| a.action == "merge").count(), 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn announcement_is_rejected_with_no_downstream_work() {
    let store = Arc::new(MockStore::new());
    let llm = Arc::new(MockLlm::new());
    let fetcher = Arc::new(MockFetcher::new());
    let pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), Arc::clone(&llm), fetcher),
    )
    .await
    .unwrap();

    let record = CandidateRecord::new(
        CollectorKind::WebSearch,
        RawPayload::Text("press release".to_string()),
        ExtractedFields {
            title: "Startup X announces $2M Series A".to_string(),
            description: "The company announces funding from investors.".to_string(),
            ..ExtractedFields::default()
        },
        vec!["https://news.example/pr".to_string()],
    );
    pipeline.router_handle().submit(record).unwrap();

    // Give the pipeline time to (not) act.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.records().is_empty());
    assert!(pipeline.queue().review_list_pending(10).await.unwrap().is_empty());
    // Stage 1 is deterministic: the LLM was never consulted for this record.
    assert_eq!(llm.call_count(), 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn incomplete_candidate_is_enriched_via_scrape_queue() {
    let store = Arc::new(MockStore::new());
    // Classifier sees low completeness; extraction returns the full record.
    let llm = Arc::new(
        MockLlm::new()
            .with_tags(ClassifyTags {
                completeness: 0.3,
                ..ClassifyTags::default()
            })
            .with_extraction(serde_json::json!({
                "title": "AI Growth Grant",
                "description": "Grants of up to $50,000 for African AI startups",
                "amount_usd": 50000.0,
                "deadline": "2026-09-30",
                "organizations": ["Example Foundation"],
                "geography": ["Kenya"],
                "sectors": ["ai"],
                "stage": "grant"
            })),
    );
    let fetcher = Arc::new(MockFetcher::new().with_page(
        "https://example.org/grant",
        "<html><head><title>AI Growth Grant</title></head><body><article>Apply now.</article></body></html>",
    ));

    let mut pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), llm.clone(), Arc::clone(&fetcher)),
    )
    .await
    .unwrap();

    // Run the deep-crawl collector against the pipeline's scrape results.
    let fetched_rx = pipeline.take_scrape_fetched().unwrap();
    let deep_crawl = Arc::new(DeepCrawlCollector::new(llm, fetched_rx));
    let ctx = pipeline.collector_context();
    let crawl_task = {
        let deep_crawl = Arc::clone(&deep_crawl);
        tokio::spawn(async move { deep_crawl.run(ctx).await })
    };

    // Sparse candidate with a URL: parked, scraped, enriched, published.
    let sparse = CandidateRecord::new(
        CollectorKind::WebSearch,
        RawPayload::Text("AI Growth Grant".to_string()),
        ExtractedFields {
            title: "AI Growth Grant".to_string(),
            ..ExtractedFields::default()
        },
        vec!["https://example.org/grant".to_string()],
    );
    pipeline.router_handle().submit(sparse).unwrap();

    wait_for("enriched record published", || store.records().len() == 1).await;
    let record = &store.records()[0];
    assert_eq!(record.fields.amount_usd, Some(50_000.0));
    assert_eq!(
        record.fields.organizations,
        vec!["Example Foundation".to_string()]
    );
    assert!(fetcher.fetched().contains(&"https://example.org/grant".to_string()));

    pipeline.shutdown().await;
    crawl_task.abort();
}

#[tokio::test]
async fn medium_confidence_record_goes_to_review_queue() {
    let store = Arc::new(MockStore::new());
    let llm = Arc::new(MockLlm::new().with_score(0.55));
    let fetcher = Arc::new(MockFetcher::new());
    let pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), llm, fetcher),
    )
    .await
    .unwrap();

    pipeline
        .router_handle()
        .submit(funding_candidate(
            "Foo Ltd Series A funding round details",
            "https://a.example/1",
        ))
        .unwrap();

    let queue = pipeline.queue();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let items = loop {
        let items = queue.review_list_pending(10).await.unwrap();
        if !items.is_empty() {
            break items;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for review item"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    assert_eq!(items.len(), 1);
    assert!(items[0]
        .reasons
        .contains(&"medium_confidence".to_string()));
    assert!(store.records().is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn identical_payload_is_dropped_at_the_collector() {
    let store = Arc::new(MockStore::new());
    let llm = Arc::new(MockLlm::new());
    let fetcher = Arc::new(MockFetcher::new());
    let pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), llm, fetcher),
    )
    .await
    .unwrap();

    let ctx = pipeline.collector_context();
    let seen = SeenHashes::new();
    let record = funding_candidate(
        "Foo Ltd Series A funding round details",
        "https://a.example/1",
    );

    assert!(ctx.emit(&seen, record.clone()).await.unwrap());
    // Identical raw payload: dropped before the router, no downstream work.
    assert!(!ctx.emit(&seen, record).await.unwrap());

    wait_for("single publish", || store.records().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].merged_from.len(), 1, "no merge should occur");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn user_submission_flows_to_publication_at_high_priority() {
    let store = Arc::new(MockStore::new());
    // Classifier tags fill in sector/geography/stage, pushing the record
    // into the auto-approve band.
    let llm = Arc::new(MockLlm::new().with_tags(ClassifyTags {
        sectors: vec!["ai".to_string()],
        geography: vec!["Kenya".to_string()],
        stage: Some("grant".to_string()),
        completeness: 0.9,
        ..ClassifyTags::default()
    }));
    let fetcher = Arc::new(MockFetcher::new());
    let pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), llm, fetcher),
    )
    .await
    .unwrap();

    let (collector, handle) = UserSubmissionCollector::new(16);
    let ctx = pipeline.collector_context();
    let task = tokio::spawn(async move { collector.run(ctx).await });

    handle
        .submit(Submission {
            title: "Apply for the AI Growth Grant".to_string(),
            description: "Grants for African AI startups, apply by September".to_string(),
            url: "https://example.org/grant".to_string(),
            amount_usd: Some(50_000.0),
            deadline: chrono::NaiveDate::from_ymd_opt(2026, 9, 30),
            organization: Some("Example Foundation".to_string()),
            submitter: "operator@example.org".to_string(),
        })
        .await
        .unwrap();

    wait_for("submission published", || !store.records().is_empty()).await;
    let record = &store.records()[0];
    assert_eq!(
        record.fields.organizations,
        vec!["Example Foundation".to_string()]
    );

    // Schema violations never reach the store.
    handle
        .submit(Submission {
            title: String::new(),
            description: String::new(),
            url: "https://example.org/other".to_string(),
            amount_usd: None,
            deadline: None,
            organization: None,
            submitter: "operator@example.org".to_string(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.records().len(), 1);

    pipeline.shutdown().await;
    task.abort();
}

#[tokio::test]
async fn web_search_collector_drops_low_relevance_hits() {
    use fundflow::adapters::SearchHit;
    use fundflow_collectors::{SearchQuery, WebSearchCollector};
    use fundflow_testing::MockSearchProvider;

    let store = Arc::new(MockStore::new());
    let llm = Arc::new(MockLlm::new());
    let fetcher = Arc::new(MockFetcher::new());
    let pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), llm, fetcher),
    )
    .await
    .unwrap();

    let provider = Arc::new(MockSearchProvider::new().with_hits(vec![
        SearchHit {
            title: "Apply for the AI Growth Grant".to_string(),
            url: "https://a.example/grant".to_string(),
            snippet: "Accepting applications until September. $50,000 grants.".to_string(),
            relevance: Some(0.9),
        },
        SearchHit {
            title: "Barely related listicle".to_string(),
            url: "https://b.example/listicle".to_string(),
            snippet: "Ten things about technology".to_string(),
            relevance: Some(0.1),
        },
    ]));
    let collector = Arc::new(
        WebSearchCollector::builder(Arc::clone(&provider) as Arc<dyn fundflow::adapters::SearchProvider>)
            .queries(vec![SearchQuery::new("ai grant africa")])
            .relevance_floor(0.4)
            .poll_interval(Duration::from_secs(3600))
            .build(),
    );
    let ctx = pipeline.collector_context();
    let task = {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move { collector.run(ctx).await })
    };

    // The relevant hit is sparse (no amount, no deadline), so it lands in
    // the review queue; the low-relevance hit never leaves the collector.
    let queue = pipeline.queue();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let items = loop {
        let items = queue.review_list_pending(10).await.unwrap();
        if !items.is_empty() {
            break items;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for review item"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(items.len(), 1);
    let candidate = &items[0].payload["candidate"];
    assert_eq!(
        candidate["source_urls"][0],
        "https://a.example/grant"
    );
    assert_eq!(
        queue.review_list_pending(10).await.unwrap().len(),
        1,
        "the low-relevance hit must not reach review"
    );
    assert_eq!(provider.queries().len(), 1);

    pipeline.shutdown().await;
    task.abort();
}

#[tokio::test]
async fn breaker_short_circuits_router_submission() {
    let store = Arc::new(MockStore::new());
    let llm = Arc::new(MockLlm::new());
    let fetcher = Arc::new(MockFetcher::new());
    let pipeline = Pipeline::spawn(
        fast_config(),
        adapters(Arc::clone(&store), llm, fetcher),
    )
    .await
    .unwrap();

    let health = pipeline.health();
    // Web-search opens after 3 consecutive hard failures.
    for _ in 0..3 {
        health.record_outcome(
            CollectorKind::WebSearch,
            &fundflow::health::Outcome::HardFailure("search API down".to_string()),
        );
    }

    let mut record = funding_candidate("Some funding details", "https://a.example/x");
    record.collector = CollectorKind::WebSearch;
    record.priority = Priority::Normal;
    let err = pipeline.router_handle().submit(record).unwrap_err();
    assert!(matches!(err, fundflow::Error::BreakerOpen { .. }));

    // Other collectors keep flowing.
    pipeline
        .router_handle()
        .submit(funding_candidate(
            "Foo Ltd Series A funding round details",
            "https://a.example/1",
        ))
        .unwrap();
    wait_for("rss record still publishes", || !store.records().is_empty()).await;

    pipeline.shutdown().await;
}
