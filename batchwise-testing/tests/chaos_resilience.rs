//! Bulk helpers keep their guarantees when the transport misbehaves.

use std::sync::Arc;
use std::time::Duration;

use batchwise::{
    execute_batch, BatchItem, Client, ClientConfig, ConcurrencyLimit, ErrorKind, ItemOutcome,
    PageSize, RetryConfig, TransportFailure,
};
use batchwise_memory::InMemoryService;
use batchwise_testing::{init_test_tracing, ChaosConfig, ChaosTransportExt, ScriptedOperation};
use serde_json::{json, Value};

const DB: &str = "main";
const COL: &str = "events";

fn patient_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(2))
        .jitter_fraction(0.0)
        .build()
        .unwrap()
}

fn config(max_attempts: u32) -> ClientConfig {
    ClientConfig::new("https://memory.test/v1", "project", "secret")
        .with_retry(patient_retry(max_attempts))
        .with_concurrency(ConcurrencyLimit::try_new(4).unwrap())
        .with_page_size(PageSize::try_new(3).unwrap())
}

fn documents(count: usize) -> Vec<Value> {
    (0..count).map(|n| json!({ "n": n })).collect()
}

#[tokio::test]
async fn retries_absorb_injected_failures_without_duplicates() {
    init_test_tracing();

    // Given: a service behind a transport failing 30% of requests
    let service = InMemoryService::new();
    let chaos = Arc::new(
        service
            .clone()
            .with_chaos(ChaosConfig::seeded(7).with_failure_probability(0.3)),
    );
    let client = Client::new(Arc::clone(&chaos), config(20)).unwrap();

    // When: creating twenty documents in bulk
    let result = client
        .databases()
        .bulk_create_documents(DB, COL, documents(20))
        .await;

    // Then: every item lands exactly once and extra attempts match the faults
    assert!(result.all_succeeded());
    assert_eq!(service.documents(DB, COL).len(), 20);
    let attempts: u32 = result.entries.iter().map(|entry| entry.attempts).sum();
    assert_eq!(attempts as usize - 20, chaos.injected());
}

#[tokio::test]
async fn exhausted_items_fail_individually_and_never_reach_the_service() {
    // Given: a transport that fails every request
    let service = InMemoryService::new();
    let chaos = service
        .clone()
        .with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));
    let client = Client::new(chaos, config(3)).unwrap();

    // When: creating three documents in bulk
    let result = client
        .databases()
        .bulk_create_documents(DB, COL, documents(3))
        .await;

    // Then: each item fails as transient after all of its attempts
    assert_eq!(result.counts.failed, 3);
    for entry in &result.entries {
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.outcome.error().unwrap().kind, ErrorKind::Transient);
    }
    assert_eq!(service.request_count(), 0);
}

#[tokio::test]
async fn listing_under_chaos_yields_every_document_in_order() {
    // Given: ten documents written through a reliable client
    let service = InMemoryService::new();
    let reliable = Client::new(service.clone(), config(1)).unwrap();
    assert!(reliable
        .databases()
        .bulk_create_documents(DB, COL, documents(10))
        .await
        .all_succeeded());

    // When: listing them through a transport failing 40% of requests
    let flaky = Client::new(
        service.with_chaos(ChaosConfig::seeded(11).with_failure_probability(0.4)),
        config(25),
    )
    .unwrap();
    let listed = flaky
        .databases()
        .get_all_documents(DB, COL, Vec::new())
        .await
        .unwrap();

    // Then: pages were retried transparently, nothing lost or repeated
    let numbers: Vec<u64> = listed.iter().map(|doc| doc["n"].as_u64().unwrap()).collect();
    assert_eq!(numbers, (0..10).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn injected_rate_limits_wait_for_the_server_hint() {
    // Given: every request is rate limited with a 250ms hint
    let chaos = InMemoryService::new().with_chaos(
        ChaosConfig::deterministic()
            .with_rate_limit_probability(1.0)
            .with_retry_after(Duration::from_millis(250)),
    );
    let client = Client::new(chaos, config(3)).unwrap();
    let started = tokio::time::Instant::now();

    // When: fetching a document
    let error = client
        .databases()
        .get_document(DB, COL, "anything")
        .await
        .unwrap_err();

    // Then: both waits honored the hint before giving up as rate limited
    assert_eq!(error.kind, ErrorKind::RateLimited);
    assert_eq!(error.retry_after, Some(Duration::from_millis(250)));
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn scripted_items_report_outcomes_and_attempts_per_key() {
    // Given: one healthy item, one flaky item and one missing item
    let items = vec![
        BatchItem::new(
            "healthy",
            ScriptedOperation::failing_then_succeeding(Vec::new(), 1),
        ),
        BatchItem::new(
            "flaky",
            ScriptedOperation::failing_then_succeeding(
                vec![
                    TransportFailure::connection("connection reset"),
                    TransportFailure::from_status(502, "bad gateway"),
                ],
                2,
            ),
        ),
        BatchItem::new(
            "missing",
            ScriptedOperation::always_failing(TransportFailure::from_status(404, "gone")),
        ),
    ];

    // When: running them two at a time
    let result = execute_batch(items, ConcurrencyLimit::try_new(2).unwrap(), &patient_retry(5)).await;

    // Then: retries apply only to the transient failures
    let summary: Vec<(&str, u32, bool)> = result
        .entries
        .iter()
        .map(|entry| (entry.key, entry.attempts, entry.outcome.is_success()))
        .collect();
    assert_eq!(
        summary,
        vec![("healthy", 1, true), ("flaky", 3, true), ("missing", 1, false)]
    );
    assert_eq!(result.entries[1].outcome, ItemOutcome::Succeeded(2));
    assert_eq!(
        result.entries[2].outcome.error().unwrap().kind,
        ErrorKind::NotFound
    );
}
