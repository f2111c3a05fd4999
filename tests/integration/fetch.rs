//! Parallel fetch orchestrator against the scripted source.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use screener::engine::fetcher::{FetcherConfig, ParallelFetcher, RetryPolicy};
use screener::source::PageSource;
use screener::types::{FetchSpec, ParamValue, Record, ScreenError};

use crate::mock_source::{numbered_pages, Fault, ScriptedSource};

const METHOD: &str = "list_short_volume";

fn spec() -> FetchSpec {
    FetchSpec::new(METHOD, vec![("ticker", Some(ParamValue::from("GME")))])
}

fn fetcher(source: &Arc<ScriptedSource>, workers: usize) -> ParallelFetcher {
    let source: Arc<dyn PageSource> = source.clone();
    ParallelFetcher::new(
        source,
        FetcherConfig {
            workers,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        },
    )
    .unwrap()
}

fn ids(records: &[Record]) -> BTreeSet<i64> {
    records
        .iter()
        .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
        .collect()
}

#[tokio::test]
async fn test_single_page_issues_one_call() {
    let source = Arc::new(ScriptedSource::new());
    source.script(METHOD, numbered_pages(1, 7));

    let records = fetcher(&source, 5).fetch_all(&spec()).await.unwrap();
    assert_eq!(records.len(), 7);
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn test_union_matches_sequential_walk_for_any_worker_count() {
    for workers in [1, 5, 20] {
        let source = Arc::new(ScriptedSource::new());
        source.script(METHOD, numbered_pages(12, 25));
        let expected = ids(&source.all_records(METHOD));

        let records = fetcher(&source, workers).fetch_all(&spec()).await.unwrap();
        assert_eq!(records.len(), 300, "workers = {workers}");
        assert_eq!(ids(&records), expected, "workers = {workers}");
        // Every page exactly once.
        assert_eq!(source.call_count(), 12, "workers = {workers}");
    }
}

#[tokio::test]
async fn test_first_page_only_ignores_continuation() {
    let source = Arc::new(ScriptedSource::new());
    source.script(METHOD, numbered_pages(4, 10));

    let records = fetcher(&source, 5)
        .fetch_all(&spec().first_page_only())
        .await
        .unwrap();
    assert_eq!(records.len(), 10);
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let source = Arc::new(ScriptedSource::new());
    source.script(METHOD, numbered_pages(3, 4));
    source.fail(METHOD, 1, Fault::Transient(2));

    let records = fetcher(&source, 5).fetch_all(&spec()).await.unwrap();
    assert_eq!(records.len(), 12);
    assert_eq!(source.calls_for_page(METHOD, 1), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_fetch() {
    let source = Arc::new(ScriptedSource::new());
    source.script(METHOD, numbered_pages(3, 4));
    source.fail(METHOD, 0, Fault::Transient(5));

    let err = fetcher(&source, 5).fetch_all(&spec()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(source.calls_for_page(METHOD, 0), 3);
    assert_eq!(source.call_count(), 3);
}

#[tokio::test]
async fn test_permanent_failure_aborts_without_partial_result() {
    let source = Arc::new(ScriptedSource::new());
    source.script(METHOD, numbered_pages(10, 5));
    source.fail(METHOD, 3, Fault::Permanent);

    let err = fetcher(&source, 5).fetch_all(&spec()).await.unwrap_err();
    assert!(matches!(err, ScreenError::PermanentSource { .. }));
    // Pages 0-3 at most; nothing past the failing page is requested.
    assert!(source.call_count() <= 4);
    assert_eq!(source.calls_for_page(METHOD, 3), 1);
    assert_eq!(source.calls_for_page(METHOD, 4), 0);
}

#[tokio::test]
async fn test_cancellation_stops_workers() {
    let source = Arc::new(ScriptedSource::new());
    source.script(METHOD, numbered_pages(50, 2));
    source.set_delay(Duration::from_millis(20));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(70)).await;
        trigger.cancel();
    });

    let err = fetcher(&source, 5)
        .fetch_all_with(&spec(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ScreenError::Cancelled(_)));
    assert!(source.call_count() < 50);
}
