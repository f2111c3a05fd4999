//! Cache-aware dataset loading: freshness policies, corruption recovery and
//! concurrent partition writes.

use chrono::NaiveDate;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use screener::engine::fetcher::{FetcherConfig, ParallelFetcher, RetryPolicy};
use screener::engine::pipeline::{DatasetRequest, ScreeningPipeline};
use screener::source::PageSource;
use screener::storage::{CacheStore, PartitionKey};
use screener::types::*;

use crate::mock_source::{record, ScriptedSource};

fn pipeline(source: &Arc<ScriptedSource>, dir: &TempDir) -> (ScreeningPipeline, Arc<CacheStore>) {
    let source: Arc<dyn PageSource> = source.clone();
    let fetcher = ParallelFetcher::new(
        source,
        FetcherConfig {
            workers: 4,
            retry: RetryPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        },
    )
    .unwrap();
    let cache = Arc::new(CacheStore::open(dir.path()).unwrap());
    (ScreeningPipeline::new(fetcher, Arc::clone(&cache)), cache)
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn short_interest_request(ticker: &str) -> DatasetRequest {
    let request = SourceRequest::ShortInterest(ShortInterestParams {
        ticker: Some(ticker.to_string()),
        settlement_date_gte: Some(date("2024-03-01")),
        ..Default::default()
    });
    DatasetRequest::new("short_interest", &request, "ticker")
}

#[tokio::test]
async fn test_second_load_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(ScriptedSource::new());
    source.script(
        "list_short_interest",
        vec![
            vec![record(json!({"ticker": "GME", "settlement_date": "2024-03-15", "short_interest": 1}))],
            vec![record(json!({"ticker": "GME", "settlement_date": "2024-03-29", "short_interest": 2}))],
        ],
    );
    let (pipeline, cache) = pipeline(&source, &dir);
    let request = short_interest_request("GME");

    let first = pipeline.load_dataset(&request).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(source.call_count(), 2);

    let second = pipeline.load_dataset(&request).await.unwrap();
    assert_eq!(source.call_count(), 2);
    assert_eq!(second.len(), 2);

    // Partition lands under <source>/<month of settlement_date.gte>/.
    let scan = cache.scan("list_short_interest/2024-03/GME-*").unwrap();
    assert_eq!(scan.len(), 1);
    assert_eq!(scan.records().count(), 2);
}

#[tokio::test]
async fn test_empty_result_policy_per_source() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(ScriptedSource::new());
    source.script("list_short_volume", vec![vec![]]);
    source.script("list_stock_ratios", vec![vec![]]);
    let (pipeline, _cache) = pipeline(&source, &dir);

    // Short volume: an empty answer is a real answer.
    let sv = DatasetRequest::new(
        "short_volume",
        &SourceRequest::ShortVolume(ShortVolumeParams {
            ticker: Some("ZZZZ".into()),
            date_gte: Some(date("2024-05-01")),
            ..Default::default()
        }),
        "ticker",
    );
    assert!(pipeline.load_dataset(&sv).await.unwrap().is_empty());
    assert!(pipeline.load_dataset(&sv).await.unwrap().is_empty());
    assert_eq!(source.calls_for("list_short_volume"), 1);

    // Ratios: an empty cached copy is refetched.
    let ratios = DatasetRequest::new(
        "ratios",
        &SourceRequest::StockRatios(StockRatiosParams {
            tickers: Some(vec!["ZZZZ".into()]),
            ..Default::default()
        }),
        "ticker",
    );
    assert!(pipeline.load_dataset(&ratios).await.unwrap().is_empty());
    assert!(pipeline.load_dataset(&ratios).await.unwrap().is_empty());
    assert_eq!(source.calls_for("list_stock_ratios"), 2);
}

#[tokio::test]
async fn test_corrupt_partition_triggers_refetch() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(ScriptedSource::new());
    source.script(
        "list_short_interest",
        vec![vec![record(json!({"ticker": "AMC", "settlement_date": "2024-03-15", "short_interest": 7}))]],
    );
    let (pipeline, cache) = pipeline(&source, &dir);
    let request = short_interest_request("AMC");

    pipeline.load_dataset(&request).await.unwrap();
    let key = PartitionKey::for_spec(&request.spec);
    let data = fs::read_dir(cache.root().join(key.relative_path()))
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "parquet"))
        .unwrap();
    fs::write(&data, b"garbage").unwrap();
    assert!(cache.get(&key).is_none());

    let records = pipeline.load_dataset(&request).await.unwrap();
    assert_eq!(source.call_count(), 2);
    assert_eq!(records[0]["short_interest"], json!(7));
    // The refetch repaired the partition.
    assert!(cache.get(&key).is_some());
}

#[tokio::test]
async fn test_uncached_request_always_fetches() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(ScriptedSource::new());
    source.script("list_short_interest", vec![vec![record(json!({"ticker": "BB"}))]]);
    let (pipeline, cache) = pipeline(&source, &dir);
    let request = short_interest_request("BB").with_freshness(None);

    pipeline.load_dataset(&request).await.unwrap();
    pipeline.load_dataset(&request).await.unwrap();
    assert_eq!(source.call_count(), 2);
    assert_eq!(cache.stats().partitions, 0);
}

#[tokio::test]
async fn test_concurrent_loads_write_separate_partitions() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(ScriptedSource::new());
    source.script(
        "list_short_interest",
        vec![vec![record(json!({"ticker": "X", "settlement_date": "2024-03-15"}))]],
    );
    let (pipeline, cache) = pipeline(&source, &dir);
    let pipeline = Arc::new(pipeline);

    let tickers = ["AAA", "BBB", "CCC", "DDD", "EEE", "FFF"];
    let mut handles = Vec::new();
    for ticker in tickers {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.load_dataset(&short_interest_request(ticker)).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 1);
    }

    let scan = cache.scan("list_short_interest/**").unwrap();
    assert_eq!(scan.len(), tickers.len());
    assert_eq!(cache.stats().rows, tickers.len());
}
