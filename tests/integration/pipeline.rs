//! End-to-end screening runs against the scripted source.

use chrono::NaiveDate;
use serde_json::json;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use screener::engine::fetcher::{FetcherConfig, ParallelFetcher, RetryPolicy};
use screener::engine::pipeline::{output_key, ScreeningPipeline, Stage};
use screener::source::PageSource;
use screener::storage::CacheStore;
use screener::strategy::{build_screen, ScreenKind};
use screener::types::*;

use crate::mock_source::{record, Fault, ScriptedSource};

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
}

fn fetcher(source: &Arc<ScriptedSource>) -> ParallelFetcher {
    let source: Arc<dyn PageSource> = source.clone();
    ParallelFetcher::new(
        source,
        FetcherConfig {
            workers: 3,
            retry: RetryPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        },
    )
    .unwrap()
}

/// Short-interest and ratios data for a short-squeeze run.
///
/// - GME: building short interest, healthy
/// - AMC: flat short interest, healthy
/// - BB: no ratios row
/// - LOSS: unprofitable
fn squeeze_source() -> Arc<ScriptedSource> {
    let source = Arc::new(ScriptedSource::new());
    source.script(
        "list_short_interest",
        vec![
            vec![
                record(json!({"ticker": "GME", "settlement_date": "2024-04-15", "short_interest": 40e6, "days_to_cover": 8.0, "avg_daily_volume": 5e6})),
                record(json!({"ticker": "GME", "settlement_date": "2024-04-30", "short_interest": 60e6, "days_to_cover": 12.0, "avg_daily_volume": 4e6})),
                record(json!({"ticker": "AMC", "settlement_date": "2024-04-15", "short_interest": 100e6, "days_to_cover": 5.5, "avg_daily_volume": 2e6})),
            ],
            vec![
                record(json!({"ticker": "AMC", "settlement_date": "2024-04-30", "short_interest": 100e6, "days_to_cover": 6.0, "avg_daily_volume": 2e6})),
                record(json!({"ticker": "BB", "settlement_date": "2024-04-30", "short_interest": 10e6, "days_to_cover": 9.0, "avg_daily_volume": 1e6})),
                record(json!({"ticker": "LOSS", "settlement_date": "2024-04-30", "short_interest": 5e6, "days_to_cover": 20.0, "avg_daily_volume": 1e6})),
            ],
        ],
    );
    source.script(
        "list_stock_ratios",
        vec![vec![
            record(json!({"ticker": "GME", "date": "2024-05-16", "market_cap": 1.05e9, "earnings_per_share": 1.0, "debt_to_equity": 0.5, "return_on_equity": 0.1, "current": 2.0})),
            record(json!({"ticker": "AMC", "date": "2024-05-16", "market_cap": 2.05e9, "earnings_per_share": 0.5, "debt_to_equity": 1.0, "return_on_equity": 0.05, "current": 1.0})),
            record(json!({"ticker": "LOSS", "date": "2024-05-16", "market_cap": 5e8, "earnings_per_share": -1.0, "debt_to_equity": 0.5})),
        ]],
    );
    source
}

#[tokio::test]
async fn test_short_squeeze_end_to_end_with_cache() {
    let dir = TempDir::new().unwrap();
    let source = squeeze_source();
    let cache = Arc::new(CacheStore::open(dir.path()).unwrap());
    let pipeline = ScreeningPipeline::new(fetcher(&source), Arc::clone(&cache));
    let screen = build_screen(ScreenKind::ShortSqueeze, None).unwrap();

    let report = pipeline.run(screen.as_ref(), as_of()).await.unwrap();

    let ranked: Vec<&str> = report.candidates.iter().map(|c| c.entity.as_str()).collect();
    assert_eq!(ranked, vec!["GME", "AMC"]);
    assert_eq!(report.screened, 2);
    // dtc 24 * .4 + cap 20 * .2 + health 50 * .2 + trend 100 * .2
    assert!((report.candidates[0].composite - 43.6).abs() < 0.011);
    // dtc 12 * .4 + cap 40 * .2 + health 25 * .2 + trend 0
    assert!((report.candidates[1].composite - 17.8).abs() < 0.011);
    assert_eq!(report.candidates[0].sub_scores["short_interest_trend"], 100.0);

    let reason = |entity: &str| {
        report
            .dropped
            .iter()
            .find(|d| d.entity == entity)
            .map(|d| d.reason.clone())
    };
    assert_eq!(reason("BB").as_deref(), Some("no ratios data"));
    assert_eq!(reason("LOSS").as_deref(), Some("not profitable"));

    assert_eq!(
        report.stages,
        vec![Stage::Fetching, Stage::Joining, Stage::Analyzing, Stage::Scoring, Stage::Done]
    );

    // Candidates (2 pages), history (2 pages), ratios (1 page).
    assert_eq!(source.call_count(), 5);

    // Ranked output is persisted under the screen's own partition.
    let output = cache.get(&output_key("short_squeeze", as_of())).unwrap();
    let mut entities: Vec<&str> = output
        .records
        .iter()
        .filter_map(|r| r.get("entity").and_then(|v| v.as_str()))
        .collect();
    entities.sort();
    assert_eq!(entities, vec!["AMC", "GME"]);

    // A second run is served entirely from cache and ranks identically.
    let again = pipeline.run(screen.as_ref(), as_of()).await.unwrap();
    assert_eq!(source.call_count(), 5);
    assert_eq!(again.candidates, report.candidates);
    assert_ne!(again.run_id, report.run_id);
}

#[tokio::test]
async fn test_bad_weights_fail_before_any_fetch() {
    let source = squeeze_source();
    let table: toml::Table = toml::from_str(
        r#"
        [weights]
        days_to_cover = 0.3
        "#,
    )
    .unwrap();

    let err = build_screen(ScreenKind::ShortSqueeze, Some(&table)).err().unwrap();
    assert!(matches!(err, ScreenError::Config(_)));
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn test_permanent_source_error_fails_run_without_output() {
    let dir = TempDir::new().unwrap();
    let source = squeeze_source();
    source.fail("list_stock_ratios", 0, Fault::Permanent);
    let cache = Arc::new(CacheStore::open(dir.path()).unwrap());
    let pipeline = ScreeningPipeline::new(fetcher(&source), Arc::clone(&cache));
    let screen = build_screen(ScreenKind::ShortSqueeze, None).unwrap();

    let err = pipeline.run(screen.as_ref(), as_of()).await.unwrap_err();
    assert!(matches!(err, ScreenError::PermanentSource { .. }));
    assert!(cache.get(&output_key("short_squeeze", as_of())).is_none());
}

#[tokio::test]
async fn test_run_times_out_as_cancelled() {
    let source = squeeze_source();
    source.set_delay(Duration::from_millis(100));
    let pipeline = ScreeningPipeline::without_cache(fetcher(&source));
    let screen = build_screen(ScreenKind::ShortSqueeze, None).unwrap();

    let err = pipeline
        .run_with_timeout(screen.as_ref(), as_of(), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, ScreenError::Cancelled(_)));
}

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_timed_out_run_logs_failed_transition() {
    let logs = LogCapture::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let source = squeeze_source();
    source.set_delay(Duration::from_millis(100));
    let pipeline = ScreeningPipeline::without_cache(fetcher(&source));
    let screen = build_screen(ScreenKind::ShortSqueeze, None).unwrap();

    let err = pipeline
        .run_with_timeout(screen.as_ref(), as_of(), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, ScreenError::Cancelled(_)));

    let output = logs.contents();
    assert!(output.contains("Screening run timed out"), "{output}");
    assert!(output.contains("Screening run failed"), "{output}");
    assert!(output.contains("FETCHING"), "{output}");
}

#[tokio::test]
async fn test_cancelled_token_stops_run() {
    let source = squeeze_source();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipeline = ScreeningPipeline::without_cache(fetcher(&source)).with_cancellation(cancel);
    let screen = build_screen(ScreenKind::ShortSqueeze, None).unwrap();

    let err = pipeline.run(screen.as_ref(), as_of()).await.unwrap_err();
    assert!(matches!(err, ScreenError::Cancelled(_)));
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn test_earnings_setup_end_to_end() {
    let source = Arc::new(ScriptedSource::new());
    source.script(
        "list_earnings",
        vec![vec![
            record(json!({"ticker": "AAPL", "date": "2024-05-24"})),
            record(json!({"ticker": "MSFT", "date": "2024-05-30"})),
        ]],
    );

    let mut rows = Vec::new();
    let mut day = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
    for i in 0..10 {
        rows.push(record(json!({"ticker": "AAPL", "date": day, "short_volume_ratio": 50.0 + 2.0 * i as f64})));
        rows.push(record(json!({"ticker": "MSFT", "date": day, "short_volume_ratio": 50.0})));
        day = next_weekday(day).unwrap();
    }
    source.script("list_short_volume", vec![rows]);
    source.script(
        "list_stock_ratios",
        vec![vec![
            record(json!({"ticker": "AAPL", "date": "2024-05-01", "market_cap": 3e12, "earnings_per_share": 6.0, "debt_to_equity": 1.5})),
            record(json!({"ticker": "MSFT", "date": "2024-05-01", "market_cap": 3e12, "earnings_per_share": 11.0, "debt_to_equity": 0.4})),
        ]],
    );

    let pipeline = ScreeningPipeline::without_cache(fetcher(&source));
    let screen = build_screen(ScreenKind::EarningsShortSetup, None).unwrap();
    let report = pipeline.run(screen.as_ref(), as_of()).await.unwrap();

    assert_eq!(report.candidates.len(), 1);
    let aapl = &report.candidates[0];
    assert_eq!(aapl.entity, "AAPL");
    assert_eq!(aapl.attributes["scenario"], json!("high_buildup"));
    assert!(aapl.rationale.contains("7d to earnings"));
    assert!(aapl.composite > 0.0 && aapl.composite <= 100.0);

    // Flat 50% short volume: steady, below the 55% minimum.
    assert!(report
        .dropped
        .iter()
        .any(|d| d.entity == "MSFT" && d.reason.contains("below minimum")));
}
