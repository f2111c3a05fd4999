//! SCREENER: multi-factor equity screening over short-interest data.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! validates the requested screen, then runs one screening pass against
//! the market-data API with the partitioned cache in front of it.
//!
//! Usage: `screener [SCREEN] [--as-of YYYY-MM-DD]`

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use screener::config::AppConfig;
use screener::engine::fetcher::ParallelFetcher;
use screener::engine::pipeline::ScreeningPipeline;
use screener::source::rest::RestSource;
use screener::storage::CacheStore;
use screener::strategy::{build_screen, ScreenKind};

const BANNER: &str = r#"
 ____   ____ ____  _____ _____ _   _ _____ ____
/ ___| / ___|  _ \| ____| ____| \ | | ____|  _ \
\___ \| |   | |_) |  _| |  _| |  \| |  _| | |_) |
 ___) | |___|  _ <| |___| |___| |\  | |___|  _ <
|____/ \____|_| \_\_____|_____|_| \_|_____|_| \_\

  Short-interest equity screener v0.1.0
"#;

/// Command-line arguments.
struct Args {
    screen: ScreenKind,
    as_of: NaiveDate,
}

fn parse_args() -> Result<Args> {
    let mut screen = ScreenKind::ShortSqueeze;
    let mut as_of = Utc::now().date_naive();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--as-of" => {
                let value = args.next().context("--as-of requires a date")?;
                as_of = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                    .with_context(|| format!("Invalid --as-of date: {value}"))?;
            }
            flag if flag.starts_with("--") => bail!("Unknown flag: {flag}"),
            name => screen = name.parse()?,
        }
    }
    Ok(Args { screen, as_of })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("SCREENER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");

    // Options are validated before any network call is made.
    let args = parse_args()?;
    let screen = build_screen(args.screen, cfg.screen_options(args.screen.name()))
        .with_context(|| format!("Invalid options for screen {}", args.screen))?;

    info!(
        screen = %args.screen,
        as_of = %args.as_of,
        workers = cfg.fetch.workers,
        cache_dir = %cfg.cache.dir.display(),
        "SCREENER starting up"
    );

    // -- Initialise components -------------------------------------------

    let api_key = AppConfig::resolve_env(&cfg.source.api_key_env)?;
    let source = RestSource::new(&cfg.source.base_url, SecretString::new(api_key), cfg.source_timeout())?
        .with_default_page_size(cfg.fetch.page_size);
    let fetcher = ParallelFetcher::new(Arc::new(source), cfg.fetcher_config()?)?;
    let cache = Arc::new(CacheStore::open(cfg.cache.dir.clone())?);

    let cancel = CancellationToken::new();
    let pipeline = ScreeningPipeline::new(fetcher, Arc::clone(&cache)).with_cancellation(cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Cancelling run.");
            shutdown.cancel();
        }
    });

    // -- Run -------------------------------------------------------------

    let report = pipeline
        .run_with_timeout(screen.as_ref(), args.as_of, cfg.pipeline_timeout())
        .await?;

    println!(
        "\n{} as of {}: {} screened, {} candidates, {} dropped\n",
        report.screen,
        report.as_of,
        report.screened,
        report.candidates.len(),
        report.dropped.len()
    );
    for (rank, candidate) in report.candidates.iter().enumerate() {
        println!("{:>3}. {candidate}", rank + 1);
    }

    if let Some(ttl) = cfg.cache_ttl() {
        match cache.evict_older_than(ttl) {
            Ok(0) => {}
            Ok(expired) => info!(expired, ttl_hours = cfg.cache.ttl_hours, "Expired cache partitions removed"),
            Err(e) => warn!(error = %e, "Cache expiry failed"),
        }
    }

    if let Some(max_bytes) = cfg.cache_max_bytes() {
        match cache.evict_to_size(max_bytes) {
            Ok(0) => {}
            Ok(evicted) => info!(evicted, max_bytes, "Cache trimmed"),
            Err(e) => warn!(error = %e, "Cache eviction failed"),
        }
    }

    info!(run_id = %report.run_id, "SCREENER finished.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("screener=info"));

    let json_logging = std::env::var("SCREENER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
