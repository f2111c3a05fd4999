//! Parallel paginated fetch orchestrator.
//!
//! The first page is fetched directly. If it carries a continuation cursor,
//! a bounded pool of workers drains a shared cursor queue: each worker
//! fetches a page, hands its records to the collector and enqueues the
//! page's own continuation. The call returns once the queue is drained and
//! no page is in flight.
//!
//! Failures are all-or-nothing: a permanent error, or a transient error that
//! survives every retry, aborts the remaining workers and is returned with
//! no partial result.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{CursorQueue, RecordCollector};
use crate::source::PageSource;
use crate::types::{Cursor, FetchSpec, Page, Record, ScreenError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default number of concurrent page workers.
pub const DEFAULT_WORKERS: usize = 5;

/// Upper bound on concurrent page workers.
pub const MAX_WORKERS: usize = 32;

/// Retry schedule for transient source failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per page, first attempt included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub base_backoff: Duration,
    /// Ceiling on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Fetcher configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FetcherConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

impl FetcherConfig {
    pub fn validate(&self) -> Result<(), ScreenError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ScreenError::Config(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScreenError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Fetches every page of a remote query with bounded parallelism.
#[derive(Clone)]
pub struct ParallelFetcher {
    source: Arc<dyn PageSource>,
    config: FetcherConfig,
}

impl ParallelFetcher {
    pub fn new(source: Arc<dyn PageSource>, config: FetcherConfig) -> Result<Self, ScreenError> {
        config.validate()?;
        Ok(Self { source, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Fetch the complete result set for `spec`.
    pub async fn fetch_all(&self, spec: &FetchSpec) -> Result<Vec<Record>, ScreenError> {
        self.fetch_all_with(spec, &CancellationToken::new()).await
    }

    /// As [`fetch_all`](Self::fetch_all), stopping early with `Cancelled`
    /// once `cancel` fires.
    pub async fn fetch_all_with(
        &self,
        spec: &FetchSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, ScreenError> {
        if cancel.is_cancelled() {
            return Err(cancelled(spec));
        }

        let first = fetch_with_retry(self.source.as_ref(), spec, None, &self.config.retry, cancel).await?;
        let Some(next) = first.next else {
            debug!(method = %spec.method, records = first.records.len(), "Single-page result");
            return Ok(first.records);
        };
        if !spec.fetch_all {
            debug!(method = %spec.method, records = first.records.len(), "First page only; continuation ignored");
            return Ok(first.records);
        }

        let queue = Arc::new(CursorQueue::new([next]));
        let collector = Arc::new(RecordCollector::new(first.records));
        let spec = Arc::new(spec.clone());

        info!(
            method = %spec.method,
            workers = self.config.workers,
            "Paginated result; starting page workers"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(run_worker(
                id,
                Arc::clone(&self.source),
                Arc::clone(&spec),
                Arc::clone(&queue),
                Arc::clone(&collector),
                self.config.retry.clone(),
                cancel.clone(),
            ));
        }

        let mut failure: Option<ScreenError> = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(ScreenError::Worker(e.to_string())),
            };
            if let Err(e) = outcome {
                if failure.is_none() {
                    warn!(method = %spec.method, error = %e, "Page fetch failed; aborting workers");
                    queue.abort();
                    workers.abort_all();
                    failure = Some(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(cancelled(&spec));
        }

        let records = collector.take();
        info!(
            method = %spec.method,
            pages = collector.pages(),
            records = records.len(),
            "Fetch complete"
        );
        Ok(records)
    }
}

async fn run_worker(
    id: usize,
    source: Arc<dyn PageSource>,
    spec: Arc<FetchSpec>,
    queue: Arc<CursorQueue>,
    collector: Arc<RecordCollector>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<(), ScreenError> {
    loop {
        let cursor = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                queue.abort();
                return Err(cancelled(&spec));
            }
            next = queue.next() => match next {
                Some(cursor) => cursor,
                None => return Ok(()),
            },
        };

        match fetch_with_retry(source.as_ref(), &spec, Some(cursor), &retry, &cancel).await {
            Ok(page) => {
                debug!(worker = id, records = page.records.len(), more = page.next.is_some(), "Page fetched");
                collector.push_page(page.records);
                queue.complete(page.next);
            }
            Err(e) => {
                queue.abort();
                return Err(e);
            }
        }
    }
}

/// Fetch one page, retrying transient failures with exponential backoff.
pub async fn fetch_with_retry(
    source: &dyn PageSource,
    spec: &FetchSpec,
    cursor: Option<Cursor>,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Page, ScreenError> {
    let mut attempt = 1;
    loop {
        match source.fetch_page(spec, cursor.clone()).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    method = %spec.method,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable source error"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled(spec)),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(method = %spec.method, attempts = attempt, "Retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

fn cancelled(spec: &FetchSpec) -> ScreenError {
    ScreenError::Cancelled(format!("fetch of {} cancelled", spec.method))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
