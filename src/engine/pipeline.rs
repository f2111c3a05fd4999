//! Screening pipeline.
//!
//! A run walks a fixed state machine:
//!
//! ```text
//! FETCHING -> JOINING -> ANALYZING -> SCORING -> DONE
//!     \           \           \           \
//!      +-----------+-----------+-----------+--> FAILED
//! ```
//!
//! Fetching happens in rounds: a screen's fetch plan may depend on what
//! earlier rounds returned (e.g. fundamentals for the tickers a short-interest
//! query produced). Each dataset is served from the partitioned cache when a
//! fresh entry exists and fetched in parallel otherwise. Per-entity analysis
//! errors drop that entity; source errors fail the run.

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::fetcher::ParallelFetcher;
use super::join::{join, Dropped, EntityRecords, FetchedData, JoinPlan};
use crate::storage::{CacheStore, FreshnessPolicy, PartitionKey};
use crate::strategy::scoring::{rank, ScoringModel};
use crate::types::{
    Candidate, FetchSpec, ParamValue, PartitionScheme, Record, RecordIdentity, ScreenError,
    SourceRequest,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fetch rounds a screen may request before the stage stops asking.
pub const MAX_FETCH_ROUNDS: usize = 4;

/// Dataset requests loaded concurrently within one round.
const DATASET_CONCURRENCY: usize = 4;

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Joining,
    Analyzing,
    Scoring,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Fetching => "FETCHING",
            Stage::Joining => "JOINING",
            Stage::Analyzing => "ANALYZING",
            Stage::Scoring => "SCORING",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

struct StageTracker {
    run_id: String,
    screen: &'static str,
    history: Vec<Stage>,
}

impl StageTracker {
    fn new(run_id: String, screen: &'static str) -> Self {
        Self {
            run_id,
            screen,
            history: Vec::new(),
        }
    }

    fn advance(&mut self, stage: Stage) {
        info!(
            run_id = %self.run_id,
            screen = self.screen,
            from = ?self.history.last().map(Stage::to_string),
            to = %stage,
            "Stage transition"
        );
        self.history.push(stage);
    }

    fn fail(&mut self, err: &ScreenError) {
        error!(
            run_id = %self.run_id,
            screen = self.screen,
            stage = ?self.history.last().map(Stage::to_string),
            error = %err,
            "Screening run failed"
        );
        self.history.push(Stage::Failed);
    }
}

// ---------------------------------------------------------------------------
// Screen contract
// ---------------------------------------------------------------------------

/// One dataset to load during the fetch stage.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRequest {
    /// Name the join and analysis stages refer to.
    pub dataset: String,
    pub spec: FetchSpec,
    /// Record field holding the entity key.
    pub entity_field: String,
    /// Set for per-entity queries whose rows may omit the entity field.
    pub entity: Option<String>,
    /// `None` bypasses the cache entirely.
    pub freshness: Option<FreshnessPolicy>,
}

impl DatasetRequest {
    /// Request for a typed source query, cached with its default freshness.
    pub fn new(dataset: &str, request: &SourceRequest, entity_field: &str) -> Self {
        Self {
            freshness: Some(request.freshness()),
            ..Self::from_spec(dataset, FetchSpec::from_request(request), entity_field)
        }
    }

    /// Uncached request for an arbitrary spec.
    pub fn from_spec(dataset: &str, spec: FetchSpec, entity_field: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            spec,
            entity_field: entity_field.to_string(),
            entity: None,
            freshness: None,
        }
    }

    pub fn for_entity(mut self, entity: &str) -> Self {
        self.entity = Some(entity.to_string());
        self
    }

    pub fn with_freshness(mut self, freshness: Option<FreshnessPolicy>) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.spec = self.spec.with_page_size(page_size);
        self
    }
}

/// Per-entity analysis output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analyzed {
    /// Raw feature values, normalised later by the scoring model.
    pub features: BTreeMap<String, f64>,
    pub rationale: String,
    pub attributes: BTreeMap<String, Value>,
}

/// Outcome of analysing one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Keep(Analyzed),
    /// Entity fails a screen criterion.
    Reject(String),
}

/// A screening strategy: what to fetch, how to join, how to analyse and score.
pub trait Screen: Send + Sync {
    fn name(&self) -> &'static str;

    /// Datasets to load in `round`, given everything loaded so far.
    /// An empty plan ends the fetch stage.
    fn fetch_plan(&self, round: usize, fetched: &FetchedData, as_of: NaiveDate) -> Vec<DatasetRequest>;

    fn join_plan(&self) -> JoinPlan;

    /// Analyse one joined entity. Errors drop the entity, they never fail
    /// the run.
    fn analyze(&self, entity: &EntityRecords, as_of: NaiveDate) -> Result<Verdict, ScreenError>;

    fn scoring(&self) -> &ScoringModel;

    fn max_results(&self) -> usize;

    /// Persist the ranked table under `screen_<name>` after a run.
    fn cache_output(&self) -> bool {
        true
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ScreenReport {
    pub run_id: String,
    pub screen: String,
    pub as_of: NaiveDate,
    /// Entities that reached scoring.
    pub screened: usize,
    /// Ranked, truncated to the screen's result limit.
    pub candidates: Vec<Candidate>,
    pub dropped: Vec<Dropped>,
    pub stages: Vec<Stage>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Drives screens through fetch, join, analysis and scoring.
pub struct ScreeningPipeline {
    fetcher: ParallelFetcher,
    cache: Option<Arc<CacheStore>>,
    cancel: CancellationToken,
}

impl ScreeningPipeline {
    pub fn new(fetcher: ParallelFetcher, cache: Arc<CacheStore>) -> Self {
        Self {
            fetcher,
            cache: Some(cache),
            cancel: CancellationToken::new(),
        }
    }

    /// Pipeline that always fetches and never persists.
    pub fn without_cache(fetcher: ParallelFetcher) -> Self {
        Self {
            fetcher,
            cache: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute `screen` for the trading date `as_of`.
    pub async fn run(&self, screen: &dyn Screen, as_of: NaiveDate) -> Result<ScreenReport, ScreenError> {
        self.run_until(screen, as_of, None).await
    }

    /// As [`run`](Self::run), failing with `Cancelled` once `deadline` elapses.
    pub async fn run_with_timeout(
        &self,
        screen: &dyn Screen,
        as_of: NaiveDate,
        deadline: Duration,
    ) -> Result<ScreenReport, ScreenError> {
        self.run_until(screen, as_of, Some(deadline)).await
    }

    async fn run_until(
        &self,
        screen: &dyn Screen,
        as_of: NaiveDate,
        deadline: Option<Duration>,
    ) -> Result<ScreenReport, ScreenError> {
        let run_id = Uuid::new_v4().to_string();
        let mut tracker = StageTracker::new(run_id.clone(), screen.name());

        let outcome = match deadline {
            None => self.execute(screen, as_of, &run_id, &mut tracker).await,
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.execute(screen, as_of, &run_id, &mut tracker)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(run_id = %run_id, screen = screen.name(), deadline_secs = deadline.as_secs(), "Screening run timed out");
                        Err(ScreenError::Cancelled(format!(
                            "{} exceeded deadline of {}s",
                            screen.name(),
                            deadline.as_secs()
                        )))
                    }
                }
            }
        };

        match outcome {
            Ok(mut report) => {
                tracker.advance(Stage::Done);
                info!(
                    run_id = %run_id,
                    screen = screen.name(),
                    screened = report.screened,
                    candidates = report.candidates.len(),
                    dropped = report.dropped.len(),
                    "Screening run complete"
                );
                report.stages = tracker.history;
                Ok(report)
            }
            Err(e) => {
                tracker.fail(&e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        screen: &dyn Screen,
        as_of: NaiveDate,
        run_id: &str,
        tracker: &mut StageTracker,
    ) -> Result<ScreenReport, ScreenError> {
        tracker.advance(Stage::Fetching);
        let fetched = self.fetch_stage(screen, as_of).await?;

        tracker.advance(Stage::Joining);
        let joined = join(&fetched, &screen.join_plan());
        let mut dropped = joined.dropped;

        tracker.advance(Stage::Analyzing);
        let mut analyzed = Vec::new();
        for entity in &joined.entities {
            if self.cancel.is_cancelled() {
                return Err(ScreenError::Cancelled(format!("{} cancelled during analysis", screen.name())));
            }
            match screen.analyze(entity, as_of) {
                Ok(Verdict::Keep(result)) => analyzed.push((entity.entity.clone(), result)),
                Ok(Verdict::Reject(reason)) => {
                    debug!(entity = %entity.entity, reason = %reason, "Entity rejected");
                    dropped.push(Dropped {
                        entity: entity.entity.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    debug!(entity = %entity.entity, error = %e, "Entity dropped");
                    dropped.push(Dropped {
                        entity: entity.entity.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracker.advance(Stage::Scoring);
        let model = screen.scoring();
        let scored: Vec<Candidate> = analyzed
            .into_iter()
            .map(|(entity, result)| {
                let scored = model.evaluate(&result.features);
                Candidate {
                    entity,
                    sub_scores: scored.sub_scores,
                    composite: scored.composite,
                    rationale: result.rationale,
                    attributes: result.attributes,
                }
            })
            .collect();
        let screened = scored.len();
        let candidates = rank(scored, screen.max_results());

        if screen.cache_output() {
            self.persist_output(screen.name(), as_of, &candidates);
        }

        Ok(ScreenReport {
            run_id: run_id.to_string(),
            screen: screen.name().to_string(),
            as_of,
            screened,
            candidates,
            dropped,
            stages: Vec::new(),
        })
    }

    async fn fetch_stage(&self, screen: &dyn Screen, as_of: NaiveDate) -> Result<FetchedData, ScreenError> {
        let mut fetched = FetchedData::default();
        for round in 0..MAX_FETCH_ROUNDS {
            let plan = screen.fetch_plan(round, &fetched, as_of);
            if plan.is_empty() {
                break;
            }
            info!(screen = screen.name(), round, requests = plan.len(), "Fetch round");

            let loaded: Vec<Vec<Record>> = stream::iter(plan.iter())
                .map(|request| self.load_dataset(request))
                .buffered(DATASET_CONCURRENCY)
                .try_collect()
                .await?;
            for (request, records) in plan.iter().zip(loaded) {
                fetched.insert(request, records);
            }
        }
        debug!(screen = screen.name(), records = fetched.total_records(), "Fetch stage complete");
        Ok(fetched)
    }

    /// Load one dataset: a fresh cache entry when available, otherwise a
    /// full parallel fetch whose result is written back to the cache.
    pub async fn load_dataset(&self, request: &DatasetRequest) -> Result<Vec<Record>, ScreenError> {
        let key = PartitionKey::for_spec(&request.spec);
        let cache = self.cache.as_ref().zip(request.freshness);

        if let Some((cache, policy)) = cache {
            if let Some(entry) = cache.get(&key) {
                if policy.accepts(&entry, Utc::now()) {
                    debug!(dataset = %request.dataset, partition = %key, rows = entry.records.len(), "Serving from cache");
                    return Ok(entry.records);
                }
                debug!(dataset = %request.dataset, partition = %key, "Cached partition not acceptable; refetching");
            }
        }

        let records = self.fetcher.fetch_all_with(&request.spec, &self.cancel).await?;

        if let Some((cache, _)) = cache {
            if let Err(e) = cache.put(&key, &records) {
                warn!(dataset = %request.dataset, partition = %key, error = %e, "Failed to cache dataset");
            }
        }
        Ok(records)
    }

    fn persist_output(&self, screen: &str, as_of: NaiveDate, candidates: &[Candidate]) {
        let Some(cache) = &self.cache else {
            return;
        };
        let rows: Vec<Record> = candidates
            .iter()
            .filter_map(|c| match serde_json::to_value(c) {
                Ok(Value::Object(row)) => Some(row),
                _ => None,
            })
            .collect();
        let key = output_key(screen, as_of);
        match cache.put(&key, &rows) {
            Ok(rows) => info!(screen, partition = %key, rows, "Screen output cached"),
            Err(e) => warn!(screen, error = %e, "Failed to cache screen output"),
        }
    }
}

/// Partition holding the ranked output of `screen` for `as_of`.
pub fn output_key(screen: &str, as_of: NaiveDate) -> PartitionKey {
    let spec = FetchSpec::new(
        format!("screen_{screen}"),
        [("scan_date", Some(ParamValue::Date(as_of)))],
    )
    .with_partition(PartitionScheme {
        label_param: None,
        bucket_param: Some("scan_date".to_string()),
    })
    .with_identity(RecordIdentity::new(Some("entity"), None));
    PartitionKey::for_spec(&spec)
}
