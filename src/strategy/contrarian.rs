//! Contrarian-entry screen.
//!
//! Looks for sustained short-selling pressure (a streak of consecutive days
//! above a short-volume ratio) on names that sit at technical support while
//! short interest keeps rising. Support is any of:
//!
//! - RSI(14) below 30
//! - price within `support_proximity_pct` of the 50- or 200-day SMA
//! - price within 10% of the trailing 52-week low

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use super::fundamentals::{FundamentalFilter, Fundamentals};
use super::scoring::{FeatureSpec, Normalizer, ScoringModel};
use super::{days_before, ScreenKind};
use crate::analysis::indicators::{pct_distance, rsi, sma, trailing_low};
use crate::analysis::{consecutive_runs, pct_change, Run};
use crate::engine::join::{EntityRecords, FetchedData, JoinPlan};
use crate::engine::pipeline::{Analyzed, DatasetRequest, Screen, Verdict};
use crate::types::{
    chunk_tickers, series_from_records, DailyBarsParams, Record, RecordExt, ScreenError,
    ShortInterestParams, ShortVolumeParams, SourceRequest,
};

const SHORT_VOLUME: &str = "short_volume";
const SI_HISTORY: &str = "si_history";
const RATIOS: &str = "ratios";
const BARS: &str = "bars";

/// Calendar days of daily bars requested; covers 252 sessions.
const BAR_HISTORY_DAYS: i64 = 400;
/// Sessions in the 52-week low window.
const YEAR_SESSIONS: usize = 252;
/// Price at or below this multiple of the 52-week low counts as support.
const NEAR_LOW_FACTOR: f64 = 1.10;
const RSI_PERIOD: usize = 14;
const RSI_OVERSOLD: f64 = 30.0;
/// Short-volume rows per page; the daily feed is large.
const SHORT_VOLUME_PAGE_SIZE: u32 = 5000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContrarianOptions {
    /// Percent of daily volume sold short for a day to count.
    pub min_short_volume_ratio: f64,
    pub min_consecutive_days: usize,
    pub lookback_days: i64,
    pub support_proximity_pct: f64,
    pub min_market_cap: f64,
    pub require_profitability: bool,
    pub require_positive_fcf: bool,
    pub max_debt_to_equity: f64,
    pub history_days: i64,
    pub max_results: usize,
    pub cache_output: bool,
    pub weights: BTreeMap<String, Decimal>,
}

impl Default for ContrarianOptions {
    fn default() -> Self {
        Self {
            min_short_volume_ratio: 60.0,
            min_consecutive_days: 3,
            lookback_days: 30,
            support_proximity_pct: 5.0,
            min_market_cap: 50e6,
            require_profitability: false,
            require_positive_fcf: false,
            max_debt_to_equity: 3.0,
            history_days: 180,
            max_results: 50,
            cache_output: true,
            weights: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Screen
// ---------------------------------------------------------------------------

pub struct ContrarianScreen {
    options: ContrarianOptions,
    filter: FundamentalFilter,
    model: ScoringModel,
}

impl ContrarianScreen {
    pub fn new(options: ContrarianOptions) -> Result<Self, ScreenError> {
        if !(0.0..=100.0).contains(&options.min_short_volume_ratio) {
            return Err(ScreenError::Config(format!(
                "min_short_volume_ratio must be a percentage, got {}",
                options.min_short_volume_ratio
            )));
        }
        if options.min_consecutive_days == 0 || options.lookback_days < options.min_consecutive_days as i64 {
            return Err(ScreenError::Config(format!(
                "need 1 <= min_consecutive_days ({}) <= lookback_days ({})",
                options.min_consecutive_days, options.lookback_days
            )));
        }
        if !(options.support_proximity_pct > 0.0) {
            return Err(ScreenError::Config("support_proximity_pct must be positive".into()));
        }
        if options.history_days < 1 || options.max_results == 0 {
            return Err(ScreenError::Config(
                "history_days and max_results must be at least 1".into(),
            ));
        }

        let filter = FundamentalFilter {
            min_market_cap: options.min_market_cap,
            require_profitability: options.require_profitability,
            require_positive_fcf: options.require_positive_fcf,
            max_debt_to_equity: options.max_debt_to_equity,
        };
        filter.validate()?;

        let model = ScoringModel::new(vec![
            FeatureSpec::new("consecutive_days", Normalizer::Linear { floor: 0.0, cap: 10.0 }, dec!(0.35)),
            FeatureSpec::new("short_interest_trend", Normalizer::Linear { floor: 0.0, cap: 50.0 }, dec!(0.25)),
            FeatureSpec::new("support_count", Normalizer::Linear { floor: 0.0, cap: 4.0 }, dec!(0.25)),
            FeatureSpec::new(
                "avg_short_volume_ratio",
                Normalizer::Linear {
                    floor: options.min_short_volume_ratio,
                    cap: 80.0,
                },
                dec!(0.15),
            ),
        ])?
        .with_weights(&options.weights)?;

        Ok(Self { options, filter, model })
    }

    /// Most recent qualifying short-volume streak.
    fn latest_streak<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Option<Run> {
        let series = series_from_records(records, "date", "short_volume_ratio");
        let threshold = self.options.min_short_volume_ratio;
        consecutive_runs(&series, |ratio| ratio > threshold, self.options.min_consecutive_days).pop()
    }

    /// Support levels the latest close sits at, as display labels.
    fn supports(&self, closes: &[f64], lows: &[f64]) -> Vec<String> {
        let Some(&price) = closes.last() else {
            return Vec::new();
        };
        let mut found = Vec::new();
        if let Some(value) = rsi(closes, RSI_PERIOD).filter(|v| *v < RSI_OVERSOLD) {
            found.push(format!("RSI {value:.0}"));
        }
        for period in [50, 200] {
            let near = sma(closes, period)
                .and_then(|avg| pct_distance(price, avg))
                .is_some_and(|d| d <= self.options.support_proximity_pct);
            if near {
                found.push(format!("near {period}d SMA"));
            }
        }
        if trailing_low(lows, YEAR_SESSIONS).is_some_and(|low| price <= low * NEAR_LOW_FACTOR) {
            found.push("near 52w low".to_string());
        }
        found
    }
}

impl Screen for ContrarianScreen {
    fn name(&self) -> &'static str {
        ScreenKind::ContrarianEntry.name()
    }

    fn fetch_plan(&self, round: usize, fetched: &FetchedData, as_of: NaiveDate) -> Vec<DatasetRequest> {
        match round {
            0 => {
                let request = SourceRequest::ShortVolume(ShortVolumeParams {
                    date_gte: Some(days_before(as_of, self.options.lookback_days)),
                    date_lte: Some(as_of),
                    short_volume_ratio_gt: Some(self.options.min_short_volume_ratio),
                    ..Default::default()
                });
                vec![DatasetRequest::new(SHORT_VOLUME, &request, "ticker").with_page_size(SHORT_VOLUME_PAGE_SIZE)]
            }
            1 => {
                let mut by_ticker: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
                for record in fetched.records(SHORT_VOLUME) {
                    if let Some(ticker) = record.str_field("ticker") {
                        by_ticker.entry(ticker).or_default().push(record);
                    }
                }
                let tickers: Vec<String> = by_ticker
                    .into_iter()
                    .filter(|(_, rows)| self.latest_streak(rows.iter().copied()).is_some())
                    .map(|(ticker, _)| ticker.to_string())
                    .collect();

                let history_from = days_before(as_of, self.options.history_days);
                let mut plan: Vec<DatasetRequest> = self
                    .filter
                    .ratios_requests(&tickers)
                    .iter()
                    .map(|r| DatasetRequest::new(RATIOS, r, "ticker"))
                    .collect();
                plan.extend(chunk_tickers(&tickers).into_iter().map(|chunk| {
                    let request = SourceRequest::ShortInterest(ShortInterestParams {
                        tickers: Some(chunk),
                        settlement_date_gte: Some(history_from),
                        ..Default::default()
                    });
                    DatasetRequest::new(SI_HISTORY, &request, "ticker")
                }));
                let bars_from = days_before(as_of, BAR_HISTORY_DAYS);
                plan.extend(tickers.iter().map(|ticker| {
                    let request = SourceRequest::DailyBars(DailyBarsParams {
                        ticker: ticker.clone(),
                        from: bars_from,
                        to: as_of,
                    });
                    DatasetRequest::new(BARS, &request, "ticker").for_entity(ticker)
                }));
                plan
            }
            _ => Vec::new(),
        }
    }

    fn join_plan(&self) -> JoinPlan {
        JoinPlan::new(BARS)
            .require(SHORT_VOLUME)
            .require(RATIOS)
            .require(SI_HISTORY)
    }

    fn analyze(&self, entity: &EntityRecords, _as_of: NaiveDate) -> Result<Verdict, ScreenError> {
        let Some(streak) = self.latest_streak(entity.get(SHORT_VOLUME)) else {
            return Ok(Verdict::Reject("no short-volume streak".into()));
        };

        let history = series_from_records(entity.get(SI_HISTORY), "settlement_date", "short_interest");
        let si_trend = pct_change(&history)?;
        if si_trend <= 0.0 {
            return Ok(Verdict::Reject(format!("short interest not rising ({si_trend:+.1}%)")));
        }

        let fundamentals = Fundamentals::latest(entity.get(RATIOS)).unwrap_or_default();
        if let Err(reason) = self.filter.check(&fundamentals) {
            return Ok(Verdict::Reject(reason));
        }

        let closes: Vec<f64> = series_from_records(entity.get(BARS), "t", "c")
            .into_iter()
            .map(|p| p.value)
            .collect();
        let lows: Vec<f64> = series_from_records(entity.get(BARS), "t", "l")
            .into_iter()
            .map(|p| p.value)
            .collect();
        if closes.len() < RSI_PERIOD + 1 {
            return Err(ScreenError::InsufficientData {
                needed: RSI_PERIOD + 1,
                available: closes.len(),
            });
        }
        let supports = self.supports(&closes, &lows);
        if supports.is_empty() {
            return Ok(Verdict::Reject("not at support".into()));
        }

        let mut features = BTreeMap::new();
        features.insert("consecutive_days".to_string(), streak.length as f64);
        features.insert("short_interest_trend".to_string(), si_trend);
        features.insert("support_count".to_string(), supports.len() as f64);
        features.insert("avg_short_volume_ratio".to_string(), streak.mean);

        let rationale = format!(
            "{} days >{:.0}% SV (avg {:.1}%) | {} | SI {si_trend:+.1}%",
            streak.length,
            self.options.min_short_volume_ratio,
            streak.mean,
            supports.join(", "),
        );

        let mut attributes = BTreeMap::new();
        attributes.insert("streak_start".to_string(), json!(streak.start));
        attributes.insert("streak_end".to_string(), json!(streak.end));
        attributes.insert("price".to_string(), json!(closes.last()));
        attributes.insert("supports".to_string(), json!(supports));
        attributes.insert("market_cap".to_string(), json!(fundamentals.market_cap));

        Ok(Verdict::Keep(Analyzed {
            features,
            rationale,
            attributes,
        }))
    }

    fn scoring(&self) -> &ScoringModel {
        &self.model
    }

    fn max_results(&self) -> usize {
        self.options.max_results
    }

    fn cache_output(&self) -> bool {
        self.options.cache_output
    }
}
