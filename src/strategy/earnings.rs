//! Earnings short-setup screen.
//!
//! For tickers reporting within the next few weeks, classifies the recent
//! short-volume pattern and maps it onto a trading scenario. Strong, clean
//! patterns close to the report date on sound fundamentals rank highest.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use super::fundamentals::{FundamentalFilter, Fundamentals};
use super::scoring::{FeatureSpec, Normalizer, ScoringModel};
use super::{days_after, days_before, ScreenKind};
use crate::analysis::{classify_pattern, Pattern, PatternReading, PatternThresholds};
use crate::engine::join::{EntityRecords, FetchedData, JoinPlan};
use crate::engine::pipeline::{Analyzed, DatasetRequest, Screen, Verdict};
use crate::types::{
    chunk_tickers, series_from_records, EarningsCalendarParams, RecordExt, ScreenError,
    ShortVolumeParams, SourceRequest,
};

const EARNINGS: &str = "earnings";
const SHORT_VOLUME: &str = "short_volume";
const RATIOS: &str = "ratios";

const MAX_EARNINGS_WINDOW_DAYS: i64 = 60;
/// Days before the report at which proximity stops scoring.
const PROXIMITY_HORIZON_DAYS: f64 = 30.0;
const SHORT_VOLUME_PAGE_SIZE: u32 = 5000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EarningsSetupOptions {
    pub earnings_window_days: i64,
    /// Minimum mean short-volume ratio over the pattern window.
    pub min_short_volume_ratio: f64,
    pub min_pattern_strength: f64,
    pub lookback_days: i64,
    pub trend_window: usize,
    pub min_points: usize,
    pub slope_threshold: f64,
    pub reversal_threshold: f64,
    pub volatility_cap: f64,
    pub min_market_cap: f64,
    pub require_profitability: bool,
    pub require_positive_fcf: bool,
    pub max_debt_to_equity: f64,
    pub max_results: usize,
    pub cache_output: bool,
    pub weights: BTreeMap<String, Decimal>,
}

impl Default for EarningsSetupOptions {
    fn default() -> Self {
        let thresholds = PatternThresholds::default();
        Self {
            earnings_window_days: 21,
            min_short_volume_ratio: 55.0,
            min_pattern_strength: 30.0,
            lookback_days: 30,
            trend_window: thresholds.window,
            min_points: thresholds.min_points,
            slope_threshold: thresholds.slope,
            reversal_threshold: thresholds.reversal,
            volatility_cap: thresholds.volatility_cap,
            min_market_cap: 50e6,
            require_profitability: false,
            require_positive_fcf: false,
            max_debt_to_equity: 3.0,
            max_results: 50,
            cache_output: true,
            weights: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Trading scenario and suggested setup for a pattern.
pub fn classify_scenario(pattern: Pattern, mean_ratio: f64) -> (&'static str, &'static str) {
    match pattern {
        Pattern::Accelerating if mean_ratio > 55.0 => ("high_buildup", "straddle"),
        Pattern::Accelerating => ("moderate_buildup", "slight_volatility"),
        Pattern::Decelerating if mean_ratio < 45.0 => ("declining_shorts", "bullish_if_beat"),
        Pattern::Decelerating => ("moderate_decline", "slight_bullish"),
        Pattern::ReversalUp => ("reversal_shorts_covering", "bullish_directional"),
        Pattern::ReversalDown => ("reversal_shorts_building", "bearish_or_puts"),
        Pattern::Steady => ("normal", "fundamentals_only"),
    }
}

/// Mean of the available quality components, each on 0-100.
fn fundamental_quality(f: &Fundamentals) -> Option<f64> {
    let parts: Vec<f64> = [
        f.earnings_per_share.map(|eps| if eps > 0.0 { 100.0 } else { 0.0 }),
        f.debt_to_equity.map(|de| (100.0 * (1.0 - de / 5.0)).clamp(0.0, 100.0)),
        f.market_cap.map(|cap| (cap / 1e9 * 50.0).min(100.0)),
    ]
    .into_iter()
    .flatten()
    .collect();
    (!parts.is_empty()).then(|| parts.iter().sum::<f64>() / parts.len() as f64)
}

/// How far the short-volume level and slope are from neutral, on 0-100.
fn short_trend_magnitude(reading: &PatternReading) -> f64 {
    let level = ((reading.mean - 50.0) / 20.0 * 100.0).clamp(0.0, 100.0);
    let slope = (reading.slope.abs() / 5.0 * 100.0).min(100.0);
    (level + slope) / 2.0
}

// ---------------------------------------------------------------------------
// Screen
// ---------------------------------------------------------------------------

pub struct EarningsSetupScreen {
    options: EarningsSetupOptions,
    thresholds: PatternThresholds,
    filter: FundamentalFilter,
    model: ScoringModel,
}

impl EarningsSetupScreen {
    pub fn new(options: EarningsSetupOptions) -> Result<Self, ScreenError> {
        if !(1..=MAX_EARNINGS_WINDOW_DAYS).contains(&options.earnings_window_days) {
            return Err(ScreenError::Config(format!(
                "earnings_window_days must be within 1..={MAX_EARNINGS_WINDOW_DAYS}, got {}",
                options.earnings_window_days
            )));
        }
        if !(0.0..=100.0).contains(&options.min_pattern_strength)
            || !(0.0..=100.0).contains(&options.min_short_volume_ratio)
        {
            return Err(ScreenError::Config(
                "min_pattern_strength and min_short_volume_ratio must be within 0..=100".into(),
            ));
        }
        if options.lookback_days < options.min_points as i64 || options.max_results == 0 {
            return Err(ScreenError::Config(format!(
                "lookback_days ({}) must cover min_points ({}) and max_results must be at least 1",
                options.lookback_days, options.min_points
            )));
        }

        let thresholds = PatternThresholds {
            window: options.trend_window,
            min_points: options.min_points,
            slope: options.slope_threshold,
            reversal: options.reversal_threshold,
            volatility_cap: options.volatility_cap,
        };
        thresholds.validate()?;

        let filter = FundamentalFilter {
            min_market_cap: options.min_market_cap,
            require_profitability: options.require_profitability,
            require_positive_fcf: options.require_positive_fcf,
            max_debt_to_equity: options.max_debt_to_equity,
        };
        filter.validate()?;

        let model = ScoringModel::new(vec![
            FeatureSpec::new("pattern_strength", Normalizer::Clamp, dec!(0.40)),
            FeatureSpec::new(
                "earnings_proximity",
                Normalizer::Linear {
                    floor: PROXIMITY_HORIZON_DAYS,
                    cap: 0.0,
                },
                dec!(0.25),
            ),
            FeatureSpec::new("fundamental_quality", Normalizer::Clamp, dec!(0.20)),
            FeatureSpec::new("short_trend_magnitude", Normalizer::Clamp, dec!(0.15)),
        ])?
        .with_weights(&options.weights)?;

        Ok(Self {
            options,
            thresholds,
            filter,
            model,
        })
    }
}

impl Screen for EarningsSetupScreen {
    fn name(&self) -> &'static str {
        ScreenKind::EarningsShortSetup.name()
    }

    fn fetch_plan(&self, round: usize, fetched: &FetchedData, as_of: NaiveDate) -> Vec<DatasetRequest> {
        match round {
            0 => {
                let request = SourceRequest::EarningsCalendar(EarningsCalendarParams {
                    date_gte: Some(as_of),
                    date_lte: Some(days_after(as_of, self.options.earnings_window_days)),
                    ..Default::default()
                });
                vec![DatasetRequest::new(EARNINGS, &request, "ticker")]
            }
            1 => {
                let tickers = fetched.entities(EARNINGS);
                let from = days_before(as_of, self.options.lookback_days);
                let mut plan: Vec<DatasetRequest> = chunk_tickers(&tickers)
                    .into_iter()
                    .map(|chunk| {
                        let request = SourceRequest::ShortVolume(ShortVolumeParams {
                            tickers: Some(chunk),
                            date_gte: Some(from),
                            date_lte: Some(as_of),
                            ..Default::default()
                        });
                        DatasetRequest::new(SHORT_VOLUME, &request, "ticker").with_page_size(SHORT_VOLUME_PAGE_SIZE)
                    })
                    .collect();
                plan.extend(
                    self.filter
                        .ratios_requests(&tickers)
                        .iter()
                        .map(|r| DatasetRequest::new(RATIOS, r, "ticker")),
                );
                plan
            }
            _ => Vec::new(),
        }
    }

    fn join_plan(&self) -> JoinPlan {
        JoinPlan::new(EARNINGS).require(SHORT_VOLUME).require(RATIOS)
    }

    fn analyze(&self, entity: &EntityRecords, as_of: NaiveDate) -> Result<Verdict, ScreenError> {
        let window_end = days_after(as_of, self.options.earnings_window_days);
        let Some(report_date) = entity
            .get(EARNINGS)
            .iter()
            .filter_map(|r| r.date_field("date"))
            .filter(|d| *d >= as_of && *d <= window_end)
            .min()
        else {
            return Ok(Verdict::Reject("no earnings date in window".into()));
        };
        let days_to_earnings = (report_date - as_of).num_days();

        let series = series_from_records(entity.get(SHORT_VOLUME), "date", "short_volume_ratio");
        let reading = classify_pattern(&series, &self.thresholds)?;
        if reading.strength < self.options.min_pattern_strength {
            return Ok(Verdict::Reject(format!("pattern strength {:.1} too weak", reading.strength)));
        }
        if reading.mean < self.options.min_short_volume_ratio {
            return Ok(Verdict::Reject(format!("short volume {:.1}% below minimum", reading.mean)));
        }

        let fundamentals = Fundamentals::latest(entity.get(RATIOS)).unwrap_or_default();
        if let Err(reason) = self.filter.check(&fundamentals) {
            return Ok(Verdict::Reject(reason));
        }

        let (scenario, setup) = classify_scenario(reading.pattern, reading.mean);

        let mut features = BTreeMap::new();
        features.insert("pattern_strength".to_string(), reading.strength);
        features.insert("earnings_proximity".to_string(), days_to_earnings as f64);
        if let Some(quality) = fundamental_quality(&fundamentals) {
            features.insert("fundamental_quality".to_string(), quality);
        }
        features.insert("short_trend_magnitude".to_string(), short_trend_magnitude(&reading));

        let rationale = format!(
            "{} pattern | {scenario} | {setup} | {days_to_earnings}d to earnings | {:.1}% avg SV",
            reading.pattern, reading.mean
        );

        let mut attributes = BTreeMap::new();
        attributes.insert("earnings_date".to_string(), json!(report_date));
        attributes.insert("days_to_earnings".to_string(), json!(days_to_earnings));
        attributes.insert("pattern".to_string(), json!(reading.pattern));
        attributes.insert("scenario".to_string(), json!(scenario));
        attributes.insert("setup".to_string(), json!(setup));
        attributes.insert("slope".to_string(), json!(reading.slope));
        attributes.insert("r_squared".to_string(), json!(reading.r_squared));

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
