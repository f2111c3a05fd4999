//! Short-squeeze screen.
//!
//! Finds heavily shorted names (high days-to-cover on the latest settlement)
//! that are fundamentally sound and whose short interest has been building.
//!
//! Round 0 pulls recent settlements filtered server-side on days-to-cover and
//! volume; round 1 pulls ratios and a longer settlement history for the
//! tickers that came back.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use super::fundamentals::{FundamentalFilter, Fundamentals};
use super::latest_by_date;
use super::scoring::{FeatureSpec, Normalizer, ScoringModel};
use super::{days_before, ScreenKind};
use crate::analysis::pct_change;
use crate::engine::join::{EntityRecords, FetchedData, JoinPlan};
use crate::engine::pipeline::{Analyzed, DatasetRequest, Screen, Verdict};
use crate::types::{chunk_tickers, series_from_records, RecordExt, ScreenError, ShortInterestParams, SourceRequest};

const SHORT_INTEREST: &str = "short_interest";
const SI_HISTORY: &str = "si_history";
const RATIOS: &str = "ratios";

/// Market-cap span above the floor that maps onto the full 0-100 scale.
const MARKET_CAP_SPAN: f64 = 5e9;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShortSqueezeOptions {
    pub min_days_to_cover: f64,
    pub min_market_cap: f64,
    pub min_avg_volume: f64,
    pub require_profitability: bool,
    pub require_positive_fcf: bool,
    pub max_debt_to_equity: f64,
    /// Settlements considered for the candidate list.
    pub candidate_lookback_days: i64,
    /// Settlement history used for the short-interest trend.
    pub history_days: i64,
    pub max_results: usize,
    pub cache_output: bool,
    pub weights: BTreeMap<String, Decimal>,
}

impl Default for ShortSqueezeOptions {
    fn default() -> Self {
        Self {
            min_days_to_cover: 5.0,
            min_market_cap: 50e6,
            min_avg_volume: 100_000.0,
            require_profitability: true,
            require_positive_fcf: false,
            max_debt_to_equity: 2.0,
            candidate_lookback_days: 30,
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

pub struct ShortSqueezeScreen {
    options: ShortSqueezeOptions,
    filter: FundamentalFilter,
    model: ScoringModel,
}

impl ShortSqueezeScreen {
    pub fn new(options: ShortSqueezeOptions) -> Result<Self, ScreenError> {
        if !(options.min_days_to_cover >= 0.0) || !(options.min_avg_volume >= 0.0) {
            return Err(ScreenError::Config(
                "min_days_to_cover and min_avg_volume must be non-negative".into(),
            ));
        }
        if options.candidate_lookback_days < 1 || options.history_days < options.candidate_lookback_days {
            return Err(ScreenError::Config(format!(
                "need 1 <= candidate_lookback_days ({}) <= history_days ({})",
                options.candidate_lookback_days, options.history_days
            )));
        }
        if options.max_results == 0 {
            return Err(ScreenError::Config("max_results must be at least 1".into()));
        }

        let filter = FundamentalFilter {
            min_market_cap: options.min_market_cap,
            require_profitability: options.require_profitability,
            require_positive_fcf: options.require_positive_fcf,
            max_debt_to_equity: options.max_debt_to_equity,
        };
        filter.validate()?;

        let model = ScoringModel::new(vec![
            FeatureSpec::new("days_to_cover", Normalizer::Linear { floor: 0.0, cap: 50.0 }, dec!(0.40)),
            FeatureSpec::new(
                "market_cap",
                Normalizer::Linear {
                    floor: options.min_market_cap,
                    cap: options.min_market_cap + MARKET_CAP_SPAN,
                },
                dec!(0.20),
            ),
            FeatureSpec::new("fundamental_health", Normalizer::Clamp, dec!(0.20)),
            FeatureSpec::new("short_interest_trend", Normalizer::Linear { floor: 0.0, cap: 50.0 }, dec!(0.20)),
        ])?
        .with_weights(&options.weights)?;

        Ok(Self { options, filter, model })
    }
}

impl Screen for ShortSqueezeScreen {
    fn name(&self) -> &'static str {
        ScreenKind::ShortSqueeze.name()
    }

    fn fetch_plan(&self, round: usize, fetched: &FetchedData, as_of: NaiveDate) -> Vec<DatasetRequest> {
        match round {
            0 => {
                let request = SourceRequest::ShortInterest(ShortInterestParams {
                    settlement_date_gte: Some(days_before(as_of, self.options.candidate_lookback_days)),
                    days_to_cover_gt: Some(self.options.min_days_to_cover),
                    avg_daily_volume_gt: Some(self.options.min_avg_volume),
                    ..Default::default()
                });
                vec![DatasetRequest::new(SHORT_INTEREST, &request, "ticker")]
            }
            1 => {
                let tickers = fetched.entities(SHORT_INTEREST);
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
                plan
            }
            _ => Vec::new(),
        }
    }

    fn join_plan(&self) -> JoinPlan {
        JoinPlan::new(SHORT_INTEREST).require(RATIOS).optional(SI_HISTORY)
    }

    fn analyze(&self, entity: &EntityRecords, _as_of: NaiveDate) -> Result<Verdict, ScreenError> {
        let latest = latest_by_date(entity.get(SHORT_INTEREST), "settlement_date").ok_or(
            ScreenError::InsufficientData {
                needed: 1,
                available: 0,
            },
        )?;
        let Some(dtc) = latest.f64_field("days_to_cover") else {
            return Ok(Verdict::Reject("days to cover unknown".into()));
        };
        if dtc < self.options.min_days_to_cover {
            return Ok(Verdict::Reject(format!("days to cover {dtc:.1} below minimum")));
        }
        let avg_volume = latest.f64_field("avg_daily_volume").unwrap_or(0.0);
        if avg_volume < self.options.min_avg_volume {
            return Ok(Verdict::Reject(format!("average volume {avg_volume:.0} below minimum")));
        }

        let fundamentals = Fundamentals::latest(entity.get(RATIOS)).unwrap_or_default();
        if let Err(reason) = self.filter.check(&fundamentals) {
            return Ok(Verdict::Reject(reason));
        }

        let mut features = BTreeMap::new();
        features.insert("days_to_cover".to_string(), dtc);
        if let Some(cap) = fundamentals.market_cap {
            features.insert("market_cap".to_string(), cap);
        }
        if fundamentals.return_on_equity.is_some() || fundamentals.current_ratio.is_some() {
            let health = fundamentals.return_on_equity.unwrap_or(0.0) * 100.0
                + fundamentals.current_ratio.unwrap_or(0.0) * 20.0;
            features.insert("fundamental_health".to_string(), health);
        }

        let history = series_from_records(entity.get(SI_HISTORY), "settlement_date", "short_interest");
        let si_trend = pct_change(&history).ok();
        if let Some(pct) = si_trend {
            features.insert("short_interest_trend".to_string(), pct);
        }

        let trend_text = si_trend.map_or_else(|| "SI trend n/a".to_string(), |p| format!("SI {p:+.1}%"));
        let rationale = format!(
            "DTC {dtc:.1} | ${:.2}B cap | D/E {} | {trend_text}",
            fundamentals.market_cap.unwrap_or(0.0) / 1e9,
            fundamentals
                .debt_to_equity
                .map_or_else(|| "n/a".to_string(), |de| format!("{de:.2}")),
        );

        let mut attributes = BTreeMap::new();
        attributes.insert("days_to_cover".to_string(), json!(dtc));
        attributes.insert("avg_daily_volume".to_string(), json!(avg_volume));
        attributes.insert("short_interest".to_string(), json!(latest.f64_field("short_interest")));
        attributes.insert("settlement_date".to_string(), json!(latest.str_field("settlement_date")));
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
