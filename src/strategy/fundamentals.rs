//! Fundamental-health filter shared by every screen.
//!
//! Thresholds are sent API-side as request filters to shrink the ratios
//! download, then re-checked locally against the newest ratios row so a
//! cached or loosely filtered response cannot leak through.

use chrono::NaiveDate;
use serde::Serialize;

use crate::types::{chunk_tickers, Record, RecordExt, ScreenError, SourceRequest, StockRatiosParams};

/// Point-in-time fundamentals for one ticker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Fundamentals {
    pub date: Option<NaiveDate>,
    pub market_cap: Option<f64>,
    pub earnings_per_share: Option<f64>,
    pub free_cash_flow: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub current_ratio: Option<f64>,
    pub return_on_equity: Option<f64>,
}

impl Fundamentals {
    pub fn from_record(record: &Record) -> Self {
        Self {
            date: record.date_field("date"),
            market_cap: record.f64_field("market_cap"),
            earnings_per_share: record.f64_field("earnings_per_share"),
            free_cash_flow: record.f64_field("free_cash_flow"),
            debt_to_equity: record.f64_field("debt_to_equity"),
            current_ratio: record.f64_field("current"),
            return_on_equity: record.f64_field("return_on_equity"),
        }
    }

    /// Newest row of a ticker's ratios history.
    pub fn latest(records: &[Record]) -> Option<Self> {
        records
            .iter()
            .map(Self::from_record)
            .max_by_key(|f| f.date)
    }
}

/// Minimum financial-health requirements.
#[derive(Debug, Clone, PartialEq)]
pub struct FundamentalFilter {
    pub min_market_cap: f64,
    pub require_profitability: bool,
    pub require_positive_fcf: bool,
    pub max_debt_to_equity: f64,
}

impl FundamentalFilter {
    pub fn validate(&self) -> Result<(), ScreenError> {
        if !(self.min_market_cap >= 0.0) {
            return Err(ScreenError::Config(format!(
                "min_market_cap must be non-negative, got {}",
                self.min_market_cap
            )));
        }
        if !(self.max_debt_to_equity > 0.0) {
            return Err(ScreenError::Config(format!(
                "max_debt_to_equity must be positive, got {}",
                self.max_debt_to_equity
            )));
        }
        Ok(())
    }

    /// Ratios queries for `tickers`, batched and filtered server-side.
    pub fn ratios_requests(&self, tickers: &[String]) -> Vec<SourceRequest> {
        chunk_tickers(tickers)
            .into_iter()
            .map(|chunk| {
                SourceRequest::StockRatios(StockRatiosParams {
                    tickers: Some(chunk),
                    market_cap_gte: Some(self.min_market_cap),
                    earnings_per_share_gt: self.require_profitability.then_some(0.0),
                    free_cash_flow_gt: self.require_positive_fcf.then_some(0.0),
                    debt_to_equity_lte: Some(self.max_debt_to_equity),
                })
            })
            .collect()
    }

    /// Local re-check. `Err` carries the rejection reason.
    pub fn check(&self, f: &Fundamentals) -> Result<(), String> {
        match f.market_cap {
            Some(cap) if cap >= self.min_market_cap => {}
            Some(cap) => return Err(format!("market cap {:.0} below {:.0}", cap, self.min_market_cap)),
            None => return Err("market cap unknown".to_string()),
        }
        if self.require_profitability && !f.earnings_per_share.is_some_and(|eps| eps > 0.0) {
            return Err("not profitable".to_string());
        }
        if self.require_positive_fcf && !f.free_cash_flow.is_some_and(|fcf| fcf > 0.0) {
            return Err("negative free cash flow".to_string());
        }
        if let Some(de) = f.debt_to_equity {
            if de > self.max_debt_to_equity {
                return Err(format!("debt/equity {de:.2} above {:.2}", self.max_debt_to_equity));
            }
        }
        Ok(())
    }
}
