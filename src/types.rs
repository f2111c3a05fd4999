//! Core data types for SCREENER.
//!
//! Records flow from a `PageSource` through the fetch orchestrator and the
//! partitioned cache into the screening pipeline. Everything here is plain
//! data: no I/O happens in this module.

use chrono::{DateTime, Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::storage::{EmptyResultPolicy, FreshnessPolicy};

/// Upper bound on symbols per `ticker.any_of` request.
pub const MAX_TICKERS_PER_REQUEST: usize = 250;

// ---------------------------------------------------------------------------
// Records and pages
// ---------------------------------------------------------------------------

/// One row returned by a remote method. Schemaless key/value map.
pub type Record = Map<String, Value>;

/// Typed field access on a [`Record`].
pub trait RecordExt {
    fn str_field(&self, field: &str) -> Option<&str>;

    /// Numeric field. Accepts JSON numbers and numeric strings.
    fn f64_field(&self, field: &str) -> Option<f64>;

    /// Date field. Accepts `YYYY-MM-DD` (optionally followed by a time) and
    /// epoch milliseconds.
    fn date_field(&self, field: &str) -> Option<NaiveDate>;
}

impl RecordExt for Record {
    fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    fn f64_field(&self, field: &str) -> Option<f64> {
        let value = match self.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }

    fn date_field(&self, field: &str) -> Option<NaiveDate> {
        match self.get(field)? {
            Value::String(s) => {
                let day = s.get(..10)?;
                NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
            }
            Value::Number(n) => {
                let millis = n.as_i64()?;
                DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
            }
            _ => None,
        }
    }
}

/// Opaque continuation token handed back by the remote source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a paginated response. `next == None` means last page.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    pub next: Option<Cursor>,
}

impl Page {
    pub fn terminal(records: Vec<Record>) -> Self {
        Self { records, next: None }
    }

    pub fn with_next(records: Vec<Record>, next: impl Into<String>) -> Self {
        Self {
            records,
            next: Some(Cursor(next.into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

/// A single request parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Str(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            ParamValue::Date(d) => Some(*d),
            ParamValue::Str(s) => s
                .get(..10)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            ParamValue::Str(s) => f.write_str(s),
            ParamValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(v: NaiveDate) -> Self {
        ParamValue::Date(v)
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::List(v)
    }
}

/// Drop unset parameters and canonicalise the rest.
///
/// Pure: identical logical parameter sets always produce identical maps,
/// whatever order they were supplied in. List values are sorted and
/// de-duplicated; empty lists count as unset.
pub fn normalize_params<K, I>(params: I) -> BTreeMap<String, ParamValue>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Option<ParamValue>)>,
{
    params
        .into_iter()
        .filter_map(|(name, value)| {
            let value = match value? {
                ParamValue::List(items) => {
                    let unique: BTreeSet<String> = items.into_iter().collect();
                    if unique.is_empty() {
                        return None;
                    }
                    ParamValue::List(unique.into_iter().collect())
                }
                other => other,
            };
            Some((name.into(), value))
        })
        .collect()
}

/// Which parameters name the partition label and date bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionScheme {
    pub label_param: Option<String>,
    pub bucket_param: Option<String>,
}

/// Fields that identify one logical row: used to de-duplicate on write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub entity_field: Option<String>,
    pub timestamp_field: Option<String>,
}

impl RecordIdentity {
    pub fn new(entity_field: Option<&str>, timestamp_field: Option<&str>) -> Self {
        Self {
            entity_field: entity_field.map(str::to_string),
            timestamp_field: timestamp_field.map(str::to_string),
        }
    }

    /// Identity tuple for a record, or `None` when no identity is declared.
    pub fn key_of(&self, record: &Record) -> Option<(String, String)> {
        if self.entity_field.is_none() && self.timestamp_field.is_none() {
            return None;
        }
        let render = |field: &Option<String>| {
            field
                .as_deref()
                .and_then(|f| record.get(f))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        Some((render(&self.entity_field), render(&self.timestamp_field)))
    }
}

// ---------------------------------------------------------------------------
// Typed source requests
// ---------------------------------------------------------------------------

/// Short-interest settlements (bi-monthly).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShortInterestParams {
    pub ticker: Option<String>,
    pub tickers: Option<Vec<String>>,
    pub settlement_date_gte: Option<NaiveDate>,
    pub days_to_cover_gt: Option<f64>,
    pub avg_daily_volume_gt: Option<f64>,
}

/// Daily short-volume ratios.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShortVolumeParams {
    pub ticker: Option<String>,
    pub tickers: Option<Vec<String>>,
    pub date_gte: Option<NaiveDate>,
    pub date_lte: Option<NaiveDate>,
    pub short_volume_ratio_gt: Option<f64>,
}

/// Point-in-time fundamental ratios.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StockRatiosParams {
    pub tickers: Option<Vec<String>>,
    pub market_cap_gte: Option<f64>,
    pub earnings_per_share_gt: Option<f64>,
    pub free_cash_flow_gt: Option<f64>,
    pub debt_to_equity_lte: Option<f64>,
}

/// Daily OHLCV bars for one ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyBarsParams {
    pub ticker: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Scheduled earnings reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EarningsCalendarParams {
    pub tickers: Option<Vec<String>>,
    pub date_gte: Option<NaiveDate>,
    pub date_lte: Option<NaiveDate>,
}

/// A remote query, one variant per remote method.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRequest {
    ShortInterest(ShortInterestParams),
    ShortVolume(ShortVolumeParams),
    StockRatios(StockRatiosParams),
    DailyBars(DailyBarsParams),
    EarningsCalendar(EarningsCalendarParams),
}

impl SourceRequest {
    pub fn method(&self) -> &'static str {
        match self {
            SourceRequest::ShortInterest(_) => "list_short_interest",
            SourceRequest::ShortVolume(_) => "list_short_volume",
            SourceRequest::StockRatios(_) => "list_stock_ratios",
            SourceRequest::DailyBars(_) => "list_aggs",
            SourceRequest::EarningsCalendar(_) => "list_earnings",
        }
    }

    /// Raw parameters, unset ones included.
    fn raw_params(&self) -> Vec<(&'static str, Option<ParamValue>)> {
        match self {
            SourceRequest::ShortInterest(p) => vec![
                ("ticker", p.ticker.clone().map(Into::into)),
                ("ticker.any_of", p.tickers.clone().map(Into::into)),
                ("settlement_date.gte", p.settlement_date_gte.map(Into::into)),
                ("days_to_cover.gt", p.days_to_cover_gt.map(Into::into)),
                ("avg_daily_volume.gt", p.avg_daily_volume_gt.map(Into::into)),
            ],
            SourceRequest::ShortVolume(p) => vec![
                ("ticker", p.ticker.clone().map(Into::into)),
                ("ticker.any_of", p.tickers.clone().map(Into::into)),
                ("date.gte", p.date_gte.map(Into::into)),
                ("date.lte", p.date_lte.map(Into::into)),
                ("short_volume_ratio.gt", p.short_volume_ratio_gt.map(Into::into)),
            ],
            SourceRequest::StockRatios(p) => vec![
                ("ticker.any_of", p.tickers.clone().map(Into::into)),
                ("market_cap.gte", p.market_cap_gte.map(Into::into)),
                ("earnings_per_share.gt", p.earnings_per_share_gt.map(Into::into)),
                ("free_cash_flow.gt", p.free_cash_flow_gt.map(Into::into)),
                ("debt_to_equity.lte", p.debt_to_equity_lte.map(Into::into)),
            ],
            SourceRequest::DailyBars(p) => vec![
                ("ticker", Some(p.ticker.clone().into())),
                ("from", Some(p.from.into())),
                ("to", Some(p.to.into())),
                ("adjusted", Some(true.into())),
                ("sort", Some("asc".into())),
            ],
            SourceRequest::EarningsCalendar(p) => vec![
                ("ticker.any_of", p.tickers.clone().map(Into::into)),
                ("date.gte", p.date_gte.map(Into::into)),
                ("date.lte", p.date_lte.map(Into::into)),
            ],
        }
    }

    fn partition_scheme(&self) -> PartitionScheme {
        let (label, bucket) = match self {
            SourceRequest::ShortInterest(p) => (
                if p.ticker.is_some() { "ticker" } else { "ticker.any_of" },
                Some("settlement_date.gte"),
            ),
            SourceRequest::ShortVolume(p) => (
                if p.ticker.is_some() { "ticker" } else { "ticker.any_of" },
                Some("date.gte"),
            ),
            SourceRequest::StockRatios(_) => ("ticker.any_of", None),
            SourceRequest::DailyBars(_) => ("ticker", Some("from")),
            SourceRequest::EarningsCalendar(_) => ("ticker.any_of", Some("date.gte")),
        };
        PartitionScheme {
            label_param: Some(label.to_string()),
            bucket_param: bucket.map(str::to_string),
        }
    }

    fn identity(&self) -> RecordIdentity {
        match self {
            SourceRequest::ShortInterest(_) => {
                RecordIdentity::new(Some("ticker"), Some("settlement_date"))
            }
            SourceRequest::ShortVolume(_) => RecordIdentity::new(Some("ticker"), Some("date")),
            SourceRequest::StockRatios(_) => RecordIdentity::new(Some("ticker"), Some("date")),
            SourceRequest::DailyBars(_) => RecordIdentity::new(None, Some("t")),
            SourceRequest::EarningsCalendar(_) => {
                RecordIdentity::new(Some("ticker"), Some("date"))
            }
        }
    }

    /// Default cache freshness for this kind of data.
    ///
    /// Short positioning data is published on a fixed schedule, so an empty
    /// result is a real answer. Reference data and calendars are expected to
    /// be non-empty; an empty cached copy is refetched.
    pub fn freshness(&self) -> FreshnessPolicy {
        match self {
            SourceRequest::ShortInterest(_) => {
                FreshnessPolicy::hours(72, EmptyResultPolicy::CacheEmpty)
            }
            SourceRequest::ShortVolume(_) => {
                FreshnessPolicy::hours(12, EmptyResultPolicy::CacheEmpty)
            }
            SourceRequest::StockRatios(_) => FreshnessPolicy::hours(24, EmptyResultPolicy::Refetch),
            SourceRequest::DailyBars(_) => FreshnessPolicy::hours(4, EmptyResultPolicy::Refetch),
            SourceRequest::EarningsCalendar(_) => {
                FreshnessPolicy::hours(24, EmptyResultPolicy::Refetch)
            }
        }
    }
}

/// Split a symbol list into request-sized batches.
pub fn chunk_tickers(tickers: &[String]) -> Vec<Vec<String>> {
    tickers
        .chunks(MAX_TICKERS_PER_REQUEST)
        .map(<[String]>::to_vec)
        .collect()
}

// ---------------------------------------------------------------------------
// Fetch specification
// ---------------------------------------------------------------------------

/// Fully described remote query: method, normalised parameters and paging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub method: String,
    params: BTreeMap<String, ParamValue>,
    pub page_size: Option<u32>,
    pub fetch_all: bool,
    pub partition: PartitionScheme,
    pub identity: RecordIdentity,
}

impl FetchSpec {
    /// Ad-hoc spec for arbitrary methods. Unset parameters are dropped.
    pub fn new<K, I>(method: impl Into<String>, params: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Option<ParamValue>)>,
    {
        Self {
            method: method.into(),
            params: normalize_params(params),
            page_size: None,
            fetch_all: true,
            partition: PartitionScheme::default(),
            identity: RecordIdentity::default(),
        }
    }

    pub fn from_request(request: &SourceRequest) -> Self {
        Self {
            method: request.method().to_string(),
            params: normalize_params(request.raw_params()),
            page_size: None,
            fetch_all: true,
            partition: request.partition_scheme(),
            identity: request.identity(),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Only fetch the first page; continuation cursors are ignored.
    pub fn first_page_only(mut self) -> Self {
        self.fetch_all = false;
        self
    }

    pub fn with_partition(mut self, partition: PartitionScheme) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_identity(mut self, identity: RecordIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Normalised parameters, sorted by name.
    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }
}

// ---------------------------------------------------------------------------
// Analysis inputs and outputs
// ---------------------------------------------------------------------------

/// One observation of a daily series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

/// Build a date-ordered series from records. Rows missing either field are
/// skipped; duplicate dates keep the last value seen.
pub fn series_from_records<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    date_field: &str,
    value_field: &str,
) -> Vec<SeriesPoint> {
    let by_date: BTreeMap<NaiveDate, f64> = records
        .into_iter()
        .filter_map(|r| Some((r.date_field(date_field)?, r.f64_field(value_field)?)))
        .collect();
    by_date
        .into_iter()
        .map(|(date, value)| SeriesPoint { date, value })
        .collect()
}

/// The trading day after `date` (weekends skipped, holidays not modelled).
pub fn next_weekday(date: NaiveDate) -> Option<NaiveDate> {
    let mut next = date.succ_opt()?;
    while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
        next = next.succ_opt()?;
    }
    Some(next)
}

/// A screened entity with its per-feature scores and composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub entity: String,
    /// Normalised sub-scores in [0, 100], by feature name.
    pub sub_scores: BTreeMap<String, f64>,
    /// Weighted composite in [0, 100], rounded to two decimals.
    pub composite: f64,
    pub rationale: String,
    /// Raw values carried through for display (prices, ratios, dates).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8} {:>6.2}  {}", self.entity, self.composite, self.rationale)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for SCREENER.
#[derive(Debug, thiserror::Error)]
pub enum ScreenError {
    #[error("Transient source error ({method}): {message}")]
    TransientSource { method: String, message: String },

    #[error("Permanent source error ({method}): {message}")]
    PermanentSource { method: String, message: String },

    #[error("Cache corruption at {path}: {message}")]
    CacheCorruption { path: String, message: String },

    #[error("Insufficient data: need {needed} points, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Fetch worker failed: {0}")]
    Worker(String),
}

impl ScreenError {
    /// Only transient source failures are eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScreenError::TransientSource { .. })
    }

    pub fn transient(method: &str, message: impl Into<String>) -> Self {
        ScreenError::TransientSource {
            method: method.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(method: &str, message: impl Into<String>) -> Self {
        ScreenError::PermanentSource {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
