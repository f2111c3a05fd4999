//! Screening strategies.
//!
//! Each strategy implements [`Screen`](crate::engine::pipeline::Screen) and
//! owns its options, fetch plan, per-entity analysis and scoring model:
//! - `short_squeeze`: high days-to-cover with healthy fundamentals
//! - `contrarian`: sustained short-volume streaks at technical support
//! - `earnings`: short-volume patterns ahead of scheduled earnings
//!
//! Options are validated eagerly, before any network call is made.

pub mod contrarian;
pub mod earnings;
pub mod fundamentals;
pub mod scoring;
pub mod short_squeeze;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;

use crate::engine::pipeline::Screen;
use crate::types::{Record, RecordExt, ScreenError};

/// Registered screening strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenKind {
    ShortSqueeze,
    ContrarianEntry,
    EarningsShortSetup,
}

impl ScreenKind {
    pub const ALL: [ScreenKind; 3] = [
        ScreenKind::ShortSqueeze,
        ScreenKind::ContrarianEntry,
        ScreenKind::EarningsShortSetup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScreenKind::ShortSqueeze => "short_squeeze",
            ScreenKind::ContrarianEntry => "contrarian_entry",
            ScreenKind::EarningsShortSetup => "earnings_short_setup",
        }
    }
}

impl fmt::Display for ScreenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScreenKind {
    type Err = ScreenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(ScreenKind::name).collect();
                ScreenError::Config(format!("unknown screen '{s}' (known: {})", known.join(", ")))
            })
    }
}

/// Build and validate a screen from its raw option table.
pub fn build_screen(kind: ScreenKind, options: Option<&toml::Table>) -> Result<Box<dyn Screen>, ScreenError> {
    let screen: Box<dyn Screen> = match kind {
        ScreenKind::ShortSqueeze => Box::new(short_squeeze::ShortSqueezeScreen::new(parse_options(kind, options)?)?),
        ScreenKind::ContrarianEntry => Box::new(contrarian::ContrarianScreen::new(parse_options(kind, options)?)?),
        ScreenKind::EarningsShortSetup => {
            Box::new(earnings::EarningsSetupScreen::new(parse_options(kind, options)?)?)
        }
    };
    Ok(screen)
}

/// Deserialize a screen's option table. Unknown options are rejected.
fn parse_options<T>(kind: ScreenKind, options: Option<&toml::Table>) -> Result<T, ScreenError>
where
    T: DeserializeOwned + Default,
{
    match options {
        None => Ok(T::default()),
        Some(table) => toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e| ScreenError::Config(format!("invalid options for {kind}: {e}"))),
    }
}

/// Row with the newest value of `date_field`.
pub(crate) fn latest_by_date<'a>(records: &'a [Record], date_field: &str) -> Option<&'a Record> {
    records
        .iter()
        .filter_map(|r| r.date_field(date_field).map(|d| (d, r)))
        .max_by_key(|(d, _)| *d)
        .map(|(_, r)| r)
}

/// `as_of` shifted back by `days`.
pub(crate) fn days_before(as_of: NaiveDate, days: i64) -> NaiveDate {
    as_of
        .checked_sub_signed(chrono::Duration::days(days))
        .unwrap_or(NaiveDate::MIN)
}

/// `as_of` shifted forward by `days`.
pub(crate) fn days_after(as_of: NaiveDate, days: i64) -> NaiveDate {
    as_of
        .checked_add_signed(chrono::Duration::days(days))
        .unwrap_or(NaiveDate::MAX)
}
