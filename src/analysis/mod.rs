//! Time-series analysis over daily per-entity series.
//!
//! Pure functions only: every routine takes an ordered `SeriesPoint` slice
//! (or plain values) and returns a result or an `InsufficientData` error.
//! Thresholds are always supplied by the caller.

pub mod indicators;
pub mod streak;
pub mod trend;

pub use streak::{consecutive_runs, Run};
pub use trend::{classify_pattern, pct_change, trend, Pattern, PatternReading, PatternThresholds, Trend};
