//! Consecutive-run detection.

use chrono::NaiveDate;
use serde::Serialize;

use crate::types::{next_weekday, SeriesPoint};

/// A maximal stretch of adjacent observations satisfying a predicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub length: usize,
    pub mean: f64,
}

/// Find every maximal run of adjacent points whose value satisfies
/// `predicate`, keeping runs of at least `min_len` points.
///
/// `series` must be sorted by date. Two points are adjacent when the later
/// one falls on the next weekday after the earlier one, so a missing trading
/// day ends the run. Runs are returned oldest first.
pub fn consecutive_runs<F>(series: &[SeriesPoint], predicate: F, min_len: usize) -> Vec<Run>
where
    F: Fn(f64) -> bool,
{
    let min_len = min_len.max(1);
    let mut runs = Vec::new();
    let mut current: Vec<&SeriesPoint> = Vec::new();

    for point in series {
        let adjacent = current
            .last()
            .map_or(true, |prev| next_weekday(prev.date) == Some(point.date));
        if !adjacent || !predicate(point.value) {
            close_run(&mut current, min_len, &mut runs);
        }
        if predicate(point.value) {
            current.push(point);
        }
    }
    close_run(&mut current, min_len, &mut runs);
    runs
}

fn close_run(current: &mut Vec<&SeriesPoint>, min_len: usize, runs: &mut Vec<Run>) {
    if let (Some(first), Some(last)) = (current.first(), current.last()) {
        if current.len() >= min_len {
            let sum: f64 = current.iter().map(|p| p.value).sum();
            runs.push(Run {
                start: first.date,
                end: last.date,
                length: current.len(),
                mean: sum / current.len() as f64,
            });
        }
    }
    current.clear();
}
