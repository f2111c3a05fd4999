//! Price indicators used by support-level checks.

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Wilder's relative strength index over `period` changes.
///
/// Needs at least `period + 1` closes.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }
    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let (seed, rest) = changes.split_at(period);

    let mut avg_gain = seed.iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = seed.iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / period as f64;

    let p = period as f64;
    for change in rest {
        avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Absolute distance of `value` from `reference`, in percent of `reference`.
pub fn pct_distance(value: f64, reference: f64) -> Option<f64> {
    (reference > 0.0).then(|| (value - reference).abs() / reference * 100.0)
}

/// Lowest of the last `window` values (all values when fewer).
pub fn trailing_low(values: &[f64], window: usize) -> Option<f64> {
    values[values.len().saturating_sub(window)..]
        .iter()
        .copied()
        .reduce(f64::min)
}
