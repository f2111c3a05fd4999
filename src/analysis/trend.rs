//! Linear trend fitting and short-pattern classification.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ScreenError, SeriesPoint};

/// Fewest points a trend fit is computed over.
pub const MIN_TREND_POINTS: usize = 3;

/// Least-squares fit over the trailing window, x = observation index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub points: usize,
}

/// Fit a line to the last `window` points of `series`.
///
/// A constant series yields slope 0 and R² 0.
pub fn trend(series: &[SeriesPoint], window: usize) -> Result<Trend, ScreenError> {
    if window < MIN_TREND_POINTS {
        return Err(ScreenError::Config(format!(
            "trend window must be at least {MIN_TREND_POINTS}, got {window}"
        )));
    }
    let tail = &series[series.len().saturating_sub(window)..];
    if tail.len() < MIN_TREND_POINTS {
        return Err(ScreenError::InsufficientData {
            needed: MIN_TREND_POINTS,
            available: tail.len(),
        });
    }
    let values: Vec<f64> = tail.iter().map(|p| p.value).collect();
    Ok(fit(&values))
}

/// Percentage change from the first to the last point.
pub fn pct_change(series: &[SeriesPoint]) -> Result<f64, ScreenError> {
    match (series.first(), series.last()) {
        (Some(first), Some(last)) if series.len() >= 2 && first.value > 0.0 => {
            Ok((last.value - first.value) / first.value * 100.0)
        }
        _ => Err(ScreenError::InsufficientData {
            needed: 2,
            available: series.len(),
        }),
    }
}

fn fit(values: &[f64]) -> Trend {
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let r_squared = if sxx > 0.0 && syy > 0.0 {
        ((sxy * sxy) / (sxx * syy)).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Trend {
        slope,
        intercept: mean_y - slope * mean_x,
        r_squared,
        points: values.len(),
    }
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

// ---------------------------------------------------------------------------
// Pattern classification
// ---------------------------------------------------------------------------

/// Shape of a recent short-volume series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Accelerating,
    Decelerating,
    ReversalUp,
    ReversalDown,
    Steady,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Pattern::Accelerating => "acceleration",
            Pattern::Decelerating => "deceleration",
            Pattern::ReversalUp => "reversal_up",
            Pattern::ReversalDown => "reversal_down",
            Pattern::Steady => "steady",
        };
        f.write_str(s)
    }
}

/// Classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternThresholds {
    /// Trailing points considered.
    pub window: usize,
    /// Fewest points before any classification is attempted.
    pub min_points: usize,
    /// |slope| per day beyond which the series is trending.
    pub slope: f64,
    /// |slope| each half must exceed, in opposite directions, for a reversal.
    pub reversal: f64,
    /// Volatility at which the stability component of strength reaches zero.
    pub volatility_cap: f64,
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self {
            window: 10,
            min_points: 5,
            slope: 1.5,
            reversal: 1.0,
            volatility_cap: 10.0,
        }
    }
}

impl PatternThresholds {
    pub fn validate(&self) -> Result<(), ScreenError> {
        if self.min_points < MIN_TREND_POINTS || self.window < self.min_points {
            return Err(ScreenError::Config(format!(
                "pattern window ({}) must be >= min points ({}) >= {MIN_TREND_POINTS}",
                self.window, self.min_points
            )));
        }
        if self.slope <= 0.0 || self.reversal <= 0.0 || self.volatility_cap <= 0.0 {
            return Err(ScreenError::Config(
                "pattern thresholds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of [`classify_pattern`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatternReading {
    pub pattern: Pattern,
    pub mean: f64,
    pub slope: f64,
    pub r_squared: f64,
    pub volatility: f64,
    /// Fit quality blended with stability, in [0, 100].
    pub strength: f64,
    pub points: usize,
}

/// Classify the trailing window of `series`.
///
/// Reversals are checked first: with at least six points the window is
/// split in half and each half fitted separately; opposite slopes both
/// beyond the reversal threshold mark a reversal. Otherwise the overall
/// slope decides between accelerating, decelerating and steady.
pub fn classify_pattern(
    series: &[SeriesPoint],
    thresholds: &PatternThresholds,
) -> Result<PatternReading, ScreenError> {
    if series.len() < thresholds.min_points {
        return Err(ScreenError::InsufficientData {
            needed: thresholds.min_points,
            available: series.len(),
        });
    }
    let values: Vec<f64> = series[series.len().saturating_sub(thresholds.window)..]
        .iter()
        .map(|p| p.value)
        .collect();

    let overall = fit(&values);
    let volatility = sample_std(&values);
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    let reversal = if values.len() >= 2 * MIN_TREND_POINTS {
        let (first, second) = values.split_at(values.len() / 2);
        let (a, b) = (fit(first).slope, fit(second).slope);
        if a < -thresholds.reversal && b > thresholds.reversal {
            Some(Pattern::ReversalUp)
        } else if a > thresholds.reversal && b < -thresholds.reversal {
            Some(Pattern::ReversalDown)
        } else {
            None
        }
    } else {
        None
    };

    let pattern = reversal.unwrap_or(if overall.slope > thresholds.slope {
        Pattern::Accelerating
    } else if overall.slope < -thresholds.slope {
        Pattern::Decelerating
    } else {
        Pattern::Steady
    });

    let stability = 1.0 - (volatility / thresholds.volatility_cap).min(1.0);
    let strength = (overall.r_squared * 70.0 + stability * 30.0).clamp(0.0, 100.0);

    Ok(PatternReading {
        pattern,
        mean,
        slope: overall.slope,
        r_squared: overall.r_squared,
        volatility,
        strength,
        points: values.len(),
    })
}
