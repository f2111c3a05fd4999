//! Composite scoring engine.
//!
//! Raw per-entity features are mapped to [0, 100] by a per-feature
//! normaliser, combined with validated weights into a composite, and ranked.
//! Weights are `Decimal` so that validation of the unit sum is exact.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Candidate, ScreenError};

/// Allowed deviation of the weight sum from 1.0.
pub const WEIGHT_TOLERANCE: Decimal = dec!(0.000001);

/// Decimal places kept in composite scores.
const COMPOSITE_DP: u32 = 2;

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Maps a raw feature value onto [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalizer {
    /// `floor` maps to 0 and `cap` to 100, clamped outside. A cap below the
    /// floor inverts the scale (smaller raw values score higher).
    Linear { floor: f64, cap: f64 },
    /// Any non-zero raw value scores 100.
    Flag,
    /// Raw value is already on the 0-100 scale; clamp only.
    Clamp,
}

impl Normalizer {
    pub fn apply(&self, raw: f64) -> f64 {
        let scaled = match *self {
            Normalizer::Linear { floor, cap } => {
                if floor == cap {
                    50.0
                } else {
                    (raw - floor) / (cap - floor) * 100.0
                }
            }
            Normalizer::Flag => {
                if raw != 0.0 {
                    100.0
                } else {
                    0.0
                }
            }
            Normalizer::Clamp => raw,
        };
        if scaled.is_finite() {
            scaled.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Linear min/max normalisation onto [0, 100]. `floor == cap` scores 50.
pub fn normalize(value: f64, floor: f64, cap: f64) -> f64 {
    Normalizer::Linear { floor, cap }.apply(value)
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One weighted feature of a scoring model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub normalizer: Normalizer,
    pub weight: Decimal,
}

impl FeatureSpec {
    pub fn new(name: &str, normalizer: Normalizer, weight: Decimal) -> Self {
        Self {
            name: name.to_string(),
            normalizer,
            weight,
        }
    }
}

/// Normalised sub-scores plus the weighted composite.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub sub_scores: BTreeMap<String, f64>,
    pub composite: f64,
}

/// Validated set of weighted features.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringModel {
    features: Vec<FeatureSpec>,
}

impl ScoringModel {
    /// Validate and build. Weights must be non-negative, names unique, and
    /// the weights must sum to 1.0 within [`WEIGHT_TOLERANCE`].
    pub fn new(features: Vec<FeatureSpec>) -> Result<Self, ScreenError> {
        if features.is_empty() {
            return Err(ScreenError::Config("scoring model has no features".into()));
        }
        let mut seen = BTreeSet::new();
        for f in &features {
            if !seen.insert(f.name.as_str()) {
                return Err(ScreenError::Config(format!("duplicate feature '{}'", f.name)));
            }
            if f.weight.is_sign_negative() && !f.weight.is_zero() {
                return Err(ScreenError::Config(format!(
                    "feature '{}' has negative weight {}",
                    f.name, f.weight
                )));
            }
        }
        let total: Decimal = features.iter().map(|f| f.weight).sum();
        if (total - Decimal::ONE).abs() > WEIGHT_TOLERANCE {
            return Err(ScreenError::Config(format!(
                "feature weights sum to {total}, expected 1.0"
            )));
        }
        Ok(Self { features })
    }

    /// Replace weights by feature name and re-validate. Unknown names are a
    /// configuration error.
    pub fn with_weights(mut self, overrides: &BTreeMap<String, Decimal>) -> Result<Self, ScreenError> {
        for (name, weight) in overrides {
            let feature = self
                .features
                .iter_mut()
                .find(|f| &f.name == name)
                .ok_or_else(|| ScreenError::Config(format!("unknown scoring feature '{name}'")))?;
            feature.weight = *weight;
        }
        Self::new(self.features)
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }

    pub fn weights(&self) -> BTreeMap<String, Decimal> {
        self.features
            .iter()
            .map(|f| (f.name.clone(), f.weight))
            .collect()
    }

    /// Normalise raw feature values and combine them. Features absent from
    /// `raw` score 0 and still carry their weight.
    pub fn evaluate(&self, raw: &BTreeMap<String, f64>) -> Scored {
        let sub_scores: BTreeMap<String, f64> = self
            .features
            .iter()
            .map(|f| {
                let value = raw.get(&f.name).map_or(0.0, |v| f.normalizer.apply(*v));
                (f.name.clone(), value)
            })
            .collect();
        let composite = score(&sub_scores, &self.weights());
        Scored {
            sub_scores,
            composite,
        }
    }
}

/// Weighted sum of already-normalised values, rounded to two decimals and
/// clamped to [0, 100]. Missing values count as 0.
pub fn score(values: &BTreeMap<String, f64>, weights: &BTreeMap<String, Decimal>) -> f64 {
    let total: Decimal = weights
        .iter()
        .map(|(name, weight)| {
            let value = values
                .get(name)
                .and_then(|v| Decimal::from_f64(*v))
                .unwrap_or(Decimal::ZERO);
            value * weight
        })
        .sum();
    total
        .round_dp(COMPOSITE_DP)
        .clamp(Decimal::ZERO, dec!(100))
        .to_f64()
        .unwrap_or(0.0)
}

/// Sort by composite descending, ties by entity ascending, keep `limit`.
pub fn rank(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.composite
            .partial_cmp(&a.composite)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.entity.cmp(&b.entity))
    });
    candidates.truncate(limit);
    candidates
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
