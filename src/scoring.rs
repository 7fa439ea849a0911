//! Ensemble scoring and tiering.
//!
//! Weights and band edges are output-compatibility policy; changing any of them changes every
//! stored verdict.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const WEIGHT_CONF_ORIGINAL: f64 = 0.45;
pub const WEIGHT_CONF_ELA: f64 = 0.35;
pub const WEIGHT_ELA_STD: f64 = 0.10;
pub const WEIGHT_NOISE_STD: f64 = 0.10;
/// Standard deviations are amplified by this factor before clipping to 1.
pub const STD_GAIN: f64 = 5.0;

/// Lowest score classified as Medium (inclusive).
pub const MEDIUM_FLOOR: f64 = 0.55;
/// Highest score classified as Medium (inclusive); anything above is High.
pub const HIGH_EDGE: f64 = 0.60;

/// Per-page forensic measurements. Computed once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForensicSignals {
    pub model_prob_orig: f64,
    pub model_prob_ela: f64,
    pub ela_mean: f64,
    pub ela_std: f64,
    pub noise_mean: f64,
    pub noise_std: f64,
    /// Area-based ELA likelihood; reported, not part of the ensemble.
    pub ela_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    pub fn from_score(score: f64) -> Self {
        if score > HIGH_EDGE {
            Tier::High
        } else if score >= MEDIUM_FLOOR {
            Tier::Medium
        } else {
            Tier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Low => "Low",
            Tier::Medium => "Medium",
            Tier::High => "High",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TamperScore {
    pub score: f64,
    pub tier: Tier,
}

pub fn ensemble_score(signals: &ForensicSignals) -> f64 {
    WEIGHT_CONF_ORIGINAL * signals.model_prob_orig
        + WEIGHT_CONF_ELA * signals.model_prob_ela
        + WEIGHT_ELA_STD * (signals.ela_std * STD_GAIN).min(1.0)
        + WEIGHT_NOISE_STD * (signals.noise_std * STD_GAIN).min(1.0)
}

pub fn score(signals: &ForensicSignals) -> TamperScore {
    let score = ensemble_score(signals);
    TamperScore {
        score,
        tier: Tier::from_score(score),
    }
}

/// Whether a page earns a localization map.
///
/// Either the configured threshold or the Medium floor triggers. With the default threshold of
/// 0.5 this also covers Low-tier scores in [0.5, 0.55); with a threshold above 0.55 the threshold
/// never decides anything.
pub fn should_localize(score: f64, tamper_threshold: f64) -> bool {
    score >= tamper_threshold || score >= MEDIUM_FLOOR
}
