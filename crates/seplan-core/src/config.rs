//! Engine parameters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::aggregate::ThemeWeighting;
use crate::error::Result;
use crate::expr::DEFAULT_EPSILON;
use crate::normalize::NormalizationStrategy;

/// Tunable parameters of one computation. Every field has a default, so a
/// config file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lower/upper percentile of every percentile-clip step, default [3, 97].
    pub percentiles: [f64; 2],
    /// Added to normalisation denominators, default 1e-13.
    pub epsilon: f64,
    /// Per-layer benefit normalisation, default percentile clip.
    pub benefit_normalization: NormalizationStrategy,
    pub theme_weighting: ThemeWeighting,
    /// Clip every index to the primary region.
    pub clip_to_aoi: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            percentiles: [3.0, 97.0],
            epsilon: DEFAULT_EPSILON,
            benefit_normalization: NormalizationStrategy::PercentileClip,
            theme_weighting: ThemeWeighting::InverseMeanWeight,
            clip_to_aoi: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
