//! Per-layer normalisation over an area of interest.
//!
//! Min-max and percentile-clip build lazy expressions whose bounds are
//! deferred statistics over the region. Quintile classification needs one
//! set of breakpoints per spatial unit and resolves them through the backend
//! up front; units without data are reported instead of failing the call.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{CancelToken, RasterBackend, Reducer};
use crate::error::{Result, SeplanError};
use crate::expr::{percentile_key, Expr, Scalar, Stat};
use crate::geometry::Region;

/// Breakpoints used by [`quintiles`].
pub const QUINTILE_BREAKS: [f64; 4] = [20.0, 40.0, 60.0, 80.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationStrategy {
    #[default]
    #[serde(alias = "percentile")]
    PercentileClip,
    MinMax,
    Quintile,
}

/// `(x − min) / (max − min + ε)` with min and max taken over `region`.
pub fn min_max(image: &Expr, region: &Region, label: &str, epsilon: f64) -> Expr {
    let low = image.statistic(Stat::Min, region, label);
    let high = image.statistic(Stat::Max, region, label);
    image.unit_scale(low, high, epsilon)
}

/// `(x − p_lo) / (p_hi − p_lo + ε)` clamped to `[0, 1]`.
pub fn percentile_clip(image: &Expr, region: &Region, label: &str, percentiles: [f64; 2], epsilon: f64) -> Expr {
    let [lo, hi] = percentiles;
    let low = image.statistic(Stat::Percentile(lo), region, label);
    let high = image.statistic(Stat::Percentile(hi), region, label);
    image.unit_scale(low, high, epsilon).clamp(0.0, 1.0)
}

/// Result of [`quintiles`]: classes 1..=5 mosaicked over every valid unit.
#[derive(Debug, Clone, PartialEq)]
pub struct QuintileResult {
    pub image: Expr,
    /// Names of units whose breakpoints were null (no valid pixels).
    pub invalid_regions: Vec<String>,
}

/// Quintile classification per spatial unit of `region`.
///
/// Class 1 for `x <= p20`, up to class 5 for `x > p80`. Fails with
/// `NoDataInAoi` only if every unit is invalid.
pub fn quintiles(
    image: &Expr,
    region: &Region,
    label: &str,
    backend: &dyn RasterBackend,
    cancel: &CancelToken,
) -> Result<QuintileResult> {
    let reducer = Reducer::Percentile(QUINTILE_BREAKS.to_vec());
    let mut parts = Vec::new();
    let mut invalid_regions = Vec::new();

    for unit in region.units() {
        let reduction = backend.reduce(image, &reducer, &unit, cancel)?;
        let breaks: Option<Vec<f64>> = QUINTILE_BREAKS
            .iter()
            .map(|&p| reduction.get(&percentile_key(p)))
            .collect();
        match breaks {
            Some(breaks) => {
                debug!(layer = label, unit = %unit.name, ?breaks, "quintile breakpoints");
                let breaks = breaks.into_iter().map(Scalar::Value).collect();
                parts.push(image.classify(breaks).clip(&unit));
            }
            None => {
                warn!(layer = label, unit = %unit.name, "no valid pixels, unit left out of quintiles");
                invalid_regions.push(unit.name.clone());
            }
        }
    }

    if parts.is_empty() {
        return Err(SeplanError::NoDataInAoi {
            statistic: format!("quintiles of {label}"),
            region: region.name.clone(),
        });
    }

    Ok(QuintileResult {
        image: Expr::mosaic(parts),
        invalid_regions,
    })
}

/// Applies one configured strategy to many layers over the same region.
pub struct Normalizer<'a> {
    pub strategy: NormalizationStrategy,
    pub percentiles: [f64; 2],
    pub epsilon: f64,
    pub region: &'a Region,
    pub backend: &'a dyn RasterBackend,
    pub cancel: &'a CancelToken,
}

/// A normalised layer plus any units quintile classification had to skip.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub image: Expr,
    pub invalid_regions: Vec<String>,
}

impl<'a> Normalizer<'a> {
    pub fn normalize(&self, image: &Expr, label: &str) -> Result<Normalized> {
        match self.strategy {
            NormalizationStrategy::MinMax => Ok(Normalized {
                image: min_max(image, self.region, label, self.epsilon),
                invalid_regions: Vec::new(),
            }),
            NormalizationStrategy::PercentileClip => Ok(Normalized {
                image: percentile_clip(image, self.region, label, self.percentiles, self.epsilon),
                invalid_regions: Vec::new(),
            }),
            NormalizationStrategy::Quintile => {
                let q = quintiles(image, self.region, label, self.backend, self.cancel)?;
                Ok(Normalized {
                    image: q.image,
                    invalid_regions: q.invalid_regions,
                })
            }
        }
    }
}
