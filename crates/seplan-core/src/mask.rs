//! Constraint masks: 1 keeps a pixel, 0 excludes it.

use serde::Serialize;
use tracing::debug;

use crate::backend::{CancelToken, RasterBackend, Reducer};
use crate::catalog::{ConstraintLayer, ConstraintRule, DataType};
use crate::error::{Result, SeplanError};
use crate::expr::Expr;
use crate::geometry::Region;

/// Binary keep mask for one constraint. No-data pixels are read as 0 before
/// the rule is applied.
pub fn build_mask(layer: &ConstraintLayer) -> Expr {
    apply_rule(&layer.image().unmask(0.0), layer.rule())
}

/// Keep mask of `rule` evaluated on `image`.
pub fn apply_rule(image: &Expr, rule: &ConstraintRule) -> Expr {
    match rule {
        ConstraintRule::Continuous { min, max } => image.gte(*min).and(&image.lte(*max)),
        ConstraintRule::Binary { value } => image.eq_value(*value),
        ConstraintRule::Categorical { codes } => image.in_set(codes),
    }
}

/// Combine keep masks: a pixel is kept only where no mask excludes it.
/// An empty list keeps everything.
pub fn combine_masks(masks: &[Expr]) -> Expr {
    let failures: Vec<Expr> = masks.iter().map(Expr::not).collect();
    match Expr::sum(&failures) {
        Some(count) => count.eq_value(0.0),
        None => Expr::constant(1.0),
    }
}

/// Combined mask for every constraint in `layers`.
pub fn constraint_mask<'a>(layers: impl IntoIterator<Item = &'a ConstraintLayer>) -> Expr {
    let masks: Vec<Expr> = layers.into_iter().map(build_mask).collect();
    combine_masks(&masks)
}

/// Values a constraint layer takes over a region, used to offer rule bounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConstraintLimits {
    /// Continuous and binary layers.
    Range { min: f64, max: f64 },
    /// Categorical layers: distinct codes, ascending.
    Codes(Vec<f64>),
}

impl ConstraintLimits {
    /// A rule that keeps every pixel of the region.
    pub fn keep_all(&self, data_type: DataType) -> ConstraintRule {
        match (self, data_type) {
            (ConstraintLimits::Codes(codes), _) => ConstraintRule::Categorical { codes: codes.clone() },
            (ConstraintLimits::Range { max, .. }, DataType::Binary) => ConstraintRule::Binary { value: *max },
            (ConstraintLimits::Range { min, max }, _) => ConstraintRule::Continuous { min: *min, max: *max },
        }
    }
}

/// Value limits of `image` over `region`: min/max for continuous and binary
/// layers, the distinct values for categorical ones.
pub fn constraint_limits(
    image: &Expr,
    data_type: DataType,
    label: &str,
    region: &Region,
    backend: &dyn RasterBackend,
    cancel: &CancelToken,
) -> Result<ConstraintLimits> {
    let no_data = |statistic: &str| SeplanError::NoDataInAoi {
        statistic: format!("{statistic} of {label}"),
        region: region.name.clone(),
    };
    let limits = match data_type {
        DataType::Continuous | DataType::Binary => {
            let red = backend.reduce(image, &Reducer::MinMax, region, cancel)?;
            match (red.get("min"), red.get("max")) {
                (Some(min), Some(max)) => ConstraintLimits::Range { min, max },
                _ => return Err(no_data("min/max")),
            }
        }
        DataType::Categorical => {
            let red = backend.reduce(image, &Reducer::FrequencyHistogram, region, cancel)?;
            if red.histogram.is_empty() {
                return Err(no_data("frequency histogram"));
            }
            ConstraintLimits::Codes(red.histogram.into_iter().map(|(v, _)| v).collect())
        }
    };
    debug!(layer = label, %data_type, ?limits, "constraint limits");
    Ok(limits)
}
