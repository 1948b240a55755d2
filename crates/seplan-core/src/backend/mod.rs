//! The raster computation backend consumed by the engine.
//!
//! The engine only needs two things from a backend: reduce an expression over
//! a region to a dictionary of numbers, and materialise an expression into
//! pixels. [`LocalBackend`] implements both in-process over [`Raster`] assets.
//!
//! [`Raster`]: crate::raster::Raster

mod local;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SeplanError};
use crate::expr::Expr;
use crate::geometry::Region;
use crate::raster::Raster;

pub use local::LocalBackend;

/// Reductions a backend must support.
#[derive(Debug, Clone, PartialEq)]
pub enum Reducer {
    /// Keys `min`, `max`.
    MinMax,
    /// One key per percentile, see [`crate::expr::percentile_key`].
    Percentile(Vec<f64>),
    /// Key `mean`, unweighted over valid pixels.
    Mean,
    /// Key `sum`, unweighted over valid pixels.
    Sum,
    /// Key `mean`, pixel values weighted by pixel area.
    AreaWeightedMean,
    /// Key `sum`, Σ value × pixel area (m²).
    AreaWeightedSum,
    /// Key `area`, total area (m²) of the region regardless of pixel validity.
    Area,
    /// Groups of area (m²) per rounded pixel value.
    GroupedArea,
    /// Pixel count per distinct valid value.
    FrequencyHistogram,
}

/// Materialised result of a reduction. `None` marks a null statistic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduction {
    pub values: BTreeMap<String, Option<f64>>,
    /// `(group value, area m²)` for [`Reducer::GroupedArea`], ascending by group.
    pub groups: Vec<(i64, f64)>,
    /// `(value, pixel count)` for [`Reducer::FrequencyHistogram`], ascending by value.
    pub histogram: Vec<(f64, u64)>,
}

impl Reduction {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied().flatten()
    }

    pub fn group(&self, value: i64) -> Option<f64> {
        self.groups.iter().find(|(g, _)| *g == value).map(|(_, a)| *a)
    }
}

/// Cooperative cancellation flag for one keyed evaluation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    key: Arc<str>,
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self {
            key: Arc::from(key.as_ref()),
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token nobody holds a handle to cancel.
    pub fn none() -> Self {
        Self::new("")
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether both handles share one flag.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SeplanError::Cancelled {
                scenario: self.key.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Reduce / materialise contract of the raster computation service.
///
/// Implementations must be shareable across threads; the engine may issue
/// independent requests concurrently and holds no state between them.
pub trait RasterBackend: Send + Sync {
    fn reduce(&self, expr: &Expr, reducer: &Reducer, region: &Region, cancel: &CancelToken) -> Result<Reduction>;

    fn materialize(&self, expr: &Expr, region: &Region, cancel: &CancelToken) -> Result<Raster>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_one_token_leaves_clones_in_sync_and_others_untouched() {
        let a = CancelToken::new("a");
        let a2 = a.clone();
        let b = CancelToken::new("b");
        a.cancel();
        assert!(a2.is_cancelled());
        assert!(!b.is_cancelled());
        match a2.check() {
            Err(SeplanError::Cancelled { scenario }) => assert_eq!(scenario, "a"),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert!(b.check().is_ok());
    }

    #[test]
    fn null_values_read_as_none() {
        let mut r = Reduction::default();
        r.values.insert("min".into(), None);
        r.values.insert("max".into(), Some(2.0));
        assert_eq!(r.get("min"), None);
        assert_eq!(r.get("max"), Some(2.0));
        assert_eq!(r.get("absent"), None);
    }
}
