//! Restoration suitability scoring engine.
//!
//! Benefit, cost and constraint layers picked from a [`LayerCatalog`] into a
//! [`LayerSelection`] are combined into lazy raster expressions ([`Expr`]) by
//! the [`IndexCompositor`], then reduced per area of interest into
//! [`SummaryStats`]. Pixels are evaluated by a [`RasterBackend`];
//! [`LocalBackend`] runs everything in-process.

pub mod aggregate;
pub mod backend;
pub mod catalog;
pub mod compositor;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod expr;
pub mod geometry;
pub mod mask;
pub mod normalize;
pub mod raster;
pub mod recipe;
pub mod stats;

pub use aggregate::{aggregate_benefits, ThemeWeighting};
pub use backend::{CancelToken, LocalBackend, RasterBackend, Reducer, Reduction};
pub use catalog::{
    BenefitLayer, CatalogEntry, ConstraintLayer, ConstraintRule, CostLayer, DataType, LayerCatalog, LayerRole,
    LayerSelection, LayerSet,
};
pub use compositor::{Diagnostics, IndexCompositor, SuitabilityResult};
pub use config::EngineConfig;
pub use dispatch::{evaluate_scenario, Dispatcher, Scenario, ScenarioOutput};
pub use error::{Result, SeplanError};
pub use expr::{Expr, Scalar};
pub use geometry::{AreaOfInterest, Polygon, Region};
pub use mask::{constraint_limits, ConstraintLimits};
pub use normalize::NormalizationStrategy;
pub use raster::{Grid, Raster};
pub use recipe::{validate_recipe, RecipeRecord};
pub use stats::{compute_stats, rollup, SummaryStats, SUMMARY_STATS_VERSION};
