//! Zonal statistics of a composed scenario.
//!
//! Field names of every struct here are the export format consumed by
//! dashboards and CSV writers; bump [`SUMMARY_STATS_VERSION`] on any change.

mod rollup;
mod zonal;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use rollup::{rollup, Rollup, RollupEntry};
pub use zonal::compute_stats;

pub const SUMMARY_STATS_VERSION: u32 = 1;

/// Square metres per hectare.
pub(crate) const M2_PER_HA: f64 = 10_000.0;

/// `values` under the constraint mask, `total` over the whole area.
/// `None` where the reduction had no valid pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsDict {
    pub values: Vec<Option<f64>>,
    pub total: Vec<Option<f64>>,
}

impl StatsDict {
    pub fn single(value: Option<f64>, total: Option<f64>) -> Self {
        Self {
            values: vec![value],
            total: vec![total],
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.values.first().copied().flatten()
    }

    pub fn total_value(&self) -> Option<f64> {
        self.total.first().copied().flatten()
    }
}

/// `{layer_id: stats}`, one entry per list element.
pub type LayerStats = BTreeMap<String, StatsDict>;

/// Area (ha) of one suitability class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuitabilityLevel {
    pub class: i64,
    pub sum: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuitabilityStats {
    pub values: Vec<SuitabilityLevel>,
    /// Σ class areas, ha.
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaStats {
    pub suitability: SuitabilityStats,
    pub benefit: Vec<LayerStats>,
    pub cost: Vec<LayerStats>,
    pub constraint: Vec<LayerStats>,
    pub color: String,
}

impl AreaStats {
    /// Entries of one kind (`benefit`, `cost`, `constraint`).
    pub fn kind(&self, kind: &str) -> Option<&[LayerStats]> {
        match kind {
            "benefit" => Some(self.benefit.as_slice()),
            "cost" => Some(self.cost.as_slice()),
            "constraint" => Some(self.constraint.as_slice()),
            _ => None,
        }
    }

    /// Look up the stats of a layer by id within one kind.
    pub fn layer(&self, kind: &str, id: &str) -> Option<&StatsDict> {
        self.kind(kind)?.iter().find_map(|entry| entry.get(id))
    }
}

/// Statistics of one area, keyed by the area's name.
pub type SummaryStats = BTreeMap<String, AreaStats>;
