//! Per-layer roll-up across areas, for theme charts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::SummaryStats;

const KINDS: [&str; 3] = ["benefit", "cost", "constraint"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupEntry {
    /// One value per area, in input order. Null statistics count as 0.
    pub values: Vec<f64>,
    /// Largest layer total seen in any area.
    pub total: f64,
}

/// `{kind: {layer_id: entry}}`
pub type Rollup = BTreeMap<String, BTreeMap<String, RollupEntry>>;

/// Collect the statistics of every area into one entry per layer.
///
/// A layer listed twice within one area contributes the sum of its values.
pub fn rollup(stats: &[SummaryStats]) -> Rollup {
    let mut out = Rollup::new();
    for area in stats.iter().flat_map(|s| s.values()) {
        for kind in KINDS {
            let entries = area.kind(kind).unwrap_or(&[]);
            let by_kind = out.entry(kind.to_string()).or_default();

            let mut per_layer: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
            for (id, dict) in entries.iter().flat_map(|e| e.iter()) {
                let slot = per_layer.entry(id.as_str()).or_insert((0.0, 0.0));
                slot.0 += dict.value().unwrap_or(0.0);
                slot.1 = dict.total_value().unwrap_or(0.0);
            }

            for (id, (value, total)) in per_layer {
                let entry = by_kind.entry(id.to_string()).or_default();
                entry.values.push(value);
                entry.total = entry.total.max(total);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{AreaStats, LayerStats, StatsDict, SuitabilityStats};

    fn area(name: &str, forest: Option<f64>, forest_total: f64) -> SummaryStats {
        SummaryStats::from([(
            name.to_string(),
            AreaStats {
                suitability: SuitabilityStats::default(),
                benefit: vec![LayerStats::from([(
                    "forest".to_string(),
                    StatsDict::single(forest, Some(forest_total)),
                )])],
                cost: Vec::new(),
                constraint: Vec::new(),
                color: "#000000".into(),
            },
        )])
    }

    #[test]
    fn values_are_listed_per_area_and_total_is_the_max() {
        let stats = vec![area("aoi", Some(0.4), 0.5), area("west", None, 0.7)];
        let r = rollup(&stats);
        let forest = &r["benefit"]["forest"];
        assert_eq!(forest.values, vec![0.4, 0.0]);
        assert_eq!(forest.total, 0.7);
        assert!(r["cost"].is_empty());
    }

    #[test]
    fn empty_input_gives_empty_rollup() {
        assert!(rollup(&[]).is_empty());
    }
}
