//! Per-area reductions of a composed scenario.
//!
//! Every statistic is area weighted: pixels shrink towards the poles, so
//! counts would over-weight high latitudes.

use tracing::debug;

use super::{AreaStats, LayerStats, StatsDict, SuitabilityLevel, SuitabilityStats, SummaryStats, M2_PER_HA};
use crate::backend::{CancelToken, RasterBackend, Reducer};
use crate::catalog::LayerSelection;
use crate::compositor::SuitabilityResult;
use crate::error::Result;
use crate::expr::Expr;
use crate::geometry::{AreaOfInterest, Region};
use crate::mask::build_mask;

/// Statistics for the primary region and every sub-region, primary first.
pub fn compute_stats(
    result: &SuitabilityResult,
    selection: &LayerSelection,
    aoi: &AreaOfInterest,
    backend: &dyn RasterBackend,
    cancel: &CancelToken,
) -> Result<Vec<SummaryStats>> {
    let zonal = Zonal { backend, cancel };
    let mut out = Vec::new();
    for region in aoi.areas()? {
        cancel.check()?;
        let stats = zonal.area_stats(result, selection, region)?;
        debug!(area = %region.name, total_ha = stats.suitability.total, "area statistics");
        out.push(SummaryStats::from([(region.name.clone(), stats)]));
    }
    Ok(out)
}

struct Zonal<'a> {
    backend: &'a dyn RasterBackend,
    cancel: &'a CancelToken,
}

impl Zonal<'_> {
    fn single(&self, expr: &Expr, reducer: Reducer, key: &str, region: &Region) -> Result<Option<f64>> {
        Ok(self.backend.reduce(expr, &reducer, region, self.cancel)?.get(key))
    }

    fn area_stats(&self, result: &SuitabilityResult, selection: &LayerSelection, region: &Region) -> Result<AreaStats> {
        let mask = &result.constraint_mask;
        let area_m2 = self.single(mask, Reducer::Area, "area", region)?.unwrap_or(0.0);

        let suitability = self.suitability(&result.classified, region)?;

        let mut benefit = Vec::with_capacity(selection.benefits.len());
        for layer in &selection.benefits {
            let image = layer.image();
            let values = self.single(&image.update_mask(mask), Reducer::AreaWeightedMean, "mean", region)?;
            let total = self.single(&image, Reducer::AreaWeightedMean, "mean", region)?;
            benefit.push(LayerStats::from([(layer.id.clone(), StatsDict::single(values, total))]));
        }

        // Σ value · pixel area over the region area is the mean value per unit
        // area, in the cost's own unit (e.g. $/ha).
        let per_area = |sum: Option<f64>| sum.filter(|_| area_m2 > 0.0).map(|s| s / area_m2);
        let mut cost = Vec::with_capacity(selection.costs.len());
        for layer in &selection.costs {
            let image = layer.image();
            let values = self.single(&image.update_mask(mask), Reducer::AreaWeightedSum, "sum", region)?;
            let total = self.single(&image, Reducer::AreaWeightedSum, "sum", region)?;
            cost.push(LayerStats::from([(
                layer.id.clone(),
                StatsDict::single(per_area(values), per_area(total)),
            )]));
        }

        let mut constraint = Vec::with_capacity(selection.constraints.len());
        for layer in &selection.constraints {
            let groups = self
                .backend
                .reduce(&build_mask(layer), &Reducer::GroupedArea, region, self.cancel)?;
            let total: f64 = groups.groups.iter().map(|(_, a)| a).sum();
            let excluded = groups.group(0).unwrap_or(0.0);
            let percent = (total > 0.0).then(|| excluded / total * 100.0);
            constraint.push(LayerStats::from([(
                layer.id.clone(),
                StatsDict::single(percent, Some(total / M2_PER_HA)),
            )]));
        }

        Ok(AreaStats {
            suitability,
            benefit,
            cost,
            constraint,
            color: region.color.clone(),
        })
    }

    fn suitability(&self, classified: &Expr, region: &Region) -> Result<SuitabilityStats> {
        let groups = self
            .backend
            .reduce(classified, &Reducer::GroupedArea, region, self.cancel)?;
        let values: Vec<SuitabilityLevel> = groups
            .groups
            .iter()
            .filter(|(_, a)| *a > 0.0)
            .map(|&(class, a)| SuitabilityLevel {
                class,
                sum: a / M2_PER_HA,
            })
            .collect();
        let total = values.iter().map(|l| l.sum).sum();
        Ok(SuitabilityStats { values, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::catalog::{BenefitLayer, ConstraintLayer, ConstraintRule, CostLayer};
    use crate::compositor::IndexCompositor;
    use crate::config::EngineConfig;
    use crate::raster::Raster;
    use crate::testutil::{aoi, ramp_raster, test_grid};
    use approx::assert_relative_eq;

    fn backend() -> LocalBackend {
        LocalBackend::new(test_grid())
            .with_asset("forest", ramp_raster(0.0, 1.0))
            .unwrap()
            .with_asset("land", ramp_raster(100.0, 0.0))
            .unwrap()
            .with_asset("slope", ramp_raster(0.0, 10.0))
            .unwrap()
    }

    fn selection() -> LayerSelection {
        let mut c = LayerSelection::new();
        c.benefits
            .add(BenefitLayer::benefit("forest", "forest", 2).with_theme("biodiversity", "forest"))
            .unwrap();
        c.costs.add(CostLayer::cost("land", "land").with_unit("USD/ha")).unwrap();
        c.constraints
            .add(ConstraintLayer::constraint(
                "slope",
                "slope",
                ConstraintRule::Continuous { min: 0.0, max: 70.0 },
            ))
            .unwrap();
        c
    }

    fn run(area: &AreaOfInterest) -> (Vec<SummaryStats>, LocalBackend) {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let cat = selection();
        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&cat, area).unwrap();
        let stats = compute_stats(&result, &cat, area, &b, &cancel).unwrap();
        (stats, b)
    }

    #[test]
    fn class_areas_add_up_to_region_area() {
        let area = aoi();
        let (stats, b) = run(&area);
        let primary = &stats[0]["aoi"];
        let region_m2 = b
            .reduce(&Expr::constant(1.0), &Reducer::Area, area.primary().unwrap(), &CancelToken::none())
            .unwrap()
            .get("area")
            .unwrap();
        assert_relative_eq!(primary.suitability.total, region_m2 / M2_PER_HA, max_relative = 1e-9);
        assert!(primary.suitability.values.iter().any(|l| l.class == 6), "masked class missing");
        let classes: Vec<i64> = primary.suitability.values.iter().map(|l| l.class).collect();
        assert!(classes.windows(2).all(|w| w[0] < w[1]), "classes should be strictly ascending: {classes:?}");
    }

    #[test]
    fn constraint_percent_and_cost_per_hectare() {
        let area = aoi();
        let (stats, _) = run(&area);
        let primary = &stats[0]["aoi"];

        // slope > 70 on the southern half (rows 2..4)
        let slope = primary.layer("constraint", "slope").unwrap();
        let pct = slope.value().unwrap();
        assert!(pct > 45.0 && pct < 55.0, "excluded share {pct}% should be near half");

        // constant 100 $/ha: full-area mean is 100, masked share is about half
        let land = primary.layer("cost", "land").unwrap();
        assert_relative_eq!(land.total_value().unwrap(), 100.0, max_relative = 1e-6);
        let masked = land.value().unwrap();
        assert!(masked > 40.0 && masked < 60.0, "masked cost {masked}");

        let forest = primary.layer("benefit", "forest").unwrap();
        assert!(forest.value().unwrap() < forest.total_value().unwrap());
        assert_eq!(primary.color, "#3f51b5");
    }

    #[test]
    fn fully_constrained_aoi_is_all_masked_class() {
        let b = backend().with_asset("never", Raster::filled(test_grid(), 0.0)).unwrap();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let area = aoi();
        let mut sel = LayerSelection::new();
        sel.benefits
            .add(BenefitLayer::benefit("forest", "forest", 2).with_theme("biodiversity", "forest"))
            .unwrap();
        sel.constraints
            .add(ConstraintLayer::constraint("never", "never", ConstraintRule::Binary { value: 1.0 }))
            .unwrap();

        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&sel, &area).unwrap();
        let stats = compute_stats(&result, &sel, &area, &b, &cancel).unwrap();
        let primary = &stats[0]["aoi"];

        let classes: Vec<i64> = primary.suitability.values.iter().map(|l| l.class).collect();
        assert_eq!(classes, vec![6]);
        let region_m2 = b
            .reduce(&Expr::constant(1.0), &Reducer::Area, area.primary().unwrap(), &cancel)
            .unwrap()
            .get("area")
            .unwrap();
        assert_relative_eq!(primary.suitability.values[0].sum, region_m2 / M2_PER_HA, max_relative = 1e-9);
        assert_eq!(primary.layer("benefit", "forest").unwrap().value(), None);
        assert_relative_eq!(primary.layer("constraint", "never").unwrap().value().unwrap(), 100.0);
    }

    #[test]
    fn sub_regions_follow_the_primary_region() {
        let mut area = aoi();
        area.add_sub_region(Region::rect("west", 0.0, -2.0, 2.0, 2.0).with_color("#ff0000"));
        area.add_sub_region(Region::rect("offshore", 50.0, 50.0, 51.0, 51.0));
        let (stats, _) = run(&area);
        assert_eq!(stats.len(), 3);
        let names: Vec<&String> = stats.iter().flat_map(|s| s.keys()).collect();
        assert_eq!(names, vec!["aoi", "west", "offshore"]);
        assert_eq!(stats[1]["west"].color, "#ff0000");

        let offshore = &stats[2]["offshore"];
        assert_eq!(offshore.suitability.total, 0.0);
        let forest = offshore.layer("benefit", "forest").unwrap();
        assert_eq!(forest.value(), None, "no pixels must read as null");
        assert_eq!(offshore.layer("cost", "land").unwrap().value(), None);
    }
}
