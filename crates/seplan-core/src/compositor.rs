//! Builds the benefit, benefit/cost and suitability indices for one scenario.
//!
//! Pipeline, all over the primary region of the AOI:
//!
//!   benefit      = pclip(aggregate(normalize(benefits)))
//!   benefit_cost = pclip(benefit / (minmax(Σ costs) + ε))   or benefit without costs
//!   suitability  = pclip(benefit_cost masked by constraints)
//!   classified   = round(suitability · 4 + 1), masked pixels = 6
//!
//! `pclip` is percentile-clip with the configured percentiles. Masking is
//! applied strictly after the ratio.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::aggregate::{aggregate_benefits, ThemeTerm, WeightedImage};
use crate::backend::{CancelToken, RasterBackend};
use crate::catalog::LayerSelection;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::expr::Expr;
use crate::geometry::{AreaOfInterest, Region};
use crate::mask::constraint_mask;
use crate::normalize::{min_max, percentile_clip, Normalizer};

/// Class value of masked pixels in the classified product.
pub const MASKED_CLASS: f64 = 6.0;

/// Non-fatal findings of a composition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Per benefit layer, the spatial units quintile classification skipped.
    pub invalid_regions: BTreeMap<String, Vec<String>>,
    /// Themes excluded because all their weights are 0.
    pub skipped_themes: Vec<String>,
    /// Active themes with their effective weight.
    pub theme_weights: Vec<(String, f64)>,
    /// Unit shared by the cost layers.
    pub cost_unit: Option<String>,
}

/// Lazy outputs of one composition.
#[derive(Debug, Clone, PartialEq)]
pub struct SuitabilityResult {
    pub benefit_index: Expr,
    pub benefit_cost_index: Expr,
    /// In [0, 1], no data where a constraint excludes the pixel.
    pub suitability_index: Expr,
    /// 1..=5, or 6 where masked.
    pub classified: Expr,
    /// Combined keep mask of all constraints.
    pub constraint_mask: Expr,
    /// Raw sum of cost layers, `None` without costs.
    pub cost_sum: Option<Expr>,
    pub diagnostics: Diagnostics,
}

pub struct IndexCompositor<'a> {
    config: &'a EngineConfig,
    backend: &'a dyn RasterBackend,
    cancel: &'a CancelToken,
}

impl<'a> IndexCompositor<'a> {
    pub fn new(config: &'a EngineConfig, backend: &'a dyn RasterBackend, cancel: &'a CancelToken) -> Self {
        Self {
            config,
            backend,
            cancel,
        }
    }

    fn pclip(&self, image: &Expr, region: &Region, label: &str) -> Expr {
        percentile_clip(image, region, label, self.config.percentiles, self.config.epsilon)
    }

    fn clip(&self, image: Expr, region: &Region) -> Expr {
        if self.config.clip_to_aoi {
            image.clip(region)
        } else {
            image
        }
    }

    /// Renormalised theme-weighted benefit index.
    pub fn benefit_index(&self, selection: &LayerSelection, aoi: &AreaOfInterest) -> Result<(Expr, Diagnostics)> {
        let region = aoi.primary()?;
        let normalizer = Normalizer {
            strategy: self.config.benefit_normalization,
            percentiles: self.config.percentiles,
            epsilon: self.config.epsilon,
            region,
            backend: self.backend,
            cancel: self.cancel,
        };

        let mut diagnostics = Diagnostics::default();
        let mut weighted = Vec::with_capacity(selection.benefits.len());
        for layer in &selection.benefits {
            // weight-0 layers are dropped by the aggregator; skip the work
            let image = if layer.weight() == 0 {
                layer.image()
            } else {
                let n = normalizer.normalize(&layer.image(), &layer.id)?;
                if !n.invalid_regions.is_empty() {
                    warn!(layer = %layer.id, regions = ?n.invalid_regions, "benefit has no data in some regions");
                    diagnostics.invalid_regions.insert(layer.id.clone(), n.invalid_regions);
                }
                n.image
            };
            weighted.push(WeightedImage {
                id: layer.id.clone(),
                theme: layer.theme.clone(),
                weight: layer.weight(),
                image,
            });
        }

        let agg = aggregate_benefits(&weighted, self.config.theme_weighting)?;
        diagnostics.skipped_themes = agg.skipped_themes;
        diagnostics.theme_weights = agg
            .themes
            .iter()
            .map(|ThemeTerm { theme, weight, .. }| (theme.clone(), *weight))
            .collect();

        let index = self.pclip(&agg.image, region, "benefit index");
        Ok((self.clip(index, region), diagnostics))
    }

    /// Benefit index divided by normalised total cost. Costs are summed raw,
    /// they share one unit.
    pub fn benefit_cost_index(
        &self,
        benefit: &Expr,
        selection: &LayerSelection,
        region: &Region,
    ) -> Result<(Expr, Option<Expr>)> {
        let unit = selection.cost_unit()?;
        let images: Vec<Expr> = selection.costs.iter().map(|l| l.image()).collect();
        let cost_sum = Expr::sum(&images);
        let index = match &cost_sum {
            Some(costs) => {
                debug!(layers = selection.costs.len(), unit = ?unit, "building benefit/cost ratio");
                let denominator = min_max(costs, region, "cost sum", self.config.epsilon);
                let ratio = benefit.safe_divide(&denominator, self.config.epsilon);
                self.clip(self.pclip(&ratio, region, "benefit/cost index"), region)
            }
            None => benefit.clone(),
        };
        Ok((index, cost_sum))
    }

    /// Compose every index of a scenario.
    pub fn compose(&self, selection: &LayerSelection, aoi: &AreaOfInterest) -> Result<SuitabilityResult> {
        let region = aoi.primary()?;
        self.cancel.check()?;

        let (benefit_index, mut diagnostics) = self.benefit_index(selection, aoi)?;
        let (benefit_cost_index, cost_sum) = self.benefit_cost_index(&benefit_index, selection, region)?;
        diagnostics.cost_unit = selection.cost_unit()?;

        let mask = constraint_mask(selection.constraints.iter());
        let masked = benefit_cost_index.update_mask(&mask);
        let suitability_index = self.clip(self.pclip(&masked, region, "suitability index"), region);

        // Masked pixels and pixels outside the AOI take the masked class
        // without resolving the suitability statistics.
        let excluded = mask.unmask(0.0).clip(region).unmask(0.0).eq_value(0.0);
        let classes = suitability_index
            .mul_scalar(4.0)
            .add_scalar(1.0)
            .round()
            .unmask(MASKED_CLASS);
        let classified = Expr::select(&excluded, &Expr::constant(MASKED_CLASS), &classes).clip(region);

        debug!(
            benefits = selection.benefits.len(),
            costs = selection.costs.len(),
            constraints = selection.constraints.len(),
            "composed suitability"
        );

        Ok(SuitabilityResult {
            benefit_index,
            benefit_cost_index,
            suitability_index,
            classified,
            constraint_mask: mask,
            cost_sum,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ThemeWeighting;
    use crate::backend::LocalBackend;
    use crate::catalog::{BenefitLayer, ConstraintLayer, ConstraintRule, CostLayer};
    use crate::error::SeplanError;
    use crate::geometry::Polygon;
    use crate::normalize::NormalizationStrategy;
    use crate::raster::Raster;
    use crate::testutil::{aoi, ramp_raster, test_grid};

    fn backend() -> LocalBackend {
        LocalBackend::new(test_grid())
            .with_asset("forest", ramp_raster(0.0, 1.0))
            .unwrap()
            .with_asset("water", ramp_raster(15.0, -1.0))
            .unwrap()
            .with_asset("land", ramp_raster(100.0, 0.0))
            .unwrap()
            .with_asset("labour", ramp_raster(300.0, 0.0))
            .unwrap()
            .with_asset("slope", ramp_raster(0.0, 10.0))
            .unwrap()
            .with_asset("flat", ramp_raster(0.5, 0.0))
            .unwrap()
    }

    fn selection() -> LayerSelection {
        let mut c = LayerSelection::new();
        c.benefits
            .add(BenefitLayer::benefit("forest", "forest", 3).with_theme("biodiversity", "forest"))
            .unwrap();
        c.benefits
            .add(BenefitLayer::benefit("water", "water", 1).with_theme("water", "supply"))
            .unwrap();
        c
    }

    #[test]
    fn missing_aoi_fails_every_compose() {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let err = IndexCompositor::new(&cfg, &b, &cancel)
            .compose(&selection(), &AreaOfInterest::default())
            .unwrap_err();
        assert!(matches!(err, SeplanError::MissingAoi));
    }

    #[test]
    fn composing_twice_gives_equal_expressions() {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let compositor = IndexCompositor::new(&cfg, &b, &cancel);
        let one = compositor.compose(&selection(), &aoi()).unwrap();
        let two = compositor.compose(&selection(), &aoi()).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn suitability_is_in_unit_range_and_classes_in_one_to_five() {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let area = aoi();
        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&selection(), &area).unwrap();
        let region = area.primary().unwrap();

        let s = result.suitability_index.materialize(&b, region, &cancel).unwrap();
        assert!(s.data.iter().all(|v| (0.0..=1.0).contains(v)), "suitability outside [0, 1]");
        let c = result.classified.materialize(&b, region, &cancel).unwrap();
        assert!(c.data.iter().all(|v| (1.0..=5.0).contains(v)), "class outside 1..=5: {:?}", c.data);
    }

    #[test]
    fn costs_are_summed_raw_before_the_ratio() {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let area = aoi();
        let mut cat = selection();
        cat.costs.add(CostLayer::cost("land", "land").with_unit("USD/ha")).unwrap();
        cat.costs.add(CostLayer::cost("labour", "labour").with_unit("USD/ha")).unwrap();

        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&cat, &area).unwrap();
        let sum = result.cost_sum.expect("costs present");
        assert_eq!(sum, Expr::asset("land").add(&Expr::asset("labour")));
        let r = sum.materialize(&b, area.primary().unwrap(), &cancel).unwrap();
        assert!(r.data.iter().all(|&v| v == 400.0));
        assert_eq!(result.diagnostics.cost_unit.as_deref(), Some("USD/ha"));
        assert_ne!(result.benefit_cost_index, result.benefit_index);
    }

    #[test]
    fn without_costs_the_benefit_index_is_reused() {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&selection(), &aoi()).unwrap();
        assert!(result.cost_sum.is_none());
        assert_eq!(result.benefit_cost_index, result.benefit_index);
    }

    #[test]
    fn constrained_pixels_are_class_six() {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let area = aoi();
        let mut cat = selection();
        cat.constraints
            .add(ConstraintLayer::constraint(
                "slope",
                "slope",
                ConstraintRule::Continuous { min: 0.0, max: 70.0 },
            ))
            .unwrap();
        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&cat, &area).unwrap();
        let region = area.primary().unwrap();

        let s = result.suitability_index.materialize(&b, region, &cancel).unwrap();
        let c = result.classified.materialize(&b, region, &cancel).unwrap();
        for i in 0..16 {
            if i > 7 {
                assert!(s.data[i].is_nan(), "pixel {i} should be masked");
                assert_eq!(c.data[i], 6.0);
            } else {
                assert!(c.data[i] <= 5.0, "pixel {i} kept but classified {}", c.data[i]);
            }
        }
    }

    #[test]
    fn constant_benefit_renormalises_to_zero() {
        let b = backend();
        let area = aoi();
        let cancel = CancelToken::none();
        let mut cat = LayerSelection::new();
        cat.benefits
            .add(BenefitLayer::benefit("flat", "flat", 4).with_theme("water", ""))
            .unwrap();
        for weighting in [ThemeWeighting::InverseMeanWeight, ThemeWeighting::WeightedAverage] {
            let cfg = EngineConfig {
                theme_weighting: weighting,
                ..EngineConfig::default()
            };
            let (index, _) = IndexCompositor::new(&cfg, &b, &cancel).benefit_index(&cat, &area).unwrap();
            let r = index.materialize(&b, area.primary().unwrap(), &cancel).unwrap();
            assert!(
                r.data.iter().all(|&v| v == 0.0),
                "{weighting:?}: constant benefit should renormalise to 0, got {:?}",
                r.data
            );
        }
    }

    #[test]
    fn quintile_units_without_data_reach_the_diagnostics() {
        let b = backend();
        let cancel = CancelToken::none();
        let cfg = EngineConfig {
            benefit_normalization: NormalizationStrategy::Quintile,
            ..EngineConfig::default()
        };
        let area = AreaOfInterest::new(Region::new(
            "country",
            vec![
                Polygon::rect(0.0, -2.0, 4.0, 2.0).named("inland"),
                Polygon::rect(50.0, 50.0, 51.0, 51.0).named("offshore"),
            ],
        ));

        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&selection(), &area).unwrap();
        let invalid = &result.diagnostics.invalid_regions;
        assert_eq!(invalid.get("forest"), Some(&vec!["offshore".to_string()]));
        assert_eq!(invalid.get("water"), Some(&vec!["offshore".to_string()]));

        let s = result.suitability_index.materialize(&b, area.primary().unwrap(), &cancel).unwrap();
        assert_eq!(s.valid_count(), 16);
        assert!(s.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn mixed_cost_units_are_rejected() {
        let b = backend();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let mut cat = selection();
        cat.costs.add(CostLayer::cost("land", "land").with_unit("USD/ha")).unwrap();
        cat.costs.add(CostLayer::cost("labour", "labour").with_unit("EUR/ha")).unwrap();
        let err = IndexCompositor::new(&cfg, &b, &cancel).compose(&cat, &aoi()).unwrap_err();
        assert!(matches!(err, SeplanError::MixedCostUnits { .. }));
    }

    #[test]
    fn all_pixels_masked_reports_no_data() {
        let b = backend().with_asset("none", Raster::filled(test_grid(), 0.0)).unwrap();
        let cfg = EngineConfig::default();
        let cancel = CancelToken::none();
        let area = aoi();
        let mut cat = selection();
        cat.constraints
            .add(ConstraintLayer::constraint("never", "none", ConstraintRule::Binary { value: 1.0 }))
            .unwrap();
        let result = IndexCompositor::new(&cfg, &b, &cancel).compose(&cat, &area).unwrap();
        let err = result
            .suitability_index
            .materialize(&b, area.primary().unwrap(), &cancel)
            .unwrap_err();
        assert!(matches!(err, SeplanError::NoDataInAoi { ref statistic, .. } if statistic.contains("suitability")));

        let c = result.classified.materialize(&b, area.primary().unwrap(), &cancel).unwrap();
        assert!(c.data.iter().all(|&v| f64::from(v) == MASKED_CLASS), "fully masked AOI must be class 6: {:?}", c.data);
    }
}
