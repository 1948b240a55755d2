//! Theme-weighted combination of normalised benefit layers.
//!
//! Layers are grouped by theme in order of first appearance. Each theme
//! contributes one term whose weight is the mean of its layer weights rounded
//! to 5 decimals. Weight-0 layers stay in the selection but never contribute.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SeplanError};
use crate::expr::Expr;

/// How theme terms are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeWeighting {
    /// `Σ_t (Σ_i x_i) / w_t`
    #[default]
    InverseMeanWeight,
    /// `Σ_t mean_i(x_i) · w_t / Σ_t w_t`
    WeightedAverage,
}

/// A normalised benefit layer ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedImage {
    pub id: String,
    pub theme: String,
    pub weight: u8,
    pub image: Expr,
}

/// One theme's contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct ThemeTerm {
    pub theme: String,
    /// Mean layer weight, rounded to 5 decimals.
    pub weight: f64,
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub image: Expr,
    pub themes: Vec<ThemeTerm>,
    /// Themes left out because every layer in them has weight 0.
    pub skipped_themes: Vec<String>,
}

fn round5(x: f64) -> f64 {
    (x * 1e5).round() / 1e5
}

struct ThemeGroup<'a> {
    theme: &'a str,
    members: Vec<&'a WeightedImage>,
}

/// Group by theme, stable in order of first appearance.
fn group_by_theme(layers: &[WeightedImage]) -> Vec<ThemeGroup<'_>> {
    let mut groups: Vec<ThemeGroup<'_>> = Vec::new();
    for layer in layers {
        match groups.iter_mut().find(|g| g.theme == layer.theme) {
            Some(g) => g.members.push(layer),
            None => groups.push(ThemeGroup {
                theme: &layer.theme,
                members: vec![layer],
            }),
        }
    }
    groups
}

/// Combine benefit layers into one (not yet renormalised) index.
///
/// Fails with `DegenerateWeight` when no theme has a non-zero weight.
pub fn aggregate_benefits(layers: &[WeightedImage], weighting: ThemeWeighting) -> Result<Aggregation> {
    let groups = group_by_theme(layers);

    let mut themes = Vec::new();
    let mut skipped_themes = Vec::new();
    let mut terms: Vec<(Expr, f64)> = Vec::new();

    for group in &groups {
        let active: Vec<&WeightedImage> = group.members.iter().copied().filter(|l| l.weight > 0).collect();
        for dropped in group.members.iter().filter(|l| l.weight == 0) {
            debug!(layer = %dropped.id, theme = group.theme, "weight 0, layer excluded");
        }

        let weight = if active.is_empty() {
            0.0
        } else {
            round5(active.iter().map(|l| l.weight as f64).sum::<f64>() / active.len() as f64)
        };
        if weight == 0.0 {
            warn!(theme = group.theme, "theme has zero weight and is excluded from the index");
            skipped_themes.push(group.theme.to_string());
            continue;
        }

        // `active` is non-empty here.
        let sum = match Expr::sum(active.iter().map(|l| &l.image)) {
            Some(sum) => sum,
            None => continue,
        };
        let theme_image = match weighting {
            ThemeWeighting::InverseMeanWeight => sum,
            ThemeWeighting::WeightedAverage if active.len() > 1 => sum.div_scalar(active.len() as f64),
            ThemeWeighting::WeightedAverage => sum,
        };
        terms.push((theme_image, weight));
        themes.push(ThemeTerm {
            theme: group.theme.to_string(),
            weight,
            layers: active.iter().map(|l| l.id.clone()).collect(),
        });
    }

    if terms.is_empty() {
        return Err(SeplanError::DegenerateWeight {
            themes: groups.iter().map(|g| g.theme.to_string()).collect(),
        });
    }

    let weighted: Vec<Expr> = match weighting {
        ThemeWeighting::InverseMeanWeight => terms.iter().map(|(img, w)| img.div_scalar(*w)).collect(),
        ThemeWeighting::WeightedAverage => {
            let total: f64 = terms.iter().map(|(_, w)| w).sum();
            terms.iter().map(|(img, w)| img.mul_scalar(w / total)).collect()
        }
    };

    let image = match Expr::sum(&weighted) {
        Some(image) => image,
        None => return Err(SeplanError::DegenerateWeight { themes: Vec::new() }),
    };

    debug!(themes = themes.len(), skipped = skipped_themes.len(), ?weighting, "aggregated benefits");
    Ok(Aggregation {
        image,
        themes,
        skipped_themes,
    })
}
