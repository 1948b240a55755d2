//! Candidate layers and the per-analysis layer selection.
//!
//! [`LayerCatalog`] is the read-only list of layers an analysis can pick
//! from, loaded once and looked up by id. [`LayerSelection`] holds the
//! benefit, cost and constraint sets of one analysis. It is a plain value:
//! callers mutate it through the `LayerSet` operations and hand an immutable
//! [`LayerSelection::snapshot`] to each computation, so a later edit never
//! leaks into a running evaluation.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeplanError};
use crate::expr::Expr;

/// Largest accepted benefit weight.
pub const MAX_WEIGHT: u8 = 4;

/// Constraint data type, as stored in recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Continuous,
    Binary,
    Categorical,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Continuous => "continuous",
            DataType::Binary => "binary",
            DataType::Categorical => "categorical",
        };
        f.write_str(s)
    }
}

/// Keep rule of a constraint layer. Pixels that satisfy the rule stay in the
/// analysis; all others are excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "data_type", rename_all = "lowercase")]
pub enum ConstraintRule {
    /// Keep `min <= x <= max`.
    Continuous { min: f64, max: f64 },
    /// Keep `x == value`, value is 0 or 1.
    Binary { value: f64 },
    /// Keep `x` in `codes`.
    Categorical { codes: Vec<f64> },
}

impl ConstraintRule {
    pub fn data_type(&self) -> DataType {
        match self {
            ConstraintRule::Continuous { .. } => DataType::Continuous,
            ConstraintRule::Binary { .. } => DataType::Binary,
            ConstraintRule::Categorical { .. } => DataType::Categorical,
        }
    }

    /// Flat value list in the shape recipes store.
    pub fn values(&self) -> Vec<f64> {
        match self {
            ConstraintRule::Continuous { min, max } => vec![*min, *max],
            ConstraintRule::Binary { value } => vec![*value],
            ConstraintRule::Categorical { codes } => codes.clone(),
        }
    }

    /// Build a rule from a stored value list, checking its shape.
    ///
    /// * continuous: exactly two finite values, `min <= max`
    /// * binary: exactly one value, 0 or 1
    /// * categorical: at least one finite code
    pub fn from_values(name: &str, data_type: DataType, values: &[f64]) -> Result<Self> {
        let invalid = |cause: &str| SeplanError::InvalidConstraintValue {
            name: name.to_string(),
            data_type: data_type.to_string(),
            values: values.to_vec(),
            cause: cause.to_string(),
        };

        if values.is_empty() {
            return Err(invalid("no values"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(invalid("values must be finite numbers"));
        }

        match data_type {
            DataType::Continuous => {
                if values.len() != 2 {
                    return Err(invalid("continuous constraints need exactly [min, max]"));
                }
                let (min, max) = (values[0], values[1]);
                if min > max {
                    return Err(invalid("min is greater than max"));
                }
                Ok(ConstraintRule::Continuous { min, max })
            }
            DataType::Binary => {
                if values.len() != 1 {
                    return Err(invalid("binary constraints need exactly one value"));
                }
                let value = values[0];
                if value != 0.0 && value != 1.0 {
                    return Err(invalid("binary value must be 0 or 1"));
                }
                Ok(ConstraintRule::Binary { value })
            }
            DataType::Categorical => Ok(ConstraintRule::Categorical {
                codes: values.to_vec(),
            }),
        }
    }
}

// ── Layers ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benefit {
    pub weight: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub rule: ConstraintRule,
}

/// A catalogued raster layer with kind-specific payload `K`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer<K> {
    pub id: String,
    pub name: String,
    pub asset_ref: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub subtheme: String,
    #[serde(default)]
    pub unit: String,
    pub kind: K,
}

impl<K> Layer<K> {
    pub fn new(id: impl Into<String>, asset_ref: impl Into<String>, kind: K) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            asset_ref: asset_ref.into(),
            description: String::new(),
            theme: String::new(),
            subtheme: String::new(),
            unit: String::new(),
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>, subtheme: impl Into<String>) -> Self {
        self.theme = theme.into();
        self.subtheme = subtheme.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Raw raster of this layer.
    pub fn image(&self) -> Expr {
        Expr::asset(&self.asset_ref)
    }
}

pub type BenefitLayer = Layer<Benefit>;
pub type CostLayer = Layer<Cost>;
pub type ConstraintLayer = Layer<Constraint>;

impl BenefitLayer {
    pub fn benefit(id: impl Into<String>, asset_ref: impl Into<String>, weight: u8) -> Self {
        Layer::new(id, asset_ref, Benefit { weight })
    }

    pub fn weight(&self) -> u8 {
        self.kind.weight
    }
}

impl CostLayer {
    pub fn cost(id: impl Into<String>, asset_ref: impl Into<String>) -> Self {
        Layer::new(id, asset_ref, Cost)
    }
}

impl ConstraintLayer {
    pub fn constraint(id: impl Into<String>, asset_ref: impl Into<String>, rule: ConstraintRule) -> Self {
        Layer::new(id, asset_ref, Constraint { rule })
    }

    pub fn rule(&self) -> &ConstraintRule {
        &self.kind.rule
    }
}

/// Checks a kind applies when a layer enters a set.
pub trait LayerKind: Sized {
    fn validate(_layer: &Layer<Self>) -> Result<()> {
        Ok(())
    }
}

impl LayerKind for Benefit {
    fn validate(layer: &Layer<Self>) -> Result<()> {
        if layer.kind.weight > MAX_WEIGHT {
            return Err(SeplanError::InvalidWeight {
                id: layer.id.clone(),
                weight: layer.kind.weight as i64,
            });
        }
        Ok(())
    }
}

impl LayerKind for Cost {}
impl LayerKind for Constraint {}

// ── Layer sets ───────────────────────────────────────────────────────────────

/// Insertion-ordered layers keyed by unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerSet<K> {
    layers: Vec<Layer<K>>,
}

impl<K> Default for LayerSet<K> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<K: LayerKind> LayerSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, layer: Layer<K>) -> Result<()> {
        if self.get(&layer.id).is_some() {
            return Err(SeplanError::DuplicateLayer(layer.id));
        }
        K::validate(&layer)?;
        self.layers.push(layer);
        Ok(())
    }

    /// Replace the layer with the same id, keeping its position.
    pub fn update(&mut self, layer: Layer<K>) -> Result<()> {
        K::validate(&layer)?;
        match self.layers.iter_mut().find(|l| l.id == layer.id) {
            Some(slot) => {
                *slot = layer;
                Ok(())
            }
            None => Err(SeplanError::UnknownLayer(layer.id)),
        }
    }

    /// Removing the last layer is allowed.
    pub fn remove(&mut self, id: &str) -> Result<Layer<K>> {
        let idx = self
            .layers
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| SeplanError::UnknownLayer(id.to_string()))?;
        Ok(self.layers.remove(idx))
    }

    pub fn get(&self, id: &str) -> Option<&Layer<K>> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Layer<K>> {
        self.layers.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl LayerSet<Benefit> {
    pub fn set_weight(&mut self, id: &str, weight: u8) -> Result<()> {
        let mut layer = self
            .get(id)
            .cloned()
            .ok_or_else(|| SeplanError::UnknownLayer(id.to_string()))?;
        layer.kind.weight = weight;
        self.update(layer)
    }
}

impl LayerSet<Constraint> {
    pub fn set_rule(&mut self, id: &str, rule: ConstraintRule) -> Result<()> {
        let mut layer = self
            .get(id)
            .cloned()
            .ok_or_else(|| SeplanError::UnknownLayer(id.to_string()))?;
        layer.kind.rule = rule;
        self.update(layer)
    }
}

impl<'a, K> IntoIterator for &'a LayerSet<K> {
    type Item = &'a Layer<K>;
    type IntoIter = std::slice::Iter<'a, Layer<K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

// ── Selection ────────────────────────────────────────────────────────────────

/// The three layer sets of one analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerSelection {
    #[serde(default)]
    pub benefits: LayerSet<Benefit>,
    #[serde(default)]
    pub costs: LayerSet<Cost>,
    #[serde(default)]
    pub constraints: LayerSet<Constraint>,
}

impl LayerSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable copy for one computation.
    pub fn snapshot(&self) -> Arc<LayerSelection> {
        Arc::new(self.clone())
    }

    /// The unit shared by every cost layer, `None` without costs.
    pub fn cost_unit(&self) -> Result<Option<String>> {
        let units: BTreeSet<&str> = self.costs.iter().map(|l| l.unit.as_str()).collect();
        match units.len() {
            0 => Ok(None),
            1 => Ok(units.into_iter().next().map(str::to_string)),
            _ => Err(SeplanError::MixedCostUnits {
                units: units.into_iter().map(str::to_string).collect(),
            }),
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// Which set a catalogued layer can enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerRole {
    Benefit,
    Cost,
    Constraint,
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LayerRole::Benefit => "benefit",
            LayerRole::Cost => "cost",
            LayerRole::Constraint => "constraint",
        };
        f.write_str(s)
    }
}

/// One candidate layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(alias = "layer_id")]
    pub id: String,
    pub role: LayerRole,
    #[serde(alias = "gee_asset", alias = "asset")]
    pub asset_ref: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "desc")]
    pub description: String,
    /// Benefit theme, or the grouping shown for costs and constraints.
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub subtheme: String,
    #[serde(default)]
    pub unit: String,
    /// Value semantics of constraint layers.
    #[serde(default)]
    pub data_type: Option<DataType>,
}

impl CatalogEntry {
    fn layer<K>(&self, kind: K) -> Layer<K> {
        let mut layer = Layer::new(&self.id, &self.asset_ref, kind)
            .with_theme(&self.theme, &self.subtheme)
            .with_unit(&self.unit)
            .with_description(&self.description);
        if !self.name.is_empty() {
            layer.name = self.name.clone();
        }
        layer
    }
}

/// Read-only list of candidate layers, unique by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CatalogEntry>", into = "Vec<CatalogEntry>")]
pub struct LayerCatalog {
    entries: Vec<CatalogEntry>,
}

impl TryFrom<Vec<CatalogEntry>> for LayerCatalog {
    type Error = SeplanError;

    fn try_from(entries: Vec<CatalogEntry>) -> Result<Self> {
        Self::new(entries)
    }
}

impl From<LayerCatalog> for Vec<CatalogEntry> {
    fn from(catalog: LayerCatalog) -> Self {
        catalog.entries
    }
}

impl LayerCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for e in &entries {
            if !seen.insert(e.id.as_str()) {
                return Err(SeplanError::DuplicateLayer(e.id.clone()));
            }
        }
        Ok(Self { entries })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CatalogEntry> {
        self.entries.iter()
    }

    pub fn of_role(&self, role: LayerRole) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(move |e| e.role == role)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry `id`, which must have `role`.
    pub fn entry(&self, id: &str, role: LayerRole) -> Result<&CatalogEntry> {
        let entry = self.get(id).ok_or_else(|| SeplanError::UnknownLayer(id.to_string()))?;
        if entry.role != role {
            return Err(SeplanError::WrongLayerRole {
                id: id.to_string(),
                expected: role.to_string(),
                found: entry.role.to_string(),
            });
        }
        Ok(entry)
    }

    pub fn benefit(&self, id: &str, weight: u8) -> Result<BenefitLayer> {
        Ok(self.entry(id, LayerRole::Benefit)?.layer(Benefit { weight }))
    }

    pub fn cost(&self, id: &str) -> Result<CostLayer> {
        Ok(self.entry(id, LayerRole::Cost)?.layer(Cost))
    }

    pub fn constraint(&self, id: &str, rule: ConstraintRule) -> Result<ConstraintLayer> {
        let entry = self.entry(id, LayerRole::Constraint)?;
        if let Some(declared) = entry.data_type {
            if declared != rule.data_type() {
                return Err(SeplanError::InvalidConstraintValue {
                    name: entry.id.clone(),
                    data_type: declared.to_string(),
                    values: rule.values(),
                    cause: format!("rule is {}, layer is {declared}", rule.data_type()),
                });
            }
        }
        Ok(entry.layer(Constraint { rule }))
    }
}

impl LayerSelection {
    /// Starting selection of a new analysis: every catalogued benefit at full
    /// weight, no costs, no constraints.
    pub fn defaults(catalog: &LayerCatalog) -> Result<Self> {
        let mut selection = Self::new();
        for entry in catalog.of_role(LayerRole::Benefit) {
            selection.benefits.add(catalog.benefit(&entry.id, MAX_WEIGHT)?)?;
        }
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> LayerCatalog {
        LayerCatalog::from_json(
            r#"[
                { "layer_id": "forest", "role": "benefit", "gee_asset": "assets/forest", "theme": "biodiversity", "unit": "%" },
                { "layer_id": "water", "role": "benefit", "gee_asset": "assets/water", "theme": "water" },
                { "layer_id": "land", "role": "cost", "gee_asset": "assets/land", "unit": "USD/ha" },
                { "layer_id": "slope", "role": "constraint", "gee_asset": "assets/slope", "data_type": "continuous" }
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut set = LayerSet::new();
        set.add(BenefitLayer::benefit("forest", "assets/forest", 2)).unwrap();
        let err = set.add(BenefitLayer::benefit("forest", "assets/other", 1)).unwrap_err();
        assert!(matches!(err, SeplanError::DuplicateLayer(ref id) if id == "forest"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn weights_above_four_are_rejected() {
        let mut set = LayerSet::new();
        let err = set.add(BenefitLayer::benefit("water", "assets/water", 5)).unwrap_err();
        assert!(matches!(err, SeplanError::InvalidWeight { weight: 5, .. }));
        set.add(BenefitLayer::benefit("water", "assets/water", 0)).unwrap();
        assert!(set.set_weight("water", 9).is_err());
        assert_eq!(set.get("water").unwrap().weight(), 0);
        set.set_weight("water", 4).unwrap();
        assert_eq!(set.get("water").unwrap().weight(), 4);
    }

    #[test]
    fn removing_last_layer_is_allowed() {
        let mut set = LayerSet::new();
        set.add(CostLayer::cost("land", "assets/land")).unwrap();
        set.remove("land").unwrap();
        assert!(set.is_empty());
        assert!(matches!(set.remove("land"), Err(SeplanError::UnknownLayer(_))));
    }

    #[test]
    fn update_keeps_position() {
        let mut set = LayerSet::new();
        for id in ["a", "b", "c"] {
            set.add(CostLayer::cost(id, id)).unwrap();
        }
        set.update(CostLayer::cost("b", "b2").with_unit("USD/ha")).unwrap();
        assert_eq!(set.ids(), vec!["a", "b", "c"]);
        assert_eq!(set.get("b").unwrap().asset_ref, "b2");
    }

    #[test]
    fn constraint_shapes_by_data_type() {
        assert_eq!(
            ConstraintRule::from_values("slope", DataType::Continuous, &[10.0, 50.0]).unwrap(),
            ConstraintRule::Continuous { min: 10.0, max: 50.0 }
        );
        assert!(ConstraintRule::from_values("slope", DataType::Continuous, &[5.0, 5.0]).is_ok());
        assert!(ConstraintRule::from_values("slope", DataType::Continuous, &[50.0, 10.0]).is_err());
        assert!(ConstraintRule::from_values("slope", DataType::Continuous, &[10.0]).is_err());
        assert!(ConstraintRule::from_values("protected", DataType::Binary, &[1.0]).is_ok());
        assert!(ConstraintRule::from_values("protected", DataType::Binary, &[2.0]).is_err());
        assert!(ConstraintRule::from_values("protected", DataType::Binary, &[0.0, 1.0]).is_err());
        assert!(ConstraintRule::from_values("landcover", DataType::Categorical, &[1.0, 4.0, 7.0]).is_ok());
        let err = ConstraintRule::from_values("landcover", DataType::Categorical, &[]).unwrap_err();
        match err {
            SeplanError::InvalidConstraintValue { name, data_type, .. } => {
                assert_eq!(name, "landcover");
                assert_eq!(data_type, "categorical");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rule_values_match_stored_shape() {
        let rule = ConstraintRule::Continuous { min: 1.0, max: 2.0 };
        assert_eq!(rule.data_type(), DataType::Continuous);
        assert_eq!(rule.values(), vec![1.0, 2.0]);
        let back = ConstraintRule::from_values("x", rule.data_type(), &rule.values()).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_edits() {
        let mut selection = LayerSelection::new();
        selection.benefits.add(BenefitLayer::benefit("a", "a", 1)).unwrap();
        let snap = selection.snapshot();
        selection.benefits.add(BenefitLayer::benefit("b", "b", 1)).unwrap();
        assert_eq!(snap.benefits.len(), 1);
        assert_eq!(selection.benefits.len(), 2);
    }

    #[test]
    fn cost_units_must_agree() {
        let mut selection = LayerSelection::new();
        assert_eq!(selection.cost_unit().unwrap(), None);
        selection.costs.add(CostLayer::cost("a", "a").with_unit("USD/ha")).unwrap();
        selection.costs.add(CostLayer::cost("b", "b").with_unit("USD/ha")).unwrap();
        assert_eq!(selection.cost_unit().unwrap().as_deref(), Some("USD/ha"));
        selection.costs.add(CostLayer::cost("c", "c").with_unit("EUR/ha")).unwrap();
        assert!(matches!(selection.cost_unit(), Err(SeplanError::MixedCostUnits { .. })));
    }

    #[test]
    fn catalog_resolves_layers_by_id_and_role() {
        let catalog = candidates();
        assert_eq!(catalog.len(), 4);
        let forest = catalog.benefit("forest", 2).unwrap();
        assert_eq!((forest.asset_ref.as_str(), forest.theme.as_str(), forest.weight()), ("assets/forest", "biodiversity", 2));
        assert_eq!(catalog.cost("land").unwrap().unit, "USD/ha");

        assert!(matches!(catalog.cost("nope"), Err(SeplanError::UnknownLayer(_))));
        match catalog.cost("forest") {
            Err(SeplanError::WrongLayerRole { expected, found, .. }) => {
                assert_eq!((expected.as_str(), found.as_str()), ("cost", "benefit"));
            }
            other => panic!("expected WrongLayerRole, got {other:?}"),
        }
        let binary = ConstraintRule::Binary { value: 1.0 };
        assert!(matches!(
            catalog.constraint("slope", binary),
            Err(SeplanError::InvalidConstraintValue { .. })
        ));
        assert!(catalog
            .constraint("slope", ConstraintRule::Continuous { min: 0.0, max: 30.0 })
            .is_ok());
    }

    #[test]
    fn catalog_rejects_duplicate_ids() {
        let text = r#"[
            { "id": "a", "role": "cost", "asset_ref": "a" },
            { "id": "a", "role": "benefit", "asset_ref": "b" }
        ]"#;
        assert!(LayerCatalog::from_json(text).is_err());
    }

    #[test]
    fn default_selection_takes_every_benefit_at_full_weight() {
        let selection = LayerSelection::defaults(&candidates()).unwrap();
        assert_eq!(selection.benefits.ids(), vec!["forest", "water"]);
        assert!(selection.benefits.iter().all(|l| l.weight() == MAX_WEIGHT));
        assert!(selection.costs.is_empty());
        assert!(selection.constraints.is_empty());
    }
}
