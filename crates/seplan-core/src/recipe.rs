//! Recipe records: the plain shape a recipe file stores.
//!
//! Records are untyped on purpose (weights as integers, constraint values as
//! flat lists) so a file written by an older or hand-edited recipe still
//! loads. Records of catalogued layers may carry only their id and are
//! completed by [`RecipeRecord::resolve`]. Conversion into a
//! [`LayerSelection`] is where shapes are checked;
//! [`validate_recipe`] reports every problem at once and
//! [`RecipeRecord::filter_invalid_constraints`] drops broken constraints so
//! the rest of the recipe stays usable.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::catalog::{
    BenefitLayer, CatalogEntry, ConstraintLayer, ConstraintRule, CostLayer, DataType, Layer, LayerCatalog, LayerRole,
    LayerSelection, MAX_WEIGHT,
};
use crate::error::{Result, SeplanError};
use crate::geometry::AreaOfInterest;

fn null_as_nan<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<f64>, D::Error> {
    let v: Vec<Option<f64>> = Vec::deserialize(d)?;
    Ok(v.into_iter().map(|x| x.unwrap_or(f64::NAN)).collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenefitRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub subtheme: String,
    #[serde(default, alias = "asset")]
    pub asset_ref: String,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    pub weight: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default, alias = "asset")]
    pub asset_ref: String,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub theme: String,
    #[serde(default, alias = "asset")]
    pub asset_ref: String,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    pub data_type: DataType,
    /// `null` entries read back as NaN and fail validation.
    #[serde(default, deserialize_with = "null_as_nan")]
    pub values: Vec<f64>,
}

impl ConstraintRecord {
    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn rule(&self) -> Result<ConstraintRule> {
        ConstraintRule::from_values(self.display_name(), self.data_type, &self.values)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeRecord {
    #[serde(default)]
    pub aoi: Option<AreaOfInterest>,
    #[serde(default)]
    pub benefits: Vec<BenefitRecord>,
    #[serde(default)]
    pub costs: Vec<CostRecord>,
    #[serde(default)]
    pub constraints: Vec<ConstraintRecord>,
}

fn named<K>(mut layer: Layer<K>, name: &str, theme: &str, description: &str, unit: &str) -> Layer<K> {
    if !name.is_empty() {
        layer.name = name.to_string();
    }
    layer.theme = theme.to_string();
    layer.description = description.to_string();
    layer.unit = unit.to_string();
    layer
}

fn fill_blank(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

/// Copy catalog fields into the blank fields of a record.
fn fill_from(
    entry: &CatalogEntry,
    asset_ref: &mut String,
    name: &mut String,
    theme: &mut String,
    description: &mut String,
    unit: &mut String,
) {
    fill_blank(asset_ref, &entry.asset_ref);
    fill_blank(name, &entry.name);
    fill_blank(theme, &entry.theme);
    fill_blank(description, &entry.description);
    fill_blank(unit, &entry.unit);
}

fn require_asset(id: &str, asset_ref: &str) -> Result<()> {
    if asset_ref.is_empty() {
        return Err(SeplanError::MissingAssetRef(id.to_string()));
    }
    Ok(())
}

fn weight_of(r: &BenefitRecord) -> Result<u8> {
    u8::try_from(r.weight)
        .ok()
        .filter(|w| *w <= MAX_WEIGHT)
        .ok_or_else(|| SeplanError::InvalidWeight {
            id: r.id.clone(),
            weight: r.weight,
        })
}

impl RecipeRecord {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Complete records of catalogued layers from `catalog`. Fields the
    /// record sets itself win. Ids the catalog does not know are left as
    /// they are. Returns how many records were matched.
    pub fn resolve(&mut self, catalog: &LayerCatalog) -> Result<usize> {
        let mut matched = 0;
        for r in &mut self.benefits {
            if catalog.get(&r.id).is_none() {
                continue;
            }
            let e = catalog.entry(&r.id, LayerRole::Benefit)?;
            fill_from(e, &mut r.asset_ref, &mut r.name, &mut r.theme, &mut r.description, &mut r.unit);
            fill_blank(&mut r.subtheme, &e.subtheme);
            matched += 1;
        }
        for r in &mut self.costs {
            if catalog.get(&r.id).is_none() {
                continue;
            }
            let e = catalog.entry(&r.id, LayerRole::Cost)?;
            fill_from(e, &mut r.asset_ref, &mut r.name, &mut r.theme, &mut r.description, &mut r.unit);
            matched += 1;
        }
        for r in &mut self.constraints {
            if catalog.get(&r.id).is_none() {
                continue;
            }
            let e = catalog.entry(&r.id, LayerRole::Constraint)?;
            if let Some(declared) = e.data_type.filter(|d| *d != r.data_type) {
                return Err(SeplanError::InvalidConstraintValue {
                    name: r.id.clone(),
                    data_type: r.data_type.to_string(),
                    values: r.values.clone(),
                    cause: format!("catalog declares the layer {declared}"),
                });
            }
            fill_from(e, &mut r.asset_ref, &mut r.name, &mut r.theme, &mut r.description, &mut r.unit);
            matched += 1;
        }
        info!(matched, "resolved recipe against the layer catalog");
        Ok(matched)
    }

    /// Typed layer sets; fails on the first invalid record.
    pub fn to_selection(&self) -> Result<LayerSelection> {
        let mut selection = LayerSelection::new();
        for r in &self.benefits {
            require_asset(&r.id, &r.asset_ref)?;
            let mut layer = BenefitLayer::benefit(&r.id, &r.asset_ref, weight_of(r)?);
            layer = named(layer, &r.name, &r.theme, &r.description, &r.unit);
            layer.subtheme = r.subtheme.clone();
            selection.benefits.add(layer)?;
        }
        for r in &self.costs {
            require_asset(&r.id, &r.asset_ref)?;
            let layer = CostLayer::cost(&r.id, &r.asset_ref);
            selection
                .costs
                .add(named(layer, &r.name, &r.theme, &r.description, &r.unit))?;
        }
        for r in &self.constraints {
            require_asset(&r.id, &r.asset_ref)?;
            let layer = ConstraintLayer::constraint(&r.id, &r.asset_ref, r.rule()?);
            selection
                .constraints
                .add(named(layer, &r.name, &r.theme, &r.description, &r.unit))?;
        }
        Ok(selection)
    }

    pub fn from_selection(selection: &LayerSelection) -> Self {
        Self {
            aoi: None,
            benefits: selection
                .benefits
                .iter()
                .map(|l| BenefitRecord {
                    id: l.id.clone(),
                    name: l.name.clone(),
                    theme: l.theme.clone(),
                    subtheme: l.subtheme.clone(),
                    asset_ref: l.asset_ref.clone(),
                    description: l.description.clone(),
                    unit: l.unit.clone(),
                    weight: l.weight() as i64,
                })
                .collect(),
            costs: selection
                .costs
                .iter()
                .map(|l| CostRecord {
                    id: l.id.clone(),
                    name: l.name.clone(),
                    theme: l.theme.clone(),
                    asset_ref: l.asset_ref.clone(),
                    description: l.description.clone(),
                    unit: l.unit.clone(),
                })
                .collect(),
            constraints: selection
                .constraints
                .iter()
                .map(|l| ConstraintRecord {
                    id: l.id.clone(),
                    name: l.name.clone(),
                    theme: l.theme.clone(),
                    asset_ref: l.asset_ref.clone(),
                    description: l.description.clone(),
                    unit: l.unit.clone(),
                    data_type: l.rule().data_type(),
                    values: l.rule().values(),
                })
                .collect(),
        }
    }

    /// Remove constraints whose values do not fit their data type and return
    /// what was removed.
    pub fn filter_invalid_constraints(&mut self) -> Vec<RecordError> {
        let total = self.constraints.len();
        let mut removed = Vec::new();
        let mut index = 0;
        self.constraints.retain(|r| {
            let i = index;
            index += 1;
            match r.rule() {
                Ok(_) => true,
                Err(e) => {
                    warn!(constraint = %r.id, error = %e, "dropping invalid constraint");
                    removed.push(RecordError::new(i, &r.id, r.display_name(), e.to_string()));
                    false
                }
            }
        });
        if !removed.is_empty() {
            info!(removed = removed.len(), total, "filtered invalid constraints");
        }
        removed
    }
}

/// One invalid record, by position in its list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordError {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub error: String,
}

impl RecordError {
    fn new(index: usize, id: &str, name: &str, error: String) -> Self {
        Self {
            index,
            id: id.to_string(),
            name: name.to_string(),
            error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub benefits: Vec<RecordError>,
    pub costs: Vec<RecordError>,
    pub constraints: Vec<RecordError>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.total_errors() > 0
    }

    pub fn total_errors(&self) -> usize {
        self.benefits.len() + self.costs.len() + self.constraints.len()
    }
}

fn duplicate<'a>(seen: &mut HashSet<&'a str>, id: &'a str) -> Option<String> {
    (!seen.insert(id)).then(|| SeplanError::DuplicateLayer(id.to_string()).to_string())
}

fn missing_asset(id: &str, asset_ref: &str) -> Option<String> {
    require_asset(id, asset_ref).err().map(|e| e.to_string())
}

/// Check every record and collect all problems instead of stopping at the
/// first one.
pub fn validate_recipe(recipe: &RecipeRecord) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut seen = HashSet::new();
    for (i, r) in recipe.benefits.iter().enumerate() {
        let problem = duplicate(&mut seen, &r.id)
            .or_else(|| missing_asset(&r.id, &r.asset_ref))
            .or_else(|| weight_of(r).err().map(|e| e.to_string()));
        if let Some(error) = problem {
            report.benefits.push(RecordError::new(i, &r.id, &r.name, error));
        }
    }

    let mut seen = HashSet::new();
    for (i, r) in recipe.costs.iter().enumerate() {
        if let Some(error) = duplicate(&mut seen, &r.id).or_else(|| missing_asset(&r.id, &r.asset_ref)) {
            report.costs.push(RecordError::new(i, &r.id, &r.name, error));
        }
    }

    let mut seen = HashSet::new();
    for (i, r) in recipe.constraints.iter().enumerate() {
        let problem = duplicate(&mut seen, &r.id)
            .or_else(|| missing_asset(&r.id, &r.asset_ref))
            .or_else(|| r.rule().err().map(|e| e.to_string()));
        if let Some(error) = problem {
            report.constraints.push(RecordError::new(i, &r.id, r.display_name(), error));
        }
    }

    report
}
