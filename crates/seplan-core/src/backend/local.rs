//! In-process backend evaluating expressions over in-memory rasters.
//!
//! All assets share one grid. One evaluation pass memoises every node and
//! every resolved statistic by identity, so a statistic whose source is also
//! part of the outer expression is only computed once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use geo::{Intersects, Point};
use tracing::debug;

use super::{CancelToken, RasterBackend, Reducer, Reduction};
use crate::error::{Result, SeplanError};
use crate::expr::{percentile_key, safe_divide, BinaryOp, Expr, Node, Scalar, UnaryOp};
use crate::geometry::Region;
use crate::raster::{Grid, Raster};

/// Backend holding named rasters on a common grid.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    grid: Grid,
    assets: HashMap<String, Raster>,
}

impl LocalBackend {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid,
            assets: HashMap::new(),
        }
    }

    /// Build from assets; the first asset defines the grid.
    pub fn from_assets(assets: impl IntoIterator<Item = (String, Raster)>) -> Result<Self> {
        let mut iter = assets.into_iter().peekable();
        let grid = match iter.peek() {
            Some((_, r)) => r.grid,
            None => return Err(SeplanError::backend("load assets", "no assets supplied")),
        };
        let mut backend = Self::new(grid);
        for (id, raster) in iter {
            backend.insert_asset(id, raster)?;
        }
        Ok(backend)
    }

    pub fn with_asset(mut self, id: impl Into<String>, raster: Raster) -> Result<Self> {
        self.insert_asset(id, raster)?;
        Ok(self)
    }

    pub fn insert_asset(&mut self, id: impl Into<String>, raster: Raster) -> Result<()> {
        if !raster.grid.aligned_with(&self.grid) {
            return Err(SeplanError::GridMismatch {
                expected: self.grid,
                found: raster.grid,
            });
        }
        self.assets.insert(id.into(), raster);
        Ok(())
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn has_asset(&self, id: &str) -> bool {
        self.assets.contains_key(id)
    }
}

impl RasterBackend for LocalBackend {
    fn reduce(&self, expr: &Expr, reducer: &Reducer, region: &Region, cancel: &CancelToken) -> Result<Reduction> {
        let mut ev = Evaluator::new(self, cancel);
        ev.reduce(expr, reducer, region)
    }

    fn materialize(&self, expr: &Expr, region: &Region, cancel: &CancelToken) -> Result<Raster> {
        let mut ev = Evaluator::new(self, cancel);
        let values = ev.eval(expr)?;
        let inside = region_mask(&self.grid, region);
        let data = values
            .iter()
            .zip(inside.iter())
            .map(|(&v, &keep)| if keep { v } else { f32::NAN })
            .collect();
        Raster::from_data(self.grid, data)
    }
}

// ── Evaluation ───────────────────────────────────────────────────────────────

struct Evaluator<'a> {
    backend: &'a LocalBackend,
    cancel: &'a CancelToken,
    rasters: HashMap<usize, Arc<Vec<f32>>>,
    scalars: HashMap<usize, Option<f64>>,
}

impl<'a> Evaluator<'a> {
    fn new(backend: &'a LocalBackend, cancel: &'a CancelToken) -> Self {
        Self {
            backend,
            cancel,
            rasters: HashMap::new(),
            scalars: HashMap::new(),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Arc<Vec<f32>>> {
        if let Some(hit) = self.rasters.get(&expr.node_id()) {
            return Ok(Arc::clone(hit));
        }
        self.cancel.check()?;

        let n = self.backend.grid.len();
        let out: Vec<f32> = match expr.node() {
            Node::Asset(id) => match self.backend.assets.get(id) {
                Some(r) => r.data.clone(),
                None => return Err(SeplanError::UnknownAsset(id.clone())),
            },
            Node::Constant(v) => vec![*v as f32; n],
            Node::Unary { op, arg } => {
                let a = self.eval(arg)?;
                a.iter().map(|&x| unary(*op, x)).collect()
            }
            Node::Binary { op, lhs, rhs } => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                a.iter().zip(b.iter()).map(|(&x, &y)| binary(*op, x, y)).collect()
            }
            Node::UnitScale { arg, low, high, epsilon } => {
                let lo = self.require(low)?;
                let hi = self.require(high)?;
                let a = self.eval(arg)?;
                a.iter()
                    .map(|&x| {
                        if x.is_nan() {
                            f32::NAN
                        } else {
                            safe_divide(x as f64 - lo, hi - lo, *epsilon) as f32
                        }
                    })
                    .collect()
            }
            Node::Clamp { arg, min, max } => {
                let a = self.eval(arg)?;
                a.iter()
                    .map(|&x| if x.is_nan() { x } else { (x as f64).clamp(*min, *max) as f32 })
                    .collect()
            }
            Node::Classify { arg, breaks } => {
                let mut bs = Vec::with_capacity(breaks.len());
                for b in breaks {
                    bs.push(self.require(b)?);
                }
                let a = self.eval(arg)?;
                a.iter()
                    .map(|&x| {
                        if x.is_nan() {
                            f32::NAN
                        } else {
                            (1 + bs.iter().filter(|&&b| x as f64 > b).count()) as f32
                        }
                    })
                    .collect()
            }
            Node::InSet { arg, codes } => {
                let a = self.eval(arg)?;
                a.iter()
                    .map(|&x| {
                        if x.is_nan() {
                            f32::NAN
                        } else if codes.iter().any(|&c| (x as f64 - c).abs() < 1e-6) {
                            1.0
                        } else {
                            0.0
                        }
                    })
                    .collect()
            }
            Node::UpdateMask { arg, mask } => {
                let a = self.eval(arg)?;
                let m = self.eval(mask)?;
                a.iter()
                    .zip(m.iter())
                    .map(|(&x, &k)| if k.is_nan() || k == 0.0 { f32::NAN } else { x })
                    .collect()
            }
            Node::Unmask { arg, fill } => {
                let a = self.eval(arg)?;
                a.iter().map(|&x| if x.is_nan() { *fill as f32 } else { x }).collect()
            }
            Node::Clip { arg, region } => {
                let a = self.eval(arg)?;
                let inside = region_mask(&self.backend.grid, region);
                a.iter()
                    .zip(inside.iter())
                    .map(|(&x, &keep)| if keep { x } else { f32::NAN })
                    .collect()
            }
            Node::Mosaic(parts) => {
                let mut acc = vec![f32::NAN; n];
                for part in parts {
                    let p = self.eval(part)?;
                    for (dst, &src) in acc.iter_mut().zip(p.iter()) {
                        if dst.is_nan() {
                            *dst = src;
                        }
                    }
                }
                acc
            }
            Node::Select { cond, then, otherwise } => {
                let c = self.eval(cond)?;
                let picks: Vec<bool> = c.iter().map(|&k| !k.is_nan() && k != 0.0).collect();
                let t = if picks.iter().any(|&p| p) { Some(self.eval(then)?) } else { None };
                let o = if picks.iter().any(|&p| !p) { Some(self.eval(otherwise)?) } else { None };
                picks
                    .iter()
                    .enumerate()
                    .map(|(i, &p)| {
                        let branch = if p { &t } else { &o };
                        branch.as_ref().map_or(f32::NAN, |v| v[i])
                    })
                    .collect()
            }
        };

        let out = Arc::new(out);
        self.rasters.insert(expr.node_id(), Arc::clone(&out));
        Ok(out)
    }

    /// Resolve a scalar; a null statistic becomes `NoDataInAoi`.
    fn require(&mut self, scalar: &Scalar) -> Result<f64> {
        match scalar {
            Scalar::Value(v) => Ok(*v),
            Scalar::Statistic(s) => {
                let id = Scalar::statistic_id(s);
                let value = match self.scalars.get(&id) {
                    Some(v) => *v,
                    None => {
                        let (reducer, key) = s.stat.reducer();
                        let v = self.reduce(&s.source, &reducer, &s.region)?.get(&key);
                        debug!(statistic = %s.stat, label = %s.label, region = %s.region.name, value = ?v, "resolved statistic");
                        self.scalars.insert(id, v);
                        v
                    }
                };
                value.ok_or_else(|| SeplanError::NoDataInAoi {
                    statistic: format!("{} of {}", s.stat, s.label),
                    region: s.region.name.clone(),
                })
            }
        }
    }

    fn reduce(&mut self, expr: &Expr, reducer: &Reducer, region: &Region) -> Result<Reduction> {
        self.cancel.check()?;
        let grid = self.backend.grid;
        let inside = region_mask(&grid, region);

        if let Reducer::Area = reducer {
            return Ok(single("area", Some(region_area(&grid, &inside))));
        }

        let values = self.eval(expr)?;

        // (value, pixel area) for every valid pixel inside the region.
        let mut samples: Vec<(f64, f64)> = Vec::new();
        for r in 0..grid.height {
            let area = grid.pixel_area_m2(r);
            for c in 0..grid.width {
                let i = r * grid.width + c;
                let v = values[i];
                if inside[i] && !v.is_nan() {
                    samples.push((v as f64, area));
                }
            }
        }

        let reduction = match reducer {
            Reducer::MinMax => {
                let min = samples.iter().map(|s| s.0).reduce(f64::min);
                let max = samples.iter().map(|s| s.0).reduce(f64::max);
                let mut out = single("min", min);
                out.values.insert("max".to_string(), max);
                out
            }
            Reducer::Percentile(ps) => {
                let mut sorted: Vec<f64> = samples.iter().map(|s| s.0).collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mut out = Reduction::default();
                for &p in ps {
                    out.values.insert(percentile_key(p), nearest_rank(&sorted, p));
                }
                out
            }
            Reducer::Mean => {
                let mean = if samples.is_empty() {
                    None
                } else {
                    Some(samples.iter().map(|s| s.0).sum::<f64>() / samples.len() as f64)
                };
                single("mean", mean)
            }
            Reducer::Sum => single("sum", Some(samples.iter().map(|s| s.0).sum())),
            Reducer::AreaWeightedMean => {
                let w: f64 = samples.iter().map(|s| s.1).sum();
                let mean = if samples.is_empty() || w <= 0.0 {
                    None
                } else {
                    Some(samples.iter().map(|s| s.0 * s.1).sum::<f64>() / w)
                };
                single("mean", mean)
            }
            Reducer::AreaWeightedSum => single("sum", Some(samples.iter().map(|s| s.0 * s.1).sum())),
            Reducer::GroupedArea => {
                let mut groups: BTreeMap<i64, f64> = BTreeMap::new();
                for (v, a) in &samples {
                    *groups.entry(v.round() as i64).or_insert(0.0) += a;
                }
                Reduction {
                    groups: groups.into_iter().collect(),
                    ..Reduction::default()
                }
            }
            Reducer::FrequencyHistogram => {
                let mut sorted: Vec<f64> = samples.iter().map(|s| s.0).collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mut histogram: Vec<(f64, u64)> = Vec::new();
                for v in sorted {
                    match histogram.last_mut() {
                        Some((last, count)) if *last == v => *count += 1,
                        _ => histogram.push((v, 1)),
                    }
                }
                Reduction {
                    histogram,
                    ..Reduction::default()
                }
            }
            Reducer::Area => single("area", Some(region_area(&grid, &inside))),
        };
        Ok(reduction)
    }
}

fn single(key: &str, value: Option<f64>) -> Reduction {
    let mut out = Reduction::default();
    out.values.insert(key.to_string(), value);
    out
}

/// Nearest-rank percentile on ascending values: index `round(p/100 · (n−1))`.
fn nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}

/// Area (m²) of every cell inside the region, valid or not.
fn region_area(grid: &Grid, inside: &[bool]) -> f64 {
    (0..grid.height)
        .map(|r| {
            let count = (0..grid.width).filter(|&c| inside[r * grid.width + c]).count();
            count as f64 * grid.pixel_area_m2(r)
        })
        .sum()
}

/// `true` for every cell whose centre lies in `region`.
fn region_mask(grid: &Grid, region: &Region) -> Vec<bool> {
    let mut inside = vec![false; grid.len()];
    let Some(bounds) = region.bounds() else {
        return inside;
    };
    let shape = region.geometry();
    for r in 0..grid.height {
        for c in 0..grid.width {
            let (lon, lat) = grid.cell_center(r, c);
            let centre = Point::new(lon, lat);
            inside[r * grid.width + c] = bounds.intersects(&centre) && shape.intersects(&centre);
        }
    }
    inside
}

fn unary(op: UnaryOp, x: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    match op {
        UnaryOp::Round => x.round(),
        UnaryOp::Not => {
            if x == 0.0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn binary(op: BinaryOp, x: f32, y: f32) -> f32 {
    if x.is_nan() || y.is_nan() {
        return f32::NAN;
    }
    let (a, b) = (x as f64, y as f64);
    let flag = |c: bool| if c { 1.0 } else { 0.0 };
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::SafeDiv { epsilon } => safe_divide(a, b, epsilon),
        BinaryOp::Eq => flag((a - b).abs() < 1e-6),
        BinaryOp::Gte => flag(a >= b),
        BinaryOp::Lte => flag(a <= b),
        BinaryOp::And => flag(a != 0.0 && b != 0.0),
    };
    v as f32
}
