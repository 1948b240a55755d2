//! Lazy raster expressions.
//!
//! Building an [`Expr`] never touches pixels. Statistics that feed the
//! arithmetic (min, max, percentiles over a region) are [`Scalar`] nodes and
//! are resolved by the backend when the expression is materialised, so a
//! resolved number can only enter a graph through an explicit
//! [`Scalar::Value`].
//!
//! Nodes are reference counted and immutable; cloning an `Expr` is cheap and
//! two expressions built from identical inputs compare equal.

use std::fmt;
use std::sync::Arc;

use crate::backend::{CancelToken, RasterBackend, Reducer};
use crate::error::{Result, SeplanError};
use crate::geometry::Region;
use crate::raster::Raster;

/// Added to every denominator that may reach zero.
pub const DEFAULT_EPSILON: f64 = 1e-13;

/// `numerator / (denominator + epsilon)`.
///
/// All denominators in the engine are ranges or normalised costs and are
/// therefore non-negative; `epsilon` keeps a zero range finite.
#[inline]
pub fn safe_divide(numerator: f64, denominator: f64, epsilon: f64) -> f64 {
    numerator / (denominator + epsilon)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Round,
    /// 1 where the value is 0, otherwise 0.
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    SafeDiv { epsilon: f64 },
    Eq,
    Gte,
    Lte,
    And,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Asset(String),
    Constant(f64),
    Unary {
        op: UnaryOp,
        arg: Expr,
    },
    Binary {
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
    },
    /// `safe_divide(x - low, high - low, epsilon)`
    UnitScale {
        arg: Expr,
        low: Scalar,
        high: Scalar,
        epsilon: f64,
    },
    Clamp {
        arg: Expr,
        min: f64,
        max: f64,
    },
    /// Ordinal class `1 + #{b in breaks : x > b}`.
    Classify {
        arg: Expr,
        breaks: Vec<Scalar>,
    },
    /// 1 where the value is one of `codes`, otherwise 0.
    InSet {
        arg: Expr,
        codes: Vec<f64>,
    },
    /// Keep `arg` where `mask` is valid and non-zero, no data elsewhere.
    UpdateMask {
        arg: Expr,
        mask: Expr,
    },
    /// Replace no data with `fill`.
    Unmask {
        arg: Expr,
        fill: f64,
    },
    /// No data outside `region`.
    Clip {
        arg: Expr,
        region: Region,
    },
    /// First valid value among the parts, per pixel.
    Mosaic(Vec<Expr>),
    /// `then` where `cond` is valid and non-zero, `otherwise` elsewhere.
    /// A branch no pixel picks is never evaluated.
    Select {
        cond: Expr,
        then: Expr,
        otherwise: Expr,
    },
}

/// Handle to an immutable expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr(Arc<Node>);

impl Expr {
    fn from_node(node: Node) -> Self {
        Expr(Arc::new(node))
    }

    pub fn node(&self) -> &Node {
        &self.0
    }

    /// Identity of the underlying node, stable while the expression lives.
    pub(crate) fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn asset(asset_ref: impl Into<String>) -> Self {
        Self::from_node(Node::Asset(asset_ref.into()))
    }

    pub fn constant(value: f64) -> Self {
        Self::from_node(Node::Constant(value))
    }

    fn binary(&self, op: BinaryOp, rhs: &Expr) -> Self {
        Self::from_node(Node::Binary {
            op,
            lhs: self.clone(),
            rhs: rhs.clone(),
        })
    }

    pub fn add(&self, rhs: &Expr) -> Self {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Expr) -> Self {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Expr) -> Self {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Expr) -> Self {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn mul_scalar(&self, k: f64) -> Self {
        self.mul(&Expr::constant(k))
    }

    pub fn div_scalar(&self, k: f64) -> Self {
        self.div(&Expr::constant(k))
    }

    pub fn add_scalar(&self, k: f64) -> Self {
        self.add(&Expr::constant(k))
    }

    /// Pixelwise [`safe_divide`].
    pub fn safe_divide(&self, denominator: &Expr, epsilon: f64) -> Self {
        self.binary(BinaryOp::SafeDiv { epsilon }, denominator)
    }

    pub fn eq_value(&self, v: f64) -> Self {
        self.binary(BinaryOp::Eq, &Expr::constant(v))
    }

    pub fn gte(&self, v: f64) -> Self {
        self.binary(BinaryOp::Gte, &Expr::constant(v))
    }

    pub fn lte(&self, v: f64) -> Self {
        self.binary(BinaryOp::Lte, &Expr::constant(v))
    }

    pub fn and(&self, rhs: &Expr) -> Self {
        self.binary(BinaryOp::And, rhs)
    }

    pub fn not(&self) -> Self {
        Self::from_node(Node::Unary {
            op: UnaryOp::Not,
            arg: self.clone(),
        })
    }

    pub fn round(&self) -> Self {
        Self::from_node(Node::Unary {
            op: UnaryOp::Round,
            arg: self.clone(),
        })
    }

    pub fn in_set(&self, codes: &[f64]) -> Self {
        Self::from_node(Node::InSet {
            arg: self.clone(),
            codes: codes.to_vec(),
        })
    }

    pub fn unit_scale(&self, low: Scalar, high: Scalar, epsilon: f64) -> Self {
        Self::from_node(Node::UnitScale {
            arg: self.clone(),
            low,
            high,
            epsilon,
        })
    }

    pub fn clamp(&self, min: f64, max: f64) -> Self {
        Self::from_node(Node::Clamp {
            arg: self.clone(),
            min,
            max,
        })
    }

    pub fn classify(&self, breaks: Vec<Scalar>) -> Self {
        Self::from_node(Node::Classify {
            arg: self.clone(),
            breaks,
        })
    }

    pub fn update_mask(&self, mask: &Expr) -> Self {
        Self::from_node(Node::UpdateMask {
            arg: self.clone(),
            mask: mask.clone(),
        })
    }

    pub fn unmask(&self, fill: f64) -> Self {
        Self::from_node(Node::Unmask {
            arg: self.clone(),
            fill,
        })
    }

    pub fn clip(&self, region: &Region) -> Self {
        Self::from_node(Node::Clip {
            arg: self.clone(),
            region: region.clone(),
        })
    }

    pub fn mosaic(parts: Vec<Expr>) -> Self {
        Self::from_node(Node::Mosaic(parts))
    }

    pub fn select(cond: &Expr, then: &Expr, otherwise: &Expr) -> Self {
        Self::from_node(Node::Select {
            cond: cond.clone(),
            then: then.clone(),
            otherwise: otherwise.clone(),
        })
    }

    /// Sum of all expressions, `None` for an empty input.
    pub fn sum<'a>(exprs: impl IntoIterator<Item = &'a Expr>) -> Option<Self> {
        exprs.into_iter().fold(None, |acc: Option<Expr>, e| match acc {
            None => Some(e.clone()),
            Some(total) => Some(total.add(e)),
        })
    }

    /// Deferred statistic of this expression over `region`.
    pub fn statistic(&self, stat: Stat, region: &Region, label: impl Into<String>) -> Scalar {
        Scalar::Statistic(Arc::new(Statistic {
            source: self.clone(),
            stat,
            region: region.clone(),
            label: label.into(),
        }))
    }

    /// Evaluate through `backend` and return pixels inside `region`.
    pub fn materialize(&self, backend: &dyn RasterBackend, region: &Region, cancel: &CancelToken) -> Result<Raster> {
        backend.materialize(self, region, cancel)
    }
}

/// The statistic a [`Statistic`] node asks the backend for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Min,
    Max,
    Percentile(f64),
}

impl Stat {
    /// Reducer and output key used to fetch this statistic.
    pub fn reducer(&self) -> (Reducer, String) {
        match *self {
            Stat::Min => (Reducer::MinMax, "min".to_string()),
            Stat::Max => (Reducer::MinMax, "max".to_string()),
            Stat::Percentile(p) => (Reducer::Percentile(vec![p]), percentile_key(p)),
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::Min => write!(f, "min"),
            Stat::Max => write!(f, "max"),
            Stat::Percentile(p) => write!(f, "{}", percentile_key(*p)),
        }
    }
}

/// Output key of a percentile reduction, `p3`, `p97`, `p12.5`.
pub fn percentile_key(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("p{}", p as i64)
    } else {
        format!("p{p}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statistic {
    pub source: Expr,
    pub stat: Stat,
    pub region: Region,
    /// What is being summarised, used in error reports.
    pub label: String,
}

/// A number that is either already known or a deferred reduction.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Value(f64),
    Statistic(Arc<Statistic>),
}

impl Scalar {
    pub(crate) fn statistic_id(stat: &Arc<Statistic>) -> usize {
        Arc::as_ptr(stat) as usize
    }

    /// Explicitly resolve through `backend`. A null statistic is reported as
    /// [`SeplanError::NoDataInAoi`].
    pub fn resolve(&self, backend: &dyn RasterBackend, cancel: &CancelToken) -> Result<f64> {
        match self {
            Scalar::Value(v) => Ok(*v),
            Scalar::Statistic(s) => {
                let (reducer, key) = s.stat.reducer();
                let reduction = backend.reduce(&s.source, &reducer, &s.region, cancel)?;
                reduction.get(&key).ok_or_else(|| SeplanError::NoDataInAoi {
                    statistic: format!("{} of {}", s.stat, s.label),
                    region: s.region.name.clone(),
                })
            }
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Value(v)
    }
}
