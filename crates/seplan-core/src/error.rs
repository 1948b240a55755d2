//! Error taxonomy for the scoring engine.
//!
//! Every failure the engine can report is a distinct variant so that callers
//! can decide per kind whether to prompt the user, repair the input or abort.

use thiserror::Error;

use crate::raster::Grid;

#[derive(Debug, Error)]
pub enum SeplanError {
    /// A reduction over the AOI produced no statistic (no valid pixels).
    #[error("no valid pixels under region '{region}' while computing {statistic}")]
    NoDataInAoi { statistic: String, region: String },

    /// Stored constraint values do not fit the declared data type.
    #[error("constraint '{name}' ({data_type}) has invalid values {values:?}: {cause}")]
    InvalidConstraintValue {
        name: String,
        data_type: String,
        values: Vec<f64>,
        cause: String,
    },

    /// No benefit theme is left with a non-zero weight.
    #[error("benefit themes have zero aggregate weight: {themes:?}")]
    DegenerateWeight { themes: Vec<String> },

    /// The raster backend rejected or failed to evaluate an expression.
    #[error("raster backend failed during {operation}: {message}")]
    Backend { operation: String, message: String },

    /// The backend holds no raster under this asset reference.
    #[error("unknown asset '{0}'")]
    UnknownAsset(String),

    #[error("no primary area of interest has been set")]
    MissingAoi,

    #[error("layer '{0}' already exists in this set")]
    DuplicateLayer(String),

    #[error("layer '{0}' does not exist in this set")]
    UnknownLayer(String),

    #[error("layer '{id}' is a {found} layer, not a {expected} layer")]
    WrongLayerRole { id: String, expected: String, found: String },

    #[error("layer '{0}' has no asset reference and is not in the catalog")]
    MissingAssetRef(String),

    #[error("benefit '{id}' has weight {weight}, expected an integer in 0..=4")]
    InvalidWeight { id: String, weight: i64 },

    #[error("cost layers do not share one unit: {units:?}")]
    MixedCostUnits { units: Vec<String> },

    #[error("evaluation of '{scenario}' was cancelled")]
    Cancelled { scenario: String },

    #[error("raster grid {found:?} does not match backend grid {expected:?}")]
    GridMismatch { expected: Grid, found: Grid },

    #[error("raster holds {found} values, its grid needs {expected}")]
    DataLength { expected: usize, found: usize },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SeplanError>;

impl SeplanError {
    pub(crate) fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
