use serde::{Deserialize, Serialize};

use crate::error::{Result, SeplanError};

/// Metres per degree of latitude (and of longitude at the equator).
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Geographic layout of a raster: dimensions plus lon/lat bounds.
/// Row 0 is the northern edge; cell values refer to cell centres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl Grid {
    pub fn new(width: usize, height: usize, min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> Self {
        Self {
            width,
            height,
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell size in degrees as (dx, dy).
    pub fn cell_size_deg(&self) -> (f64, f64) {
        let dx = if self.width > 0 {
            (self.max_lon - self.min_lon).abs() / self.width as f64
        } else {
            0.0
        };
        let dy = if self.height > 0 {
            (self.max_lat - self.min_lat).abs() / self.height as f64
        } else {
            0.0
        };
        (dx, dy)
    }

    /// Same dimensions and the same bounds to within a thousandth of a cell.
    pub fn aligned_with(&self, other: &Grid) -> bool {
        if self.width != other.width || self.height != other.height {
            return false;
        }
        let (dx, dy) = self.cell_size_deg();
        let (tol_x, tol_y) = (dx * 1e-3, dy * 1e-3);
        (self.min_lon - other.min_lon).abs() <= tol_x
            && (self.max_lon - other.max_lon).abs() <= tol_x
            && (self.min_lat - other.min_lat).abs() <= tol_y
            && (self.max_lat - other.max_lat).abs() <= tol_y
    }

    /// (lon, lat) of the centre of cell (row, col).
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let (dx, dy) = self.cell_size_deg();
        let lon = self.min_lon + (col as f64 + 0.5) * dx;
        let lat = self.max_lat - (row as f64 + 0.5) * dy;
        (lon, lat)
    }

    /// Ground area of one pixel in `row`, in square metres.
    ///
    /// Pixel size shrinks with latitude, so every area statistic weights
    /// pixels by this value instead of counting them:
    ///   area = (dy · 111 320) × (dx · 111 320 · cos(lat))
    pub fn pixel_area_m2(&self, row: usize) -> f64 {
        let (dx, dy) = self.cell_size_deg();
        let (_, lat) = self.cell_center(row, 0);
        let h = dy * METRES_PER_DEGREE;
        let w = dx * METRES_PER_DEGREE * lat.to_radians().cos();
        (h * w).max(0.0)
    }
}

/// A single-band raster storing f32 values, row-major. NaN marks no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    #[serde(flatten)]
    pub grid: Grid,
    /// Row-major values; `null` in JSON is read back as NaN.
    #[serde(deserialize_with = "null_as_nan_vec")]
    pub data: Vec<f32>,
}

fn null_as_nan_vec<'de, D: serde::Deserializer<'de>>(
    d: D,
) -> std::result::Result<Vec<f32>, D::Error> {
    let v: Vec<Option<f32>> = Vec::deserialize(d)?;
    Ok(v.into_iter().map(|x| x.unwrap_or(f32::NAN)).collect())
}

impl Raster {
    /// Create a raster on `grid` filled with `fill`.
    pub fn filled(grid: Grid, fill: f32) -> Self {
        Self {
            data: vec![fill; grid.len()],
            grid,
        }
    }

    /// Wrap existing row-major values; the length must match the grid.
    pub fn from_data(grid: Grid, data: Vec<f32>) -> Result<Self> {
        if data.len() != grid.len() {
            return Err(SeplanError::DataLength {
                expected: grid.len(),
                found: data.len(),
            });
        }
        Ok(Self { grid, data })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.grid.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.grid.height
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.grid.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f32) {
        self.data[row * self.grid.width + col] = val;
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// Minimum over valid cells, `None` when every cell is no data.
    pub fn min_value(&self) -> Option<f32> {
        self.data.iter().cloned().filter(|v| !v.is_nan()).reduce(f32::min)
    }

    /// Maximum over valid cells, `None` when every cell is no data.
    pub fn max_value(&self) -> Option<f32> {
        self.data.iter().cloned().filter(|v| !v.is_nan()).reduce(f32::max)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raster: Raster = serde_json::from_str(text)?;
        if raster.data.len() != raster.grid.len() {
            return Err(SeplanError::DataLength {
                expected: raster.grid.len(),
                found: raster.data.len(),
            });
        }
        Ok(raster)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
