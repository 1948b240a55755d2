//! Regions and areas of interest.
//!
//! A [`Region`] is a named set of lon/lat polygons (a feature collection in
//! GIS terms); each polygon is one spatial unit for per-unit statistics.
//! An [`AreaOfInterest`] is a primary region plus optional sub-regions that
//! only break statistics down further.

use geo::{BoundingRect, Coord, Intersects, LineString, MultiPolygon, Point, Rect};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeplanError};

const DEFAULT_COLOR: &str = "#3f51b5";

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

/// Stored shape of a polygon: rings in (lon, lat) degrees, implicitly closed.
#[derive(Serialize, Deserialize)]
struct PolygonRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    ring: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    holes: Vec<Vec<[f64; 2]>>,
}

fn line_string(ring: Vec<[f64; 2]>) -> LineString<f64> {
    ring.into_iter().map(|[x, y]| Coord { x, y }).collect()
}

fn ring_points(ring: &LineString<f64>) -> Vec<[f64; 2]> {
    let mut points: Vec<[f64; 2]> = ring.coords().map(|c| [c.x, c.y]).collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}

/// One spatial unit: a lon/lat polygon, optionally with holes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PolygonRecord", into = "PolygonRecord")]
pub struct Polygon {
    pub name: Option<String>,
    shape: geo::Polygon<f64>,
}

impl From<PolygonRecord> for Polygon {
    fn from(r: PolygonRecord) -> Self {
        let holes = r.holes.into_iter().map(line_string).collect();
        Self {
            name: r.name,
            shape: geo::Polygon::new(line_string(r.ring), holes),
        }
    }
}

impl From<Polygon> for PolygonRecord {
    fn from(p: Polygon) -> Self {
        Self {
            ring: ring_points(p.shape.exterior()),
            holes: p.shape.interiors().iter().map(ring_points).collect(),
            name: p.name,
        }
    }
}

impl Polygon {
    pub fn new(ring: Vec<[f64; 2]>) -> Self {
        Self::from_geo(geo::Polygon::new(line_string(ring), Vec::new()))
    }

    pub fn from_geo(shape: geo::Polygon<f64>) -> Self {
        Self { name: None, shape }
    }

    pub fn rect(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self::from_geo(Rect::new(Coord { x: min_lon, y: min_lat }, Coord { x: max_lon, y: max_lat }).to_polygon())
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_hole(mut self, ring: Vec<[f64; 2]>) -> Self {
        self.shape.interiors_push(line_string(ring));
        self
    }

    pub fn shape(&self) -> &geo::Polygon<f64> {
        &self.shape
    }

    /// Points on the boundary count as inside.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.shape.intersects(&Point::new(lon, lat))
    }
}

/// A named region made of one or more polygons, with a display colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
    pub polygons: Vec<Polygon>,
}

impl Region {
    pub fn new(name: impl Into<String>, polygons: Vec<Polygon>) -> Self {
        Self {
            name: name.into(),
            color: default_color(),
            polygons,
        }
    }

    /// Axis-aligned box region.
    pub fn rect(name: impl Into<String>, min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self::new(name, vec![Polygon::rect(min_lon, min_lat, max_lon, max_lat)])
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.polygons.iter().any(|p| p.contains(lon, lat))
    }

    /// All polygons as one multipolygon.
    pub fn geometry(&self) -> MultiPolygon<f64> {
        MultiPolygon::new(self.polygons.iter().map(|p| p.shape.clone()).collect())
    }

    /// Bounding box in (lon, lat), `None` for a region without polygons.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.geometry().bounding_rect()
    }

    /// Split into one region per polygon (the spatial units of the region).
    /// Unnamed polygons are called `{region}-{index}`; a single unnamed
    /// polygon keeps the region name.
    pub fn units(&self) -> Vec<Region> {
        let single = self.polygons.len() == 1;
        self.polygons
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let name = match &p.name {
                    Some(n) => n.clone(),
                    None if single => self.name.clone(),
                    None => format!("{}-{}", self.name, i),
                };
                Region {
                    name,
                    color: self.color.clone(),
                    polygons: vec![p.clone()],
                }
            })
            .collect()
    }
}

/// Primary analysis region plus named sub-regions used for statistics only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaOfInterest {
    #[serde(default)]
    pub primary: Option<Region>,
    #[serde(default)]
    pub sub_regions: Vec<Region>,
}

impl AreaOfInterest {
    pub fn new(primary: Region) -> Self {
        Self {
            primary: Some(primary),
            sub_regions: Vec::new(),
        }
    }

    pub fn set_primary(&mut self, region: Region) {
        self.primary = Some(region);
    }

    /// Add a sub-region, replacing any existing one with the same name.
    pub fn add_sub_region(&mut self, region: Region) {
        match self.sub_regions.iter_mut().find(|r| r.name == region.name) {
            Some(existing) => *existing = region,
            None => self.sub_regions.push(region),
        }
    }

    pub fn remove_sub_region(&mut self, name: &str) -> Option<Region> {
        let idx = self.sub_regions.iter().position(|r| r.name == name)?;
        Some(self.sub_regions.remove(idx))
    }

    pub fn primary(&self) -> Result<&Region> {
        self.primary.as_ref().ok_or(SeplanError::MissingAoi)
    }

    /// Primary region first, then sub-regions in insertion order.
    pub fn areas(&self) -> Result<Vec<&Region>> {
        let mut out = vec![self.primary()?];
        out.extend(self.sub_regions.iter());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_contains_interior_not_exterior() {
        let r = Region::rect("box", 0.0, 0.0, 2.0, 2.0);
        assert!(r.contains(1.0, 1.0));
        assert!(!r.contains(3.0, 1.0));
        assert!(!r.contains(1.0, -0.5));
    }

    #[test]
    fn concave_polygon_excludes_notch() {
        // U shape opening north: notch between lon 1..2 above lat 1.
        let u = Polygon::new(vec![
            [0.0, 0.0],
            [3.0, 0.0],
            [3.0, 3.0],
            [2.0, 3.0],
            [2.0, 1.0],
            [1.0, 1.0],
            [1.0, 3.0],
            [0.0, 3.0],
        ]);
        assert!(u.contains(0.5, 2.5));
        assert!(u.contains(2.5, 2.5));
        assert!(!u.contains(1.5, 2.5), "notch must be outside");
        assert!(u.contains(1.5, 0.5));
    }

    #[test]
    fn holes_are_outside() {
        let ring = Polygon::rect(0.0, 0.0, 4.0, 4.0)
            .with_hole(vec![[1.0, 1.0], [3.0, 1.0], [3.0, 3.0], [1.0, 3.0]]);
        assert!(ring.contains(0.5, 0.5));
        assert!(!ring.contains(2.0, 2.0), "hole must be outside");
        assert_eq!(ring.shape().interiors().len(), 1);
    }

    #[test]
    fn stored_rings_load_and_save_without_closing_point() {
        let text = r#"{ "name": "lake", "ring": [[0,0],[2,0],[2,2],[0,2]], "holes": [[[0.5,0.5],[1,0.5],[1,1]]] }"#;
        let p: Polygon = serde_json::from_str(text).unwrap();
        assert_eq!(p.name.as_deref(), Some("lake"));
        assert!(p.contains(1.5, 1.5));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["ring"].as_array().unwrap().len(), 4);
        assert_eq!(v["holes"][0].as_array().unwrap().len(), 3);
        let back: Polygon = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn region_bounds_cover_every_polygon() {
        let region = Region::new(
            "two",
            vec![Polygon::rect(0.0, 0.0, 1.0, 1.0), Polygon::rect(5.0, -3.0, 6.0, 2.0)],
        );
        let b = region.bounds().unwrap();
        assert_eq!((b.min().x, b.min().y, b.max().x, b.max().y), (0.0, -3.0, 6.0, 2.0));
        assert!(Region::new("empty", Vec::new()).bounds().is_none());
    }

    #[test]
    fn units_name_unnamed_polygons_by_index() {
        let region = Region::new(
            "country",
            vec![
                Polygon::rect(0.0, 0.0, 1.0, 1.0),
                Polygon::rect(2.0, 0.0, 3.0, 1.0).named("east"),
            ],
        );
        let names: Vec<String> = region.units().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["country-0".to_string(), "east".to_string()]);

        let single = Region::rect("island", 0.0, 0.0, 1.0, 1.0);
        assert_eq!(single.units()[0].name, "island");
    }

    #[test]
    fn missing_primary_is_reported() {
        let aoi = AreaOfInterest::default();
        assert!(matches!(aoi.primary(), Err(SeplanError::MissingAoi)));
        assert!(aoi.areas().is_err());
    }

    #[test]
    fn sub_regions_replace_by_name() {
        let mut aoi = AreaOfInterest::new(Region::rect("main", 0.0, 0.0, 4.0, 4.0));
        aoi.add_sub_region(Region::rect("a", 0.0, 0.0, 1.0, 1.0));
        aoi.add_sub_region(Region::rect("a", 0.0, 0.0, 2.0, 2.0).with_color("#ff0000"));
        assert_eq!(aoi.sub_regions.len(), 1);
        assert_eq!(aoi.sub_regions[0].color, "#ff0000");
        let names: Vec<&str> = aoi.areas().unwrap().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["main", "a"]);
        assert!(aoi.remove_sub_region("a").is_some());
        assert!(aoi.sub_regions.is_empty());
    }
}
