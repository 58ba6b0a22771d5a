//! AOI geometry resolution and footprint intersection math.
//!
//! The engine only needs a small slice of computational geometry: turning the
//! selected input features into a single query geometry, and computing the
//! area of overlap between that geometry and a tile footprint. Tile
//! footprints are axis-aligned squares, so polygon clipping can assume a
//! convex clip region (Sutherland–Hodgman).
//!
//! Coordinates are planar (the tile index serves footprints in a projected
//! CRS such as Lambert-93), so areas are plain Euclidean areas.

mod clip;

pub use clip::clip_area;

use thiserror::Error;

/// Area below which a polygon is considered degenerate, in square CRS units.
const MIN_AREA: f64 = 1e-6;

/// Errors produced while resolving input geometry.
#[derive(Debug, Clone, Error)]
pub enum GeometryError {
    /// The input features union to an empty or degenerate geometry.
    #[error("invalid geometry: {0}")]
    Invalid(String),
}

/// A 2D point in the index CRS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// An inverted envelope that expands to the first point added to it.
    pub fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    /// Returns true if no point has been added yet.
    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    /// Grows the envelope to include `p`.
    pub fn expand_point(&mut self, p: Point) {
        self.min_x = self.min_x.min(p.x);
        self.min_y = self.min_y.min(p.y);
        self.max_x = self.max_x.max(p.x);
        self.max_y = self.max_y.max(p.y);
    }

    /// Grows the envelope to include `other`.
    pub fn expand(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Returns true if the two envelopes overlap (touching counts).
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn width(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.max_y - self.min_y).max(0.0)
    }
}

/// A simple polygon defined by its exterior ring.
///
/// The ring is stored open (no repeated closing vertex) and is implicitly
/// closed. Holes are not modeled: AOI features and tile footprints in this
/// domain are simple outlines.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    exterior: Vec<Point>,
}

impl Polygon {
    /// Creates a polygon from an exterior ring.
    ///
    /// A trailing vertex equal to the first is dropped. Fails if fewer than
    /// three distinct vertices remain or the ring has (near-)zero area.
    pub fn new(mut exterior: Vec<Point>) -> Result<Self, GeometryError> {
        if exterior.len() > 1 && exterior.first() == exterior.last() {
            exterior.pop();
        }
        if exterior.len() < 3 {
            return Err(GeometryError::Invalid(format!(
                "ring has {} vertices, need at least 3",
                exterior.len()
            )));
        }
        let poly = Self { exterior };
        if poly.area() < MIN_AREA {
            return Err(GeometryError::Invalid("ring has zero area".to_string()));
        }
        Ok(poly)
    }

    /// Creates an axis-aligned rectangular polygon.
    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self, GeometryError> {
        Self::new(vec![
            Point::new(min_x, min_y),
            Point::new(max_x, min_y),
            Point::new(max_x, max_y),
            Point::new(min_x, max_y),
        ])
    }

    /// The exterior ring, open (no repeated closing vertex).
    pub fn exterior(&self) -> &[Point] {
        &self.exterior
    }

    /// Unsigned area (shoelace formula).
    pub fn area(&self) -> f64 {
        shoelace(&self.exterior).abs()
    }

    /// Bounding envelope of the exterior ring.
    pub fn envelope(&self) -> Envelope {
        let mut env = Envelope::empty();
        for p in &self.exterior {
            env.expand_point(*p);
        }
        env
    }

    /// Area of overlap with `clip`, which must be convex.
    pub fn intersection_area(&self, clip: &Polygon) -> f64 {
        clip_area(self, clip)
    }
}

/// Signed area of a ring (positive for counter-clockwise winding).
pub(crate) fn shoelace(ring: &[Point]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

/// The resolved query geometry: the union of all selected AOI features.
///
/// Parts are kept as-is rather than dissolved into a single outline; they
/// come from distinct selected features and are assumed non-overlapping, so
/// the intersection area with a footprint is the sum of per-part clip areas.
#[derive(Debug, Clone)]
pub struct QueryGeometry {
    parts: Vec<Polygon>,
    envelope: Envelope,
}

impl QueryGeometry {
    /// Resolves a set of input features into one query geometry.
    ///
    /// Handles single-feature and multi-feature (selected subset) input
    /// uniformly. Fails with [`GeometryError::Invalid`] when no feature is
    /// given or the combined area is degenerate.
    pub fn resolve(features: &[Polygon]) -> Result<Self, GeometryError> {
        if features.is_empty() {
            return Err(GeometryError::Invalid(
                "no features in input selection".to_string(),
            ));
        }
        let mut envelope = Envelope::empty();
        let mut total_area = 0.0;
        for feature in features {
            envelope.expand(&feature.envelope());
            total_area += feature.area();
        }
        if envelope.is_empty() || total_area < MIN_AREA {
            return Err(GeometryError::Invalid(
                "feature union has zero area".to_string(),
            ));
        }
        Ok(Self {
            parts: features.to_vec(),
            envelope,
        })
    }

    pub fn parts(&self) -> &[Polygon] {
        &self.parts
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Area of overlap between this geometry and a convex tile footprint.
    pub fn intersection_area(&self, footprint: &Polygon) -> f64 {
        let footprint_env = footprint.envelope();
        self.parts
            .iter()
            .filter(|part| part.envelope().intersects(&footprint_env))
            .map(|part| clip_area(part, footprint))
            .sum()
    }

    /// True intersection test against a convex tile footprint.
    pub fn intersects(&self, footprint: &Polygon) -> bool {
        self.intersection_area(footprint) > MIN_AREA
    }
}
