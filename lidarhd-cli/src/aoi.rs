//! GeoJSON AOI loading.
//!
//! Accepts a FeatureCollection, a single Feature, or a bare geometry, and
//! extracts the exterior ring of every `Polygon`/`MultiPolygon` part.
//! Coordinates are taken as-is (the IGN index serves Lambert-93 / EPSG:2154),
//! so the file must already be in the index CRS.

use std::path::Path;

use lidarhd::{Point, Polygon};
use serde_json::Value;
use tracing::warn;

use crate::error::CliError;

/// Reads a GeoJSON file and returns the polygonal features it contains.
///
/// Degenerate rings (fewer than three distinct vertices, near-zero area) are
/// skipped with a warning; the load fails only when nothing usable remains.
pub fn load(path: &Path) -> Result<Vec<Polygon>, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::Aoi(format!("cannot read {}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| CliError::Aoi(format!("{} is not valid JSON: {}", path.display(), e)))?;

    let mut polygons = Vec::new();
    for geometry in geometries(&value) {
        collect_polygons(geometry, &mut polygons);
    }
    if polygons.is_empty() {
        return Err(CliError::Aoi(format!(
            "{} contains no usable Polygon or MultiPolygon feature",
            path.display()
        )));
    }
    Ok(polygons)
}

/// Yields the geometry objects contained in a GeoJSON value.
fn geometries(value: &Value) -> Vec<&Value> {
    match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => value
            .get("features")
            .and_then(Value::as_array)
            .map(|features| {
                features
                    .iter()
                    .filter_map(|f| f.get("geometry"))
                    .collect()
            })
            .unwrap_or_default(),
        Some("Feature") => value.get("geometry").into_iter().collect(),
        Some(_) => vec![value],
        None => Vec::new(),
    }
}

fn collect_polygons(geometry: &Value, out: &mut Vec<Polygon>) {
    match geometry.get("type").and_then(Value::as_str) {
        Some("Polygon") => {
            if let Some(rings) = geometry.get("coordinates").and_then(Value::as_array) {
                push_exterior(rings, out);
            }
        }
        Some("MultiPolygon") => {
            if let Some(parts) = geometry.get("coordinates").and_then(Value::as_array) {
                for part in parts {
                    if let Some(rings) = part.as_array() {
                        push_exterior(rings, out);
                    }
                }
            }
        }
        other => {
            warn!(geometry_type = ?other, "skipping non-polygonal geometry");
        }
    }
}

/// Converts the first (exterior) ring of a GeoJSON polygon. Interior rings
/// (holes) are ignored; the index query over-selects at worst.
fn push_exterior(rings: &[Value], out: &mut Vec<Polygon>) {
    let Some(exterior) = rings.first().and_then(Value::as_array) else {
        return;
    };
    let vertices: Vec<Point> = exterior
        .iter()
        .filter_map(|position| {
            let coords = position.as_array()?;
            let x = coords.first()?.as_f64()?;
            let y = coords.get(1)?.as_f64()?;
            Some(Point::new(x, y))
        })
        .collect();
    match Polygon::new(vertices) {
        Ok(polygon) => out.push(polygon),
        Err(e) => warn!("skipping degenerate ring: {}", e),
    }
}
