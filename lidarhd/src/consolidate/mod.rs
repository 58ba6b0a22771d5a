//! Post-download consolidation strategies.
//!
//! Three strategies over the downloaded tile set:
//!
//! - [`Strategy::AllRaw`] — keep every tile as-is;
//! - [`Strategy::MergeIntersecting`] — combine tiles into one artifact per
//!   data type (LAS concatenation for point clouds, grid mosaic for rasters);
//! - [`Strategy::BestCoverage`] — keep only the tile whose footprint overlaps
//!   the query geometry the most.
//!
//! Download completion order is nondeterministic; consolidation restores
//! determinism by processing tiles in ascending tile-id order. For merges the
//! overlap rule is last-wins: where tiles overlap, the tile with the greater
//! id provides the data.
//!
//! Corrupt or unreadable inputs are skipped and reported, not fatal — unless
//! nothing valid remains.

mod grid;
mod las;

pub use grid::GridError;
pub use las::LasError;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::download::DownloadedTile;
use crate::geometry::QueryGeometry;
use crate::index::DataType;

/// Consolidation strategy selector.
///
/// A closed set: adding a strategy means adding a variant here and a handler
/// in [`consolidate`], checked for exhaustiveness at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Return the raw tile set unchanged.
    AllRaw,
    /// Merge all tiles of the same data type into one artifact.
    MergeIntersecting,
    /// Keep only the tile with the largest AOI overlap.
    BestCoverage,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::AllRaw => "all",
            Strategy::MergeIntersecting => "merge",
            Strategy::BestCoverage => "best-coverage",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "all" => Some(Strategy::AllRaw),
            "merge" => Some(Strategy::MergeIntersecting),
            "best-coverage" => Some(Strategy::BestCoverage),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Consolidation output: final artifact paths plus any inputs that were
/// skipped as corrupt or unsupported.
#[derive(Debug)]
pub struct Consolidated {
    pub outputs: Vec<PathBuf>,
    /// `(tile id, reason)` for every input dropped from a merge.
    pub skipped_corrupt: Vec<(String, String)>,
}

/// Fatal consolidation failures.
#[derive(Debug, Error)]
pub enum ConsolidateError {
    /// The downloaded set is empty, or every input was corrupt.
    #[error("no valid input for consolidation: {0}")]
    NoValidInput(String),

    /// The merged artifact could not be written.
    #[error("failed to write {path}: {reason}")]
    Output { path: PathBuf, reason: String },
}

/// Applies `strategy` to the downloaded tiles, writing any merged artifacts
/// into `output_dir`.
pub fn consolidate(
    strategy: Strategy,
    downloaded: &[DownloadedTile],
    geometry: &QueryGeometry,
    output_dir: &Path,
) -> Result<Consolidated, ConsolidateError> {
    if downloaded.is_empty() {
        return Err(ConsolidateError::NoValidInput(
            "no downloaded tiles".to_string(),
        ));
    }

    // Deterministic processing order regardless of download completion order.
    let mut tiles: Vec<&DownloadedTile> = downloaded.iter().collect();
    tiles.sort_by(|a, b| a.tile.id.cmp(&b.tile.id));

    match strategy {
        Strategy::AllRaw => Ok(Consolidated {
            outputs: tiles.iter().map(|t| t.path.clone()).collect(),
            skipped_corrupt: Vec::new(),
        }),
        Strategy::MergeIntersecting => merge_by_data_type(&tiles, output_dir),
        Strategy::BestCoverage => best_coverage(&tiles, geometry),
    }
}

/// Merges each data-type group into one artifact.
fn merge_by_data_type(
    tiles: &[&DownloadedTile],
    output_dir: &Path,
) -> Result<Consolidated, ConsolidateError> {
    let mut groups: BTreeMap<&'static str, Vec<&DownloadedTile>> = BTreeMap::new();
    for tile in tiles.iter().copied() {
        groups.entry(tile.tile.data_type.name()).or_default().push(tile);
    }

    let mut outputs = Vec::new();
    let mut skipped_corrupt = Vec::new();
    for (name, group) in groups {
        let data_type = group[0].tile.data_type;
        let inputs: Vec<(String, PathBuf)> = group
            .iter()
            .map(|t| (t.tile.id.clone(), t.path.clone()))
            .collect();

        let (output, skipped) = match data_type {
            DataType::PointCloud => {
                let output = output_dir.join(format!("merged_{}.las", name));
                let outcome = las::merge_tiles(&inputs, &output).map_err(|e| match e {
                    LasError::NoValidInput(reason) => ConsolidateError::NoValidInput(reason),
                    other => ConsolidateError::Output {
                        path: output.clone(),
                        reason: other.to_string(),
                    },
                })?;
                (output, outcome.skipped)
            }
            DataType::Dtm | DataType::Dsm | DataType::Dhm => {
                let output = output_dir.join(format!("merged_{}.asc", name));
                let outcome = grid::merge_tiles(&inputs, &output).map_err(|e| match e {
                    GridError::NoValidInput(reason) => ConsolidateError::NoValidInput(reason),
                    other => ConsolidateError::Output {
                        path: output.clone(),
                        reason: other.to_string(),
                    },
                })?;
                (output, outcome.skipped)
            }
        };

        for (id, reason) in &skipped {
            warn!(tile_id = %id, %reason, "tile skipped during merge");
        }
        info!(
            data_type = name,
            merged = inputs.len() - skipped.len(),
            skipped = skipped.len(),
            output = %output.display(),
            "merge complete"
        );
        outputs.push(output);
        skipped_corrupt.extend(skipped);
    }

    Ok(Consolidated {
        outputs,
        skipped_corrupt,
    })
}

/// Picks the single tile with the largest intersection area.
///
/// Tiles arrive sorted by id and only a strictly greater area replaces the
/// current best, so ties resolve to the lexicographically smallest id.
fn best_coverage(
    tiles: &[&DownloadedTile],
    geometry: &QueryGeometry,
) -> Result<Consolidated, ConsolidateError> {
    let mut best: Option<(&DownloadedTile, f64)> = None;
    for tile in tiles.iter().copied() {
        let area = geometry.intersection_area(&tile.tile.footprint);
        let replace = match &best {
            None => true,
            Some((_, best_area)) => area > *best_area,
        };
        if replace {
            best = Some((tile, area));
        }
    }
    // tiles is non-empty here, so best is always set.
    let (winner, area) = best.ok_or_else(|| {
        ConsolidateError::NoValidInput("no candidate tiles".to_string())
    })?;
    info!(tile_id = %winner.tile.id, area, "best-coverage tile selected");
    Ok(Consolidated {
        outputs: vec![winner.path.clone()],
        skipped_corrupt: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polygon;
    use crate::index::TileDescriptor;

    fn downloaded(id: &str, min_x: f64, max_x: f64, dir: &Path) -> DownloadedTile {
        let path = dir.join(format!("{}.las", id));
        std::fs::write(&path, b"stub").unwrap();
        DownloadedTile {
            tile: TileDescriptor {
                id: id.to_string(),
                footprint: Polygon::rectangle(min_x, 0.0, max_x, 1000.0).unwrap(),
                url: format!("https://tiles.example/{}.las", id),
                data_type: DataType::PointCloud,
                size_bytes: None,
            },
            path,
        }
    }

    fn aoi(min_x: f64, max_x: f64) -> QueryGeometry {
        QueryGeometry::resolve(&[Polygon::rectangle(min_x, 0.0, max_x, 1000.0).unwrap()]).unwrap()
    }

    #[test]
    fn test_strategy_name_round_trip() {
        for s in [Strategy::AllRaw, Strategy::MergeIntersecting, Strategy::BestCoverage] {
            assert_eq!(Strategy::from_name(s.name()), Some(s));
        }
        assert_eq!(Strategy::from_name("closest"), None);
    }

    #[test]
    fn test_empty_input_is_error() {
        let geometry = aoi(0.0, 1000.0);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            consolidate(Strategy::AllRaw, &[], &geometry, dir.path()),
            Err(ConsolidateError::NoValidInput(_))
        ));
    }

    #[test]
    fn test_all_raw_returns_paths_sorted_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = vec![
            downloaded("b", 0.0, 1000.0, dir.path()),
            downloaded("a", 0.0, 1000.0, dir.path()),
        ];
        let result =
            consolidate(Strategy::AllRaw, &tiles, &aoi(0.0, 1000.0), dir.path()).unwrap();
        assert_eq!(result.outputs.len(), 2);
        assert!(result.outputs[0].ends_with("a.las"));
        assert!(result.outputs[1].ends_with("b.las"));
    }

    #[test]
    fn test_best_coverage_picks_largest_overlap() {
        let dir = tempfile::tempdir().unwrap();
        // AOI covers x in [0, 1500]: tile a overlaps 1000 wide, tile b 500.
        let tiles = vec![
            downloaded("a", 0.0, 1000.0, dir.path()),
            downloaded("b", 1000.0, 2000.0, dir.path()),
        ];
        let result =
            consolidate(Strategy::BestCoverage, &tiles, &aoi(0.0, 1500.0), dir.path()).unwrap();
        assert_eq!(result.outputs.len(), 1);
        assert!(result.outputs[0].ends_with("a.las"));
    }

    #[test]
    fn test_best_coverage_tie_breaks_to_smallest_id() {
        let dir = tempfile::tempdir().unwrap();
        // Identical overlap for both tiles.
        let tiles = vec![
            downloaded("b", 1000.0, 2000.0, dir.path()),
            downloaded("a", 0.0, 1000.0, dir.path()),
        ];
        let result =
            consolidate(Strategy::BestCoverage, &tiles, &aoi(0.0, 2000.0), dir.path()).unwrap();
        assert_eq!(result.outputs.len(), 1);
        assert!(result.outputs[0].ends_with("a.las"));
    }
}
