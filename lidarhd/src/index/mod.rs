//! Tile index abstraction.
//!
//! The tile index answers one question: which tiles intersect the query
//! geometry? The answer comes back as [`TileDescriptor`] records carrying the
//! tile footprint and download URL. The concrete service behind the index is
//! pluggable; [`HttpTileIndex`] talks to an HTTP feature service, and tests
//! supply their own implementations of [`TileIndex`].

mod http;

pub use http::{HttpClient, HttpResponse, HttpTileIndex, IndexConfig, ReqwestClient, TransportError};

use std::future::Future;

use thiserror::Error;

use crate::geometry::{Polygon, QueryGeometry};

/// The kind of data a tile carries.
///
/// `PointCloud` tiles are LAS point clouds; the three raster variants are
/// derived elevation models (terrain, surface, and height = surface - terrain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    PointCloud,
    Dtm,
    Dsm,
    Dhm,
}

impl DataType {
    /// Stable lowercase name, used in service queries and output filenames.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::PointCloud => "point-cloud",
            DataType::Dtm => "dtm",
            DataType::Dsm => "dsm",
            DataType::Dhm => "dhm",
        }
    }

    /// Parses the stable name produced by [`DataType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "point-cloud" => Some(DataType::PointCloud),
            "dtm" => Some(DataType::Dtm),
            "dsm" => Some(DataType::Dsm),
            "dhm" => Some(DataType::Dhm),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata for one remote tile, as returned by the index.
///
/// Immutable once fetched; everything downstream (scheduling, consolidation)
/// keys off the `id`.
#[derive(Debug, Clone)]
pub struct TileDescriptor {
    /// Unique tile identifier within the index.
    pub id: String,
    /// Coverage footprint in the index CRS. Axis-aligned and convex.
    pub footprint: Polygon,
    /// Payload download URL.
    pub url: String,
    /// Kind of data behind `url`.
    pub data_type: DataType,
    /// Payload size hint in bytes, when the index knows it.
    pub size_bytes: Option<u64>,
}

/// Errors from querying the tile index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The service could not be reached or kept failing after bounded
    /// retries. Fatal for the run.
    #[error("tile index unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    /// The service answered with a payload we could not interpret.
    #[error("malformed index response: {0}")]
    InvalidResponse(String),
}

/// A queryable source of tile metadata.
pub trait TileIndex: Send + Sync {
    /// Returns the descriptors of all tiles of `data_type` whose footprint
    /// intersects `geometry`, deduplicated by id.
    ///
    /// An empty vector is a valid answer (no coverage), not an error.
    fn query(
        &self,
        geometry: &QueryGeometry,
        data_type: DataType,
    ) -> impl Future<Output = Result<Vec<TileDescriptor>, IndexError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_name_round_trip() {
        for dt in [DataType::PointCloud, DataType::Dtm, DataType::Dsm, DataType::Dhm] {
            assert_eq!(DataType::from_name(dt.name()), Some(dt));
        }
        assert_eq!(DataType::from_name("raster"), None);
    }

    #[test]
    fn test_index_error_display() {
        let err = IndexError::Unavailable {
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("connection refused"));
    }
}
