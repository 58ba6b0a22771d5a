//! LidarHD - tile acquisition engine for French IGN LiDAR HD data.
//!
//! Given an area-of-interest polygon, this library finds the remote tiles
//! whose footprints intersect it, downloads them concurrently with bounded
//! parallelism and retry, and consolidates the result into a deliverable:
//! the raw tile set, one merged artifact per data type, or the single tile
//! with the best AOI coverage.
//!
//! # Pipeline
//!
//! ```text
//! AOI features ──► geometry ──► index ──► download ──► consolidate ──► RunReport
//! ```
//!
//! The [`run`] module ties the stages together; each stage is usable on its
//! own. Network boundaries ([`index::TileIndex`], [`download::TileFetcher`])
//! are traits, so hosts and tests can substitute their own transports.

pub mod consolidate;
pub mod download;
pub mod geometry;
pub mod index;
pub mod run;

pub use consolidate::Strategy;
pub use download::{ProgressEvent, ProgressSender};
pub use geometry::{Point, Polygon};
pub use index::{DataType, TileDescriptor};
pub use run::{run, RunError, RunOptions, RunReport};
