//! Run orchestration.
//!
//! Sequences one acquisition run end to end: resolve the AOI geometry, query
//! the tile index, download with bounded parallelism, consolidate, and emit a
//! [`RunReport`]. Fatal errors (invalid geometry, index unavailable after
//! retries, insufficient disk space) short-circuit; per-tile failures do not —
//! a run always ends with a report unless it dies before any tile work
//! starts.

use std::path::PathBuf;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::consolidate::{consolidate, ConsolidateError, Strategy};
use crate::download::{
    DownloadBatchError, DownloadConfig, DownloadScheduler, DownloadedTile, ProgressSender,
    TileFetcher,
};
use crate::geometry::{GeometryError, Polygon, QueryGeometry};
use crate::index::{DataType, IndexError, TileIndex};

/// Subdirectory of the output directory that holds raw tile payloads.
const TILES_SUBDIR: &str = "tiles";

/// Parameters for one acquisition run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Root output directory. Raw tiles land in `<output_dir>/tiles/`,
    /// merged artifacts in `<output_dir>`.
    pub output_dir: PathBuf,
    /// Concurrent download bound, clamped to 1..=10.
    pub max_concurrent: usize,
    /// Re-fetch tiles even when valid local copies exist.
    pub force: bool,
    /// Consolidation strategy.
    pub strategy: Strategy,
    /// Which tile data type to acquire.
    pub data_type: DataType,
}

impl RunOptions {
    /// Creates options with defaults matching the interactive tool: four
    /// concurrent downloads, no force, raw tile set, point clouds.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            max_concurrent: 4,
            force: false,
            strategy: Strategy::AllRaw,
            data_type: DataType::PointCloud,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }
}

/// Fatal run failures. Everything else lands in the [`RunReport`].
#[derive(Debug, Error)]
pub enum RunError {
    /// The AOI selection resolves to an empty or degenerate geometry.
    #[error("invalid AOI geometry: {0}")]
    InvalidGeometry(#[from] GeometryError),

    /// The tile index kept failing after bounded retries.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// The batch could not start (insufficient space, unusable destination).
    #[error(transparent)]
    Download(#[from] DownloadBatchError),

    /// Consolidation had no valid input or could not write its artifact.
    #[error(transparent)]
    Consolidate(#[from] ConsolidateError),
}

/// Structured outcome of a run, for the host shell to render.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Final artifact paths (raw tiles, merged files, or the single
    /// best-coverage tile, per strategy).
    pub outputs: Vec<PathBuf>,
    /// Ids of tiles downloaded this run.
    pub succeeded: Vec<String>,
    /// Ids and reasons for tiles that failed permanently.
    pub failed: Vec<(String, String)>,
    /// Ids of tiles skipped because a valid local copy existed.
    pub skipped: Vec<String>,
    /// Ids and reasons for tiles dropped from a merge as corrupt.
    pub corrupt_skipped: Vec<(String, String)>,
    /// Human-readable per-tile outcome lines.
    pub tile_log: Vec<String>,
}

impl RunReport {
    /// True when every selected tile ended up in an output artifact.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.corrupt_skipped.is_empty()
    }

    /// One-line summary for logs and CLI output.
    pub fn summary(&self) -> String {
        format!(
            "{} downloaded, {} skipped (cached), {} failed, {} output file(s)",
            self.succeeded.len(),
            self.skipped.len(),
            self.failed.len(),
            self.outputs.len()
        )
    }
}

/// Runs one acquisition end to end.
///
/// `NoTilesFound` is not an error: a geometry intersecting zero tiles yields
/// an empty successful report.
pub async fn run<I, F>(
    index: &I,
    fetcher: F,
    features: &[Polygon],
    options: &RunOptions,
    cancel: &CancellationToken,
    events: Option<ProgressSender>,
) -> Result<RunReport, RunError>
where
    I: TileIndex,
    F: TileFetcher,
{
    let geometry = QueryGeometry::resolve(features)?;
    info!(
        parts = geometry.parts().len(),
        strategy = %options.strategy,
        data_type = %options.data_type,
        "run started"
    );

    let tiles = index.query(&geometry, options.data_type).await?;
    if tiles.is_empty() {
        info!("no tiles intersect the query geometry");
        return Ok(RunReport::default());
    }
    info!(tiles = tiles.len(), "tiles selected for download");

    let tiles_dir = options.output_dir.join(TILES_SUBDIR);
    let scheduler = DownloadScheduler::new(
        fetcher,
        DownloadConfig::new(options.max_concurrent, options.force),
    );
    let downloads = scheduler.download(&tiles, &tiles_dir, cancel, events).await?;

    let on_disk: Vec<DownloadedTile> = downloads.on_disk().cloned().collect();
    let (outputs, corrupt_skipped) = if on_disk.is_empty() {
        warn!("no tiles were downloaded, nothing to consolidate");
        (Vec::new(), Vec::new())
    } else {
        let consolidated = consolidate(
            options.strategy,
            &on_disk,
            &geometry,
            &options.output_dir,
        )?;
        (consolidated.outputs, consolidated.skipped_corrupt)
    };

    let mut report = RunReport {
        outputs,
        succeeded: downloads.succeeded.iter().map(|d| d.tile.id.clone()).collect(),
        failed: downloads
            .failed
            .iter()
            .map(|(t, e)| (t.id.clone(), e.to_string()))
            .collect(),
        skipped: downloads.skipped.iter().map(|d| d.tile.id.clone()).collect(),
        corrupt_skipped,
        tile_log: Vec::new(),
    };
    report.succeeded.sort();
    report.skipped.sort();
    report.failed.sort();
    report.tile_log = build_tile_log(&report);

    info!(summary = %report.summary(), "run complete");
    Ok(report)
}

fn build_tile_log(report: &RunReport) -> Vec<String> {
    let mut log = Vec::new();
    for id in &report.succeeded {
        log.push(format!("{}: downloaded", id));
    }
    for id in &report.skipped {
        log.push(format!("{}: skipped (valid local copy)", id));
    }
    for (id, reason) in &report.failed {
        log.push(format!("{}: failed ({})", id, reason));
    }
    for (id, reason) in &report.corrupt_skipped {
        log.push(format!("{}: excluded from merge ({})", id, reason));
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = RunOptions::new("/tmp/out")
            .with_max_concurrent(8)
            .with_force(true)
            .with_strategy(Strategy::BestCoverage)
            .with_data_type(DataType::Dtm);
        assert_eq!(options.max_concurrent, 8);
        assert!(options.force);
        assert_eq!(options.strategy, Strategy::BestCoverage);
        assert_eq!(options.data_type, DataType::Dtm);
    }

    #[test]
    fn test_report_summary_and_completeness() {
        let mut report = RunReport::default();
        report.succeeded.push("a".into());
        report.skipped.push("b".into());
        assert!(report.is_complete());
        assert!(report.summary().contains("1 downloaded"));
        assert!(report.summary().contains("1 skipped"));

        report.failed.push(("c".into(), "HTTP status 404".into()));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_tile_log_covers_all_outcomes() {
        let report = RunReport {
            outputs: Vec::new(),
            succeeded: vec!["a".into()],
            failed: vec![("b".into(), "HTTP status 404".into())],
            skipped: vec!["c".into()],
            corrupt_skipped: vec![("d".into(), "truncated".into())],
            tile_log: Vec::new(),
        };
        let log = build_tile_log(&report);
        assert_eq!(log.len(), 4);
        assert!(log.iter().any(|l| l.contains("a: downloaded")));
        assert!(log.iter().any(|l| l.contains("b: failed")));
        assert!(log.iter().any(|l| l.contains("c: skipped")));
        assert!(log.iter().any(|l| l.contains("d: excluded")));
    }
}
