//! Bounded-concurrency download pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    DownloadBatchError, DownloadError, DownloadResult, DownloadedTile, ProgressEvent,
    ProgressSender, TileFetcher,
};
use crate::index::TileDescriptor;

/// Fallback per-tile payload estimate for the disk-space pre-flight, used
/// when the index gives no size hint. Matches a large LiDAR HD tile.
const DEFAULT_TILE_SIZE_ESTIMATE: u64 = 256 * 1024 * 1024;

/// Hard bounds on the concurrency knob.
const MIN_CONCURRENT: usize = 1;
const MAX_CONCURRENT: usize = 10;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum simultaneous in-flight transfers (clamped to 1..=10).
    pub max_concurrent: usize,
    /// Re-fetch tiles even when a valid destination file exists.
    pub force: bool,
    /// Total attempts per tile for transient failures.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub initial_backoff: Duration,
    /// Pre-flight size estimate for tiles without a size hint.
    pub tile_size_estimate: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            force: false,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            tile_size_estimate: DEFAULT_TILE_SIZE_ESTIMATE,
        }
    }
}

impl DownloadConfig {
    /// Creates a config with the given concurrency bound and force flag.
    ///
    /// Out-of-range concurrency values are clamped into 1..=10.
    pub fn new(max_concurrent: usize, force: bool) -> Self {
        Self {
            max_concurrent: max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT),
            force,
            ..Self::default()
        }
    }
}

/// Outcome of one tile task, before aggregation.
enum TileOutcome {
    Done(PathBuf),
    Skipped(PathBuf),
    Failed(DownloadError),
}

/// Downloads batches of tiles with bounded parallelism.
pub struct DownloadScheduler<F> {
    fetcher: F,
    config: DownloadConfig,
}

impl<F: TileFetcher> DownloadScheduler<F> {
    pub fn new(fetcher: F, config: DownloadConfig) -> Self {
        Self { fetcher, config }
    }

    /// Downloads `tiles` into `dest_dir`.
    ///
    /// Tasks are admitted in input order, at most
    /// [`DownloadConfig::max_concurrent`] in flight. The batch aborts before
    /// any write if the destination filesystem cannot hold the estimated
    /// payload. Cancellation stops admission of new tiles; in-flight
    /// transfers run to completion and partial results are still reported.
    pub async fn download(
        &self,
        tiles: &[TileDescriptor],
        dest_dir: &Path,
        cancel: &CancellationToken,
        events: Option<ProgressSender>,
    ) -> Result<DownloadResult, DownloadBatchError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| DownloadBatchError::Destination {
                path: dest_dir.to_path_buf(),
                source: e,
            })?;

        self.preflight_space(tiles, dest_dir).await?;

        info!(
            tiles = tiles.len(),
            max_concurrent = self.config.max_concurrent,
            force = self.config.force,
            "starting download batch"
        );

        let outcomes: Vec<(TileDescriptor, TileOutcome)> = stream::iter(tiles.iter().cloned())
            .map(|tile| {
                let events = events.clone();
                async move {
                    let outcome = self.download_one(&tile, dest_dir, cancel, &events).await;
                    (tile, outcome)
                }
            })
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;

        let mut result = DownloadResult::default();
        for (tile, outcome) in outcomes {
            match outcome {
                TileOutcome::Done(path) => result.succeeded.push(DownloadedTile { tile, path }),
                TileOutcome::Skipped(path) => result.skipped.push(DownloadedTile { tile, path }),
                TileOutcome::Failed(error) => result.failed.push((tile, error)),
            }
        }
        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            "download batch complete"
        );
        Ok(result)
    }

    /// Aborts the batch up front when the destination filesystem cannot hold
    /// the estimated payload of the tiles that actually need fetching.
    async fn preflight_space(
        &self,
        tiles: &[TileDescriptor],
        dest_dir: &Path,
    ) -> Result<(), DownloadBatchError> {
        let mut required: u64 = 0;
        for tile in tiles {
            let dest = dest_dir.join(tile_filename(tile));
            if !self.config.force && is_valid_cached(&dest, tile.size_bytes).await {
                continue;
            }
            required = required
                .saturating_add(tile.size_bytes.unwrap_or(self.config.tile_size_estimate));
        }
        if required == 0 {
            return Ok(());
        }
        let available =
            available_bytes(dest_dir).map_err(|e| DownloadBatchError::Destination {
                path: dest_dir.to_path_buf(),
                source: e,
            })?;
        if available < required {
            return Err(DownloadBatchError::InsufficientSpace {
                required,
                available,
            });
        }
        debug!(required, available, "disk space pre-flight passed");
        Ok(())
    }

    /// Downloads a single tile with skip, retry, and atomic-rename handling.
    async fn download_one(
        &self,
        tile: &TileDescriptor,
        dest_dir: &Path,
        cancel: &CancellationToken,
        events: &Option<ProgressSender>,
    ) -> TileOutcome {
        if cancel.is_cancelled() {
            emit(
                events,
                ProgressEvent::Failed {
                    id: tile.id.clone(),
                    reason: DownloadError::Canceled.to_string(),
                },
            );
            return TileOutcome::Failed(DownloadError::Canceled);
        }

        let filename = tile_filename(tile);
        let dest = dest_dir.join(&filename);

        if !self.config.force && is_valid_cached(&dest, tile.size_bytes).await {
            debug!(tile_id = %tile.id, path = %dest.display(), "valid file exists, skipping");
            emit(events, ProgressEvent::Skipped { id: tile.id.clone() });
            return TileOutcome::Skipped(dest);
        }

        // Expected size for completeness verification: index hint first,
        // otherwise one HEAD probe. A failed probe just disables the check.
        let expected = match tile.size_bytes {
            Some(size) => Some(size),
            None => self.fetcher.content_length(&tile.url).await.unwrap_or(None),
        };

        // Distinct temp name per tile, so concurrent workers never contend.
        let temp = dest_dir.join(format!("{}.partial", filename));

        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt == 1 {
                emit(events, ProgressEvent::Started { id: tile.id.clone() });
            }

            let error = match self.attempt_fetch(tile, &temp, &dest, expected).await {
                Ok(bytes) => {
                    emit(
                        events,
                        ProgressEvent::Completed {
                            id: tile.id.clone(),
                            bytes,
                        },
                    );
                    return TileOutcome::Done(dest);
                }
                Err(e) => e,
            };

            let _ = tokio::fs::remove_file(&temp).await;

            if error.is_transient() && attempt < self.config.max_attempts && !cancel.is_cancelled()
            {
                warn!(tile_id = %tile.id, attempt, error = %error, "transient failure, retrying");
                emit(
                    events,
                    ProgressEvent::Retrying {
                        id: tile.id.clone(),
                        attempt,
                        reason: error.to_string(),
                    },
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }

            warn!(tile_id = %tile.id, attempt, error = %error, "download failed");
            emit(
                events,
                ProgressEvent::Failed {
                    id: tile.id.clone(),
                    reason: error.to_string(),
                },
            );
            return TileOutcome::Failed(error);
        }
    }

    /// One fetch attempt: stream to the temp file, verify, rename into place.
    ///
    /// The final path only ever appears via rename, so a crash or cancel
    /// mid-transfer leaves at most a `.partial` file.
    async fn attempt_fetch(
        &self,
        tile: &TileDescriptor,
        temp: &Path,
        dest: &Path,
        expected: Option<u64>,
    ) -> Result<u64, DownloadError> {
        let written = self.fetcher.fetch(&tile.url, temp).await?;
        if written == 0 {
            return Err(DownloadError::Empty);
        }
        if let Some(expected) = expected {
            if written != expected {
                return Err(DownloadError::SizeMismatch {
                    expected,
                    actual: written,
                });
            }
        }
        tokio::fs::rename(temp, dest)
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        Ok(written)
    }
}

/// Derives the destination filename for a tile from its URL, falling back to
/// the tile id.
fn tile_filename(tile: &TileDescriptor) -> String {
    let path = tile.url.split(['?', '#']).next().unwrap_or(&tile.url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => tile.id.clone(),
    }
}

/// Cache check: the destination exists, is non-empty, and matches the known
/// payload size when the index advertised one.
async fn is_valid_cached(dest: &Path, size_bytes: Option<u64>) -> bool {
    match tokio::fs::metadata(dest).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => match size_bytes {
            Some(expected) => meta.len() == expected,
            None => true,
        },
        _ => false,
    }
}

fn emit(events: &Option<ProgressSender>, event: ProgressEvent) {
    if let Some(sender) = events {
        // A dropped receiver means the host stopped listening; not an error.
        let _ = sender.send(event);
    }
}

/// Free bytes available to unprivileged writes on the filesystem holding
/// `path`.
pub fn available_bytes(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}
