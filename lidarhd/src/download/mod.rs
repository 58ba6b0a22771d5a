//! Concurrent tile download scheduling.
//!
//! The scheduler owns everything between "here is the tile list" and "here
//! are the files on disk": a bounded worker pool, cache-hit skipping, atomic
//! temp-file writes, transient-failure retry with backoff, a pre-flight disk
//! space check, cooperative cancellation, and per-tile progress events.
//!
//! # Architecture
//!
//! ```text
//! tiles ──► DownloadScheduler ──► TileFetcher (HTTP / mock)
//!                │                      │
//!                │ ProgressEvent        ▼
//!                ▼                 <name>.partial ── rename ──► <name>
//!           host (CLI, UI)
//! ```
//!
//! The scheduler is presentation-agnostic: progress is emitted on an mpsc
//! channel and the host decides how to render it.

mod fetcher;
mod scheduler;

pub use fetcher::{HttpFetcher, TileFetcher};
pub use scheduler::{available_bytes, DownloadConfig, DownloadScheduler};

use std::path::PathBuf;

use thiserror::Error;

use crate::index::TileDescriptor;

/// Per-tile download failure.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Connection-level failure (refused, reset, timeout). Retried.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status. 5xx is retried, 4xx is permanent.
    #[error("HTTP status {status}")]
    Status { status: u16 },

    /// Local filesystem failure. Permanent (retrying won't free the disk).
    #[error("I/O error: {0}")]
    Io(String),

    /// Transfer ended short of the expected payload size. Retried.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The server returned a zero-byte payload. Retried.
    #[error("empty payload")]
    Empty,

    /// The run was canceled before this tile started.
    #[error("canceled before start")]
    Canceled,
}

impl DownloadError {
    /// Whether the scheduler should retry this failure.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::Status { status } => *status >= 500,
            DownloadError::SizeMismatch { .. } => true,
            DownloadError::Empty => true,
            DownloadError::Io(_) => false,
            DownloadError::Canceled => false,
        }
    }
}

/// Batch-level failure: nothing was written.
#[derive(Debug, Error)]
pub enum DownloadBatchError {
    /// The destination filesystem cannot hold the estimated payload.
    #[error("insufficient disk space: need about {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    /// The destination directory could not be created or inspected.
    #[error("failed to prepare destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A tile present on disk, either freshly downloaded or skipped as cached.
#[derive(Debug, Clone)]
pub struct DownloadedTile {
    pub tile: TileDescriptor,
    pub path: PathBuf,
}

/// Aggregate outcome of one download batch.
///
/// A failed batch has no rollback: tiles downloaded before a failure stay in
/// place and appear in `succeeded`.
#[derive(Debug, Default)]
pub struct DownloadResult {
    pub succeeded: Vec<DownloadedTile>,
    pub failed: Vec<(TileDescriptor, DownloadError)>,
    pub skipped: Vec<DownloadedTile>,
}

impl DownloadResult {
    /// All tiles present on disk, downloaded or cached.
    pub fn on_disk(&self) -> impl Iterator<Item = &DownloadedTile> {
        self.succeeded.iter().chain(self.skipped.iter())
    }
}

/// Incremental progress, one event per tile state change.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started { id: String },
    Retrying { id: String, attempt: u32, reason: String },
    Completed { id: String, bytes: u64 },
    Skipped { id: String },
    Failed { id: String, reason: String },
}

/// Channel end the scheduler publishes progress on.
pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DownloadError::Network("reset".into()).is_transient());
        assert!(DownloadError::Status { status: 503 }.is_transient());
        assert!(DownloadError::Empty.is_transient());
        assert!(DownloadError::SizeMismatch { expected: 10, actual: 5 }.is_transient());
        assert!(!DownloadError::Status { status: 404 }.is_transient());
        assert!(!DownloadError::Io("disk full".into()).is_transient());
        assert!(!DownloadError::Canceled.is_transient());
    }
}
