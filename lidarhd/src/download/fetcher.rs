//! Payload fetching abstraction.
//!
//! Mirrors the index-client split: a trait for the transfer itself so the
//! scheduler can be exercised with mock fetchers in tests, and a streaming
//! `reqwest` implementation for production.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::DownloadError;

/// Streams tile payloads to local files.
pub trait TileFetcher: Send + Sync {
    /// Fetches `url` into `dest`, returning the number of bytes written.
    ///
    /// `dest` may be left behind (possibly truncated) on failure; the caller
    /// owns cleanup. The destination file is created or truncated.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, DownloadError>> + Send;

    /// Asks the remote for the payload size, when it advertises one.
    fn content_length(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Option<u64>, DownloadError>> + Send;
}

/// Production fetcher backed by a streaming HTTP client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher with transfer-friendly timeouts: bounded connect and
    /// read stall timeouts, no overall deadline (tile payloads are large).
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DownloadError::Network(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn classify(e: reqwest::Error) -> DownloadError {
        if let Some(status) = e.status() {
            return DownloadError::Status {
                status: status.as_u16(),
            };
        }
        DownloadError::Network(e.to_string())
    }
}

impl TileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let response = self.client.get(url).send().await.map_err(Self::classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
            });
        }

        let mut file = File::create(dest)
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::classify)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::Io(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        Ok(written)
    }

    async fn content_length(&self, url: &str) -> Result<Option<u64>, DownloadError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(Self::classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response.content_length())
    }
}
