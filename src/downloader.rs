use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{ChunkRange, DownloadState, TransferConfig, TransferDefaults};
use crate::probe::{probe, ProbeError};
use crate::progress::{local_size, ProgressCallback};
use crate::range::download_range;
use crate::retry::{run_with_retry, Deadline, RetryFailure, RetryPolicy, Retryable};
use crate::transport::{HttpTransport, Transport, TransportError};

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("metadata probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("{url} does not support range requests")]
    RangeUnsupported { url: String },
    #[error("network error: {0}")]
    Transport(#[from] TransportError),
    #[error("range {range} returned status {status}")]
    Status { range: ChunkRange, status: u16 },
    #[error("range {range} answered with Content-Range {actual:?}")]
    ContentRangeMismatch { range: ChunkRange, actual: String },
    #[error("range {range} delivered {actual} bytes, expected {expected}")]
    LengthMismatch {
        range: ChunkRange,
        expected: u64,
        actual: u64,
    },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("local file holds {local} bytes but the remote resource has only {remote}")]
    LocalExceedsRemote { local: u64, remote: u64 },
    #[error("deadline exceeded {} after {attempts} attempt(s)", describe(.range))]
    DeadlineExceeded {
        range: Option<ChunkRange>,
        attempts: u32,
    },
    #[error("range {range} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        range: ChunkRange,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },
    #[error("incomplete download: expected {expected} bytes, found {actual}")]
    Incomplete { expected: u64, actual: u64 },
}

fn describe(range: &Option<ChunkRange>) -> String {
    match range {
        Some(range) => format!("while fetching range {range}"),
        None => "while probing".to_string(),
    }
}

impl Retryable for DownloadError {
    /// Network trouble and server misbehavior may clear up; local I/O will not.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Transport(TransportError::Network(_) | TransportError::Connection(_))
                | DownloadError::Status { .. }
                | DownloadError::ContentRangeMismatch { .. }
                | DownloadError::LengthMismatch { .. }
        )
    }
}

/// What a finished download run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub total_size: u64,
    /// Bytes already on disk when the run started.
    pub resumed_from: u64,
    pub chunks_fetched: u64,
    pub bytes_fetched: u64,
}

/// Every range of a `total`-byte resource cut into `chunk_size` pieces.
pub fn plan_chunks(total: u64, chunk_size: u64) -> Vec<ChunkRange> {
    grid(total, chunk_size, 0).collect()
}

/// The ranges still missing when `persisted` bytes are already on disk.
///
/// Starts at chunk `persisted / chunk_size`, skips chunks that are fully on
/// disk and narrows a partially written chunk to begin at `persisted`.
pub fn resume_plan(total: u64, chunk_size: u64, persisted: u64) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    grid(total, chunk_size, persisted / chunk_size)
        .filter(|range| range.end >= persisted)
        .map(|range| ChunkRange::new(range.start.max(persisted), range.end))
        .collect()
}

fn grid(total: u64, chunk_size: u64, first: u64) -> impl Iterator<Item = ChunkRange> {
    let chunk_size = chunk_size.max(1);
    let chunks = total.div_ceil(chunk_size);
    (first..chunks).map(move |index| {
        let start = index * chunk_size;
        let end = start.saturating_add(chunk_size - 1).min(total - 1);
        ChunkRange::new(start, end)
    })
}

/// Serial, resumable ranged download of one resource into one file.
pub struct Downloader<T = HttpTransport> {
    transport: T,
    config: TransferConfig,
    on_progress: Option<ProgressCallback>,
}

impl Downloader<HttpTransport> {
    /// Create a new downloader with its own HTTP client.
    pub fn new(config: TransferConfig) -> Result<Self, DownloadError> {
        Ok(Self::with_transport(config, HttpTransport::new()?))
    }
}

impl<T: Transport> Downloader<T> {
    pub fn with_transport(config: TransferConfig, transport: T) -> Self {
        Self {
            transport,
            config: config.normalized(TransferDefaults::DOWNLOAD),
            on_progress: None,
        }
    }

    /// Registers a callback receiving `(bytes_on_disk, total_size)`.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Downloads whatever part of the resource is not on disk yet.
    pub async fn run(&self) -> Result<DownloadReport, DownloadError> {
        let config = &self.config;
        if config.url.is_empty() {
            return Err(DownloadError::InvalidConfig("url must not be empty".into()));
        }
        if config.path.as_os_str().is_empty() {
            return Err(DownloadError::InvalidConfig(
                "output path must not be empty".into(),
            ));
        }

        let deadline = Deadline::after(config.timeout);
        let policy = RetryPolicy::from_config(config);
        let path = config.path.as_path();

        let meta = tokio::time::timeout_at(
            deadline.instant(),
            probe(&self.transport, &config.url, &config.auth_token),
        )
        .await
        .map_err(|_| DownloadError::DeadlineExceeded {
            range: None,
            attempts: 1,
        })??;
        if !meta.accepts_ranges {
            return Err(DownloadError::RangeUnsupported {
                url: config.url.clone(),
            });
        }

        let local = local_size(path).await.map_err(|e| io_error(path, e))?;
        if local > meta.size {
            return Err(DownloadError::LocalExceedsRemote {
                local,
                remote: meta.size,
            });
        }

        let mut state = DownloadState::new(meta.size, local, config.chunk_size);
        let mut report = DownloadReport {
            total_size: meta.size,
            resumed_from: local,
            chunks_fetched: 0,
            bytes_fetched: 0,
        };

        if state.is_complete() {
            if meta.size == 0 {
                prepare_output(path).await?;
            }
            info!(path = %path.display(), size = meta.size, "file already complete");
            self.report_progress(&state);
            return Ok(report);
        }

        prepare_output(path).await?;
        let plan = resume_plan(meta.size, config.chunk_size, local);
        info!(
            url = %config.url,
            size = meta.size,
            chunk_size = config.chunk_size,
            total_chunks = state.total_chunks(),
            resume_chunk = state.next_chunk_index(),
            remaining = plan.len(),
            "starting ranged download"
        );

        for range in plan {
            debug!(
                chunk = range.start / config.chunk_size + 1,
                total_chunks = state.total_chunks(),
                %range,
                "fetching chunk"
            );
            let written = run_with_retry(policy, deadline, |_| self.fetch(range))
                .await
                .map_err(|failure| match failure {
                    RetryFailure::Fatal(e) => e,
                    RetryFailure::Exhausted { attempts, last } => DownloadError::RetriesExhausted {
                        range,
                        attempts,
                        source: Box::new(last),
                    },
                    RetryFailure::DeadlineExceeded { attempts, .. } => {
                        DownloadError::DeadlineExceeded {
                            range: Some(range),
                            attempts,
                        }
                    }
                })?;

            state.record(range);
            report.chunks_fetched += 1;
            report.bytes_fetched += written;
            self.report_progress(&state);
        }

        let actual = local_size(path).await.map_err(|e| io_error(path, e))?;
        if actual != meta.size {
            return Err(DownloadError::Incomplete {
                expected: meta.size,
                actual,
            });
        }

        info!(path = %path.display(), size = actual, "download complete");
        Ok(report)
    }

    /// One attempt at one chunk; a short write counts as a failed attempt.
    async fn fetch(&self, range: ChunkRange) -> Result<u64, DownloadError> {
        let written = download_range(
            &self.transport,
            &self.config.url,
            &self.config.path,
            range,
            &self.config.auth_token,
        )
        .await?;
        if written != range.len() {
            return Err(DownloadError::LengthMismatch {
                range,
                expected: range.len(),
                actual: written,
            });
        }
        Ok(written)
    }

    fn report_progress(&self, state: &DownloadState) {
        if let Some(callback) = &self.on_progress {
            callback(state.persisted, state.remote_size);
        }
    }
}

/// Downloads `config.url` into `config.path` with a fresh HTTP client.
pub async fn download_file(config: TransferConfig) -> Result<DownloadReport, DownloadError> {
    Downloader::new(config)?.run().await
}

fn io_error(path: &Path, source: std::io::Error) -> DownloadError {
    DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Creates missing parent directories and the output file itself.
async fn prepare_output(path: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    Ok(())
}
