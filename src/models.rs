// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default values applied by [`TransferConfig::normalized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDefaults {
    pub chunk_size: u64,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl TransferDefaults {
    /// Ranged downloads: 5 MiB chunks, 30 seconds for the whole run.
    pub const DOWNLOAD: Self = Self {
        chunk_size: 5 * 1024 * 1024,
        timeout: Duration::from_secs(30),
        max_retries: 3,
    };

    /// Gateway uploads: 2 MiB windows, one day for the whole run.
    pub const UPLOAD: Self = Self {
        chunk_size: 2 * 1024 * 1024,
        timeout: Duration::from_secs(24 * 60 * 60),
        max_retries: 3,
    };

    /// Whole-body streaming downloads.
    pub const STREAM: Self = Self {
        chunk_size: 5 * 1024 * 1024,
        timeout: Duration::from_secs(300),
        max_retries: 3,
    };
}

/// Unit of the linear retry backoff when none is configured.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Parameters of a single transfer call.
///
/// `path` is the output target for downloads and the source file for uploads.
/// For uploads `url` is the gateway base address.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub url: String,
    pub path: PathBuf,
    pub chunk_size: u64,
    pub timeout: Duration,
    /// `None` means "use the default retry count".
    pub max_retries: Option<u32>,
    pub auth_token: String,
    /// Upper bound on gateway offset corrections; `None` is unbounded.
    pub max_resyncs: Option<u32>,
    pub backoff: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            path: PathBuf::new(),
            chunk_size: 0,
            timeout: Duration::ZERO,
            max_retries: None,
            auth_token: String::new(),
            max_resyncs: None,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl TransferConfig {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn with_max_resyncs(mut self, max_resyncs: u32) -> Self {
        self.max_resyncs = Some(max_resyncs);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces non-positive chunk size, timeout and backoff, and a missing
    /// retry count, with the given defaults.
    pub fn normalized(mut self, defaults: TransferDefaults) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = defaults.chunk_size;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.max_retries.is_none() {
            self.max_retries = Some(defaults.max_retries);
        }
        if self.backoff.is_zero() {
            self.backoff = DEFAULT_BACKOFF;
        }
        self
    }

    pub fn retries(&self) -> u32 {
        self.max_retries.unwrap_or(0)
    }
}

/// An inclusive byte range `[start, end]`. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range {start}-{end}");
        Self { start, end }
    }

    /// Number of bytes the range covers.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Progress of one download run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    /// Authoritative remote size, fetched once per run.
    pub remote_size: u64,
    /// Bytes known to be on disk.
    pub persisted: u64,
    pub chunk_size: u64,
}

impl DownloadState {
    pub fn new(remote_size: u64, persisted: u64, chunk_size: u64) -> Self {
        Self {
            remote_size,
            persisted,
            chunk_size,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.remote_size.div_ceil(self.chunk_size)
    }

    pub fn next_chunk_index(&self) -> u64 {
        self.persisted / self.chunk_size
    }

    pub fn is_complete(&self) -> bool {
        self.persisted == self.remote_size
    }

    /// Records a confirmed write ending at `range.end`.
    pub fn record(&mut self, range: ChunkRange) {
        self.persisted = self.persisted.max(range.end + 1);
    }
}

/// State of one upload run against the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub file_size: u64,
    pub file_name: String,
    /// Lowercase hex MD5 of the whole file.
    pub file_md5: String,
    /// Offset of the next window to send.
    pub offset: u64,
    pub remote_id: Option<String>,
}

impl UploadSession {
    pub fn new(file_size: u64, file_name: String, file_md5: String) -> Self {
        Self {
            file_size,
            file_name,
            file_md5,
            offset: 0,
            remote_id: None,
        }
    }

    /// Length of the window starting at the current offset.
    pub fn window_len(&self, chunk_size: u64) -> u64 {
        chunk_size.min(self.file_size.saturating_sub(self.offset))
    }
}

/// Application code carried in a gateway reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayCode {
    Success,
    /// The gateway asks the client to resend from `fileIndex`.
    Resync,
    Other(i64),
}

impl GatewayCode {
    pub const SUCCESS: i64 = 200;
    pub const RESYNC: i64 = 7;
}

impl From<i64> for GatewayCode {
    fn from(code: i64) -> Self {
        match code {
            Self::SUCCESS => GatewayCode::Success,
            Self::RESYNC => GatewayCode::Resync,
            other => GatewayCode::Other(other),
        }
    }
}

/// Body of an upload response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReply {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "fileIndex", default)]
    pub file_index: i64,
    #[serde(default)]
    pub id: String,
}

impl GatewayReply {
    pub fn status(&self) -> GatewayCode {
        GatewayCode::from(self.code)
    }
}
