// src/probe.rs

use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH};
use reqwest::Method;
use thiserror::Error;
use tracing::debug;

use crate::transport::{Request, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("metadata request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("metadata request for {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("server did not provide Content-Length for {url}")]
    MissingSize { url: String },
    #[error("unparseable Content-Length {value:?} for {url}")]
    InvalidSize { url: String, value: String },
}

/// What a HEAD request reveals about a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: u64,
    pub accepts_ranges: bool,
}

/// Issues a HEAD request and reads the size and range capability.
///
/// Failures are returned as-is; retrying is up to the caller.
pub async fn probe<T: Transport>(
    transport: &T,
    url: &str,
    auth_token: &str,
) -> Result<RemoteMetadata, ProbeError> {
    let request = Request::new(Method::HEAD, url).auth(auth_token)?;
    let response = transport.send(request).await?;

    if !response.status.is_success() {
        return Err(ProbeError::Status {
            url: url.to_string(),
            status: response.status.as_u16(),
        });
    }

    let raw = response
        .headers
        .get(CONTENT_LENGTH)
        .ok_or_else(|| ProbeError::MissingSize {
            url: url.to_string(),
        })?;
    let size = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| ProbeError::InvalidSize {
            url: url.to_string(),
            value: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
        })?;

    let accepts_ranges = response
        .headers
        .get(ACCEPT_RANGES)
        .map(|v| v.as_bytes() == b"bytes")
        .unwrap_or(false);

    debug!(url, size, accepts_ranges, "probed remote resource");
    Ok(RemoteMetadata {
        size,
        accepts_ranges,
    })
}
