// src/range.rs

//! One bounded range request, written in place.

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Method, StatusCode};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tracing::{debug, warn};

use crate::downloader::DownloadError;
use crate::models::ChunkRange;
use crate::transport::{BodyStream, Request, Transport};

/// Write buffer in front of the output file.
const WRITE_BUFFER: usize = 1024 * 1024;

/// Requests `range` of `url` and writes the bytes at offset `range.start` of `path`.
///
/// A `206` must carry a `Content-Range` naming exactly the requested span.
/// A `200` means the server ignored the range and sent the whole resource;
/// the leading bytes are discarded and only the requested span is written.
/// Returns the number of bytes written, which may fall short of
/// `range.len()` when the body ends early.
pub async fn download_range<T: Transport>(
    transport: &T,
    url: &str,
    path: &Path,
    range: ChunkRange,
    auth_token: &str,
) -> Result<u64, DownloadError> {
    let request = Request::new(Method::GET, url)
        .header(RANGE.as_str(), &range.header_value())?
        .auth(auth_token)?;
    let response = transport.send(request).await?;

    let whole_body = match response.status {
        StatusCode::PARTIAL_CONTENT => {
            validate_content_range(response.header_str(CONTENT_RANGE.as_str()), range)?;
            false
        }
        StatusCode::OK => {
            warn!(%range, "server ignored the range request, reading the whole body");
            true
        }
        other => {
            return Err(DownloadError::Status {
                range,
                status: other.as_u16(),
            })
        }
    };

    write_at(path, range, whole_body, response.body).await
}

/// Checks a `Content-Range` value of the form `bytes <start>-<end>/<total>`
/// against the requested range. The total is not inspected.
pub fn validate_content_range(header: Option<&str>, range: ChunkRange) -> Result<(), DownloadError> {
    let mismatch = || DownloadError::ContentRangeMismatch {
        range,
        actual: header.unwrap_or_default().to_string(),
    };

    let value = header.ok_or_else(mismatch)?;
    let (unit, rest) = value.trim().split_once(' ').ok_or_else(mismatch)?;
    if unit != "bytes" {
        return Err(mismatch());
    }
    let span = rest.split('/').next().unwrap_or_default();
    let (start, end) = span.split_once('-').ok_or_else(mismatch)?;
    let start: u64 = start.parse().map_err(|_| mismatch())?;
    let end: u64 = end.parse().map_err(|_| mismatch())?;

    if start == range.start && end == range.end {
        Ok(())
    } else {
        Err(mismatch())
    }
}

async fn write_at(
    path: &Path,
    range: ChunkRange,
    whole_body: bool,
    mut body: BodyStream,
) -> Result<u64, DownloadError> {
    let io = |source: std::io::Error| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(io)?;
    file.seek(SeekFrom::Start(range.start)).await.map_err(io)?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);

    let expected = range.len();
    let mut to_skip = if whole_body { range.start } else { 0 };
    let mut written = 0u64;

    while let Some(piece) = body.next().await {
        let mut piece: Bytes = piece?;
        if to_skip > 0 {
            let n = to_skip.min(piece.len() as u64);
            piece = piece.slice(n as usize..);
            to_skip -= n;
        }
        if piece.is_empty() {
            continue;
        }

        let room = expected - written;
        if piece.len() as u64 > room {
            if !whole_body {
                return Err(DownloadError::LengthMismatch {
                    range,
                    expected,
                    actual: written + piece.len() as u64,
                });
            }
            piece = piece.slice(..room as usize);
        }

        writer.write_all(&piece).await.map_err(io)?;
        written += piece.len() as u64;

        if whole_body && written == expected {
            break;
        }
    }

    writer.flush().await.map_err(io)?;
    writer.into_inner().sync_data().await.map_err(io)?;
    debug!(%range, written, "chunk written");
    Ok(written)
}
