// src/upload.rs

//! One chunk POSTed to the gateway.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::integrity::IntegrityError;
use crate::models::GatewayReply;
use crate::retry::Retryable;
use crate::transport::{Request, Transport, TransportError, AUTH_TOKEN};

/// Path of the chunked upload endpoint below the gateway address.
pub const UPLOAD_PATH: &str = "/v1/addLargeFile";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("content hash failed: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("network error: {0}")]
    Transport(#[from] TransportError),
    #[error("upload at offset {offset} returned HTTP status {status}")]
    HttpStatus { offset: u64, status: u16 },
    #[error("unreadable gateway reply at offset {offset}: {source}")]
    InvalidReply {
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("gateway rejected upload at offset {offset}: code {code}, {message}")]
    Gateway {
        offset: u64,
        code: i64,
        message: String,
    },
    #[error("gateway reported offset {reported} outside a {file_size}-byte file")]
    OffsetOutOfRange { reported: i64, file_size: u64 },
    #[error("gateway requested more than {limit} resyncs (last offset {offset})")]
    TooManyResyncs { limit: u32, offset: u64 },
    #[error("deadline exceeded at offset {offset} after {attempts} attempt(s)")]
    DeadlineExceeded { offset: u64, attempts: u32 },
    #[error("upload at offset {offset} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        offset: u64,
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },
}

impl Retryable for UploadError {
    /// Only the trip to the gateway is repeated; its application codes are final.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Transport(TransportError::Network(_) | TransportError::Connection(_))
                | UploadError::HttpStatus { .. }
        )
    }
}

/// Transfer metadata sent with every chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkUpload<'a> {
    pub offset: u64,
    pub file_size: u64,
    pub file_name: &'a str,
    pub file_md5: &'a str,
    pub auth_token: &'a str,
}

/// The upload endpoint for a gateway base address.
pub fn endpoint(gateway: &str) -> String {
    format!("{}{}", gateway.trim_end_matches('/'), UPLOAD_PATH)
}

/// POSTs `body` as the window starting at `meta.offset` and parses the reply.
///
/// Whatever code the gateway answers with is returned as-is; only transport
/// failures, non-200 statuses and undecodable bodies are errors.
pub async fn send_chunk<T: Transport>(
    transport: &T,
    endpoint: &str,
    meta: &ChunkUpload<'_>,
    body: Bytes,
) -> Result<GatewayReply, UploadError> {
    let len = body.len();
    let request = Request::new(Method::POST, endpoint)
        .header(CONTENT_TYPE.as_str(), "application/octet-stream")?
        .header("FileStartIndex", &meta.offset.to_string())?
        .header("FileSize", &meta.file_size.to_string())?
        .header("FileName", meta.file_name)?
        .header("FileMd5", meta.file_md5)?
        .header(AUTH_TOKEN, meta.auth_token)?
        .body(body);

    let response = transport.send(request).await?;
    if response.status != StatusCode::OK {
        return Err(UploadError::HttpStatus {
            offset: meta.offset,
            status: response.status.as_u16(),
        });
    }

    let raw = response.bytes().await?;
    let reply: GatewayReply =
        serde_json::from_slice(&raw).map_err(|source| UploadError::InvalidReply {
            offset: meta.offset,
            source,
        })?;
    debug!(
        offset = meta.offset,
        len,
        code = reply.code,
        file_index = reply.file_index,
        "gateway replied"
    );
    Ok(reply)
}
