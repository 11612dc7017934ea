// src/stream.rs

//! Whole-body downloads handed to the caller as a byte stream.

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::models::{TransferConfig, TransferDefaults};
use crate::retry::{run_with_retry, Deadline, RetryFailure, RetryPolicy, Retryable};
use crate::transport::{BodyStream, Request, Response, Transport, TransportError};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Transport(#[from] TransportError),
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },
    #[error("request failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StreamError>,
    },
    #[error("failed to write the stream: {0}")]
    Write(#[source] std::io::Error),
}

impl Retryable for StreamError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Transport(TransportError::Network(_) | TransportError::Connection(_))
                | StreamError::Status { .. }
        )
    }
}

/// An open download whose body has not been consumed yet.
pub struct DownloadStream {
    /// `Content-Length` of the response, or 0 when the server sent none.
    pub total_size: u64,
    pub body: BodyStream,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

impl DownloadStream {
    /// Drains the body into `writer` and returns the byte count.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0u64;
        while let Some(piece) = self.body.next().await {
            let piece = piece?;
            writer.write_all(&piece).await.map_err(StreamError::Write)?;
            copied += piece.len() as u64;
        }
        writer.flush().await.map_err(StreamError::Write)?;
        debug!(copied, "stream drained");
        Ok(copied)
    }
}

/// Opens a plain `GET` on `config.url`, retrying until a `200` arrives.
///
/// The deadline bounds connection setup only; reading the body is left to
/// the caller.
pub async fn open_stream<T: Transport>(
    transport: &T,
    config: &TransferConfig,
) -> Result<DownloadStream, StreamError> {
    if config.url.is_empty() {
        return Err(StreamError::InvalidConfig("url must not be empty".into()));
    }
    let config = config.clone().normalized(TransferDefaults::STREAM);
    let deadline = Deadline::after(config.timeout);
    let policy = RetryPolicy::from_config(&config);

    let response = run_with_retry(policy, deadline, |_| {
        connect(transport, &config.url, &config.auth_token)
    })
    .await
    .map_err(|failure| match failure {
        RetryFailure::Fatal(e) => e,
        RetryFailure::Exhausted { attempts, last } => StreamError::RetriesExhausted {
            attempts,
            source: Box::new(last),
        },
        RetryFailure::DeadlineExceeded { attempts, .. } => StreamError::DeadlineExceeded { attempts },
    })?;

    let total_size = response
        .header_str(CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    info!(url = %config.url, total_size, "stream opened");
    Ok(DownloadStream {
        total_size,
        body: response.body,
    })
}

async fn connect<T: Transport>(
    transport: &T,
    url: &str,
    auth_token: &str,
) -> Result<Response, StreamError> {
    let request = Request::new(Method::GET, url).auth(auth_token)?;
    let response = transport.send(request).await?;
    if response.status != StatusCode::OK {
        return Err(StreamError::Status {
            url: url.to_string(),
            status: response.status.as_u16(),
        });
    }
    Ok(response)
}
