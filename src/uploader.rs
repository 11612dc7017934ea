use bytes::Bytes;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, info, warn};

use crate::integrity::md5_hex;
use crate::models::{GatewayCode, GatewayReply, TransferConfig, TransferDefaults, UploadSession};
use crate::progress::ProgressCallback;
use crate::retry::{run_with_retry, Deadline, RetryFailure, RetryPolicy};
use crate::transport::{HttpTransport, Transport};
use crate::upload::{endpoint, send_chunk, ChunkUpload, UploadError};

/// Where the upload loop stands after a gateway reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    /// Send the window starting at this offset next.
    Sending(u64),
    /// The gateway assigned the final identifier.
    Done(String),
    /// The gateway refused the transfer.
    Failed { code: i64, message: String },
}

/// Applies one gateway reply to the upload loop.
///
/// A resync moves the offset to `fileIndex` even when that rewinds behind
/// bytes already sent. An offset outside the file is a protocol error.
pub fn transition(reply: &GatewayReply, file_size: u64) -> Result<UploadState, UploadError> {
    let next_offset = || {
        u64::try_from(reply.file_index)
            .ok()
            .filter(|offset| *offset <= file_size)
            .ok_or(UploadError::OffsetOutOfRange {
                reported: reply.file_index,
                file_size,
            })
    };

    match reply.status() {
        GatewayCode::Resync => Ok(UploadState::Sending(next_offset()?)),
        GatewayCode::Success if !reply.id.is_empty() => Ok(UploadState::Done(reply.id.clone())),
        GatewayCode::Success => Ok(UploadState::Sending(next_offset()?)),
        GatewayCode::Other(code) => Ok(UploadState::Failed {
            code,
            message: reply.message.clone(),
        }),
    }
}

/// What a finished upload run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Identifier the gateway assigned to the stored file.
    pub id: String,
    pub file_size: u64,
    pub file_md5: String,
    /// Windows acknowledged by the gateway, resent ones included.
    pub chunks_sent: u64,
    /// Replies that moved the offset backwards or left it in place.
    pub resyncs: u32,
}

/// Serial chunked upload of one file to the gateway.
pub struct Uploader<T = HttpTransport> {
    transport: T,
    config: TransferConfig,
    on_progress: Option<ProgressCallback>,
}

impl Uploader<HttpTransport> {
    pub fn new(config: TransferConfig) -> Result<Self, UploadError> {
        Ok(Self::with_transport(config, HttpTransport::new()?))
    }
}

impl<T: Transport> Uploader<T> {
    pub fn with_transport(config: TransferConfig, transport: T) -> Self {
        Self {
            transport,
            config: config.normalized(TransferDefaults::UPLOAD),
            on_progress: None,
        }
    }

    /// Registers a callback receiving `(gateway_offset, file_size)`.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Sends windows of the file until the gateway returns an identifier.
    pub async fn run(&self) -> Result<UploadReport, UploadError> {
        let config = &self.config;
        if config.url.is_empty() {
            return Err(UploadError::InvalidConfig(
                "gateway url must not be empty".into(),
            ));
        }
        if config.path.as_os_str().is_empty() {
            return Err(UploadError::InvalidConfig(
                "source path must not be empty".into(),
            ));
        }

        let path = config.path.as_path();
        let deadline = Deadline::after(config.timeout);
        let policy = RetryPolicy::from_config(config);

        let file_md5 = md5_hex(path).await?;
        let mut file = File::open(path).await.map_err(|e| io_error(path, e))?;
        let file_size = file
            .metadata()
            .await
            .map_err(|e| io_error(path, e))?
            .len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut session = UploadSession::new(file_size, file_name, file_md5);
        let endpoint = endpoint(&config.url);
        let mut chunks_sent = 0u64;
        let mut resyncs = 0u32;

        info!(
            endpoint = %endpoint,
            file = %session.file_name,
            size = file_size,
            md5 = %session.file_md5,
            chunk_size = config.chunk_size,
            "starting upload"
        );

        while session.remote_id.is_none() {
            let offset = session.offset;
            let len = session.window_len(config.chunk_size);
            let window = read_window(&mut file, offset, len)
                .await
                .map_err(|e| io_error(path, e))?;
            let meta = ChunkUpload {
                offset,
                file_size,
                file_name: &session.file_name,
                file_md5: &session.file_md5,
                auth_token: &config.auth_token,
            };
            debug!(offset, len, "sending window");

            let reply = run_with_retry(policy, deadline, |_| {
                send_chunk(&self.transport, &endpoint, &meta, window.clone())
            })
            .await
            .map_err(|failure| match failure {
                RetryFailure::Fatal(e) => e,
                RetryFailure::Exhausted { attempts, last } => UploadError::RetriesExhausted {
                    offset,
                    attempts,
                    source: Box::new(last),
                },
                RetryFailure::DeadlineExceeded { attempts, .. } => {
                    UploadError::DeadlineExceeded { offset, attempts }
                }
            })?;
            chunks_sent += 1;

            match transition(&reply, file_size)? {
                UploadState::Sending(next) => {
                    // A success that does not move the offset forward stalls the
                    // loop just like a resync and counts against the same cap.
                    let resync = reply.status() == GatewayCode::Resync;
                    if resync || next <= offset {
                        resyncs += 1;
                        if resync {
                            warn!(from = offset, to = next, resyncs, "gateway requested resync");
                        } else {
                            warn!(offset, next, resyncs, "gateway acknowledged without progress");
                        }
                        if let Some(limit) = config.max_resyncs {
                            if resyncs > limit {
                                return Err(UploadError::TooManyResyncs {
                                    limit,
                                    offset: next,
                                });
                            }
                        }
                    }
                    session.offset = next;
                    self.report_progress(next, file_size);
                }
                UploadState::Done(id) => {
                    session.remote_id = Some(id);
                }
                UploadState::Failed { code, message } => {
                    return Err(UploadError::Gateway {
                        offset,
                        code,
                        message,
                    });
                }
            }
        }

        let id = session.remote_id.unwrap_or_default();
        self.report_progress(file_size, file_size);
        info!(id = %id, chunks_sent, resyncs, "upload complete");
        Ok(UploadReport {
            id,
            file_size,
            file_md5: session.file_md5,
            chunks_sent,
            resyncs,
        })
    }

    fn report_progress(&self, done: u64, total: u64) {
        if let Some(callback) = &self.on_progress {
            callback(done, total);
        }
    }
}

/// Uploads `config.path` to the gateway at `config.url` with a fresh HTTP client.
pub async fn upload_file(config: TransferConfig) -> Result<UploadReport, UploadError> {
    Uploader::new(config)?.run().await
}

fn io_error(path: &Path, source: std::io::Error) -> UploadError {
    UploadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads exactly `len` bytes at `offset`.
async fn read_window(file: &mut File, offset: u64, len: u64) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf).await?;
    if (buf.len() as u64) < len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("source shrank below offset {}", offset + buf.len() as u64),
        ));
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{pattern, FakeTransport};
    use crate::transport::{Request, Response, TransportError};
    use md5::{Digest, Md5};
    use reqwest::StatusCode;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;

    fn reply(code: i64, file_index: i64, id: &str) -> Response {
        let body = serde_json::json!({
            "code": code,
            "message": if code == 200 { "ok" } else { "see fileIndex" },
            "fileIndex": file_index,
            "id": id,
        });
        FakeTransport::reply(StatusCode::OK, &[], body.to_string().as_bytes())
    }

    fn start_of(req: &Request) -> i64 {
        req.header_str("FileStartIndex").unwrap().parse().unwrap()
    }

    fn body_len(req: &Request) -> i64 {
        req.body.as_ref().map_or(0, |b| b.len() as i64)
    }

    /// A cooperative gateway: advances past every window and finishes at EOF.
    fn accept(req: &Request) -> Response {
        let size: i64 = req.header_str("FileSize").unwrap().parse().unwrap();
        let next = start_of(req) + body_len(req);
        if next >= size {
            reply(200, size, "obj-1")
        } else {
            reply(200, next, "")
        }
    }

    async fn source(dir: &Path, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let path = dir.join("source.bin");
        let data = pattern(len);
        tokio::fs::write(&path, &data).await.unwrap();
        (path, data)
    }

    fn config(path: &Path) -> TransferConfig {
        TransferConfig::new("http://gw", path)
            .with_auth_token("tok")
            .with_backoff(Duration::from_millis(1))
    }

    #[test]
    fn transition_table() {
        let r = |code, file_index, id: &str| GatewayReply {
            code,
            message: "m".into(),
            file_index,
            id: id.into(),
        };
        assert_eq!(transition(&r(200, 0, "abc"), 10).unwrap(), UploadState::Done("abc".into()));
        assert_eq!(transition(&r(200, 6, ""), 10).unwrap(), UploadState::Sending(6));
        assert_eq!(transition(&r(7, 2, "ignored"), 10).unwrap(), UploadState::Sending(2));
        assert_eq!(
            transition(&r(500, 0, ""), 10).unwrap(),
            UploadState::Failed {
                code: 500,
                message: "m".into()
            }
        );
        assert!(matches!(
            transition(&r(7, 11, ""), 10),
            Err(UploadError::OffsetOutOfRange { reported: 11, file_size: 10 })
        ));
        assert!(matches!(
            transition(&r(200, -1, ""), 10),
            Err(UploadError::OffsetOutOfRange { reported: -1, .. })
        ));
    }

    #[tokio::test]
    async fn resync_rereads_from_the_corrected_offset() {
        let dir = tempdir().unwrap();
        let (path, data) = source(dir.path(), 5_000_000).await;
        let transport = FakeTransport::new(|req, index| {
            Ok(match index {
                0 => reply(7, 1_500_000, ""),
                _ => accept(req),
            })
        });

        let report = Uploader::with_transport(config(&path).with_chunk_size(2_000_000), transport.clone())
            .run()
            .await
            .unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].header_str("FileStartIndex"), Some("0"));
        assert_eq!(requests[1].header_str("FileStartIndex"), Some("1500000"));
        assert_eq!(
            requests[1].body.as_deref(),
            Some(&data[1_500_000..3_500_000])
        );
        assert_eq!(requests[2].header_str("FileStartIndex"), Some("3500000"));
        assert_eq!(requests[2].body.as_ref().unwrap().len(), 1_500_000);

        let md5 = format!("{:x}", Md5::digest(&data));
        assert!(requests
            .iter()
            .all(|r| r.header_str("FileMd5") == Some(md5.as_str())));
        assert!(requests
            .iter()
            .all(|r| r.header_str("FileName") == Some("source.bin")));
        assert_eq!(report.id, "obj-1");
        assert_eq!(report.resyncs, 1);
        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.file_md5, md5);
    }

    #[tokio::test]
    async fn resync_may_rewind_behind_sent_bytes() {
        let dir = tempdir().unwrap();
        let (path, data) = source(dir.path(), 10_000).await;
        let transport = FakeTransport::new(|req, index| {
            Ok(match index {
                1 => reply(7, 0, ""),
                _ => accept(req),
            })
        });

        Uploader::with_transport(config(&path).with_chunk_size(4_000), transport.clone())
            .run()
            .await
            .unwrap();

        let starts: Vec<i64> = transport.requests().iter().map(start_of).collect();
        assert_eq!(starts, vec![0, 4_000, 0, 4_000, 8_000]);
        assert_eq!(
            transport.requests()[2].body.as_deref(),
            Some(&data[..4_000])
        );
    }

    #[tokio::test]
    async fn unknown_code_is_fatal() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 1_000).await;
        let transport = FakeTransport::new(|_, _| {
            let body = br#"{"code":403,"message":"quota exceeded","fileIndex":0}"#;
            Ok(FakeTransport::reply(StatusCode::OK, &[], body))
        });

        let err = Uploader::with_transport(config(&path), transport.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Gateway { code: 403, offset: 0, ref message } if message == "quota exceeded"
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn http_failures_are_retried() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 1_000).await;
        let transport = FakeTransport::new(|req, index| match index {
            0 => Ok(FakeTransport::reply(StatusCode::BAD_GATEWAY, &[], b"")),
            1 => Err(TransportError::Connection("reset".into())),
            _ => Ok(accept(req)),
        });

        let report = Uploader::with_transport(config(&path), transport.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(report.chunks_sent, 1);
    }

    #[tokio::test]
    async fn persistent_http_failure_exhausts_retries() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 1_000).await;
        let transport = FakeTransport::new(|_, _| {
            Ok(FakeTransport::reply(StatusCode::SERVICE_UNAVAILABLE, &[], b""))
        });

        let err = Uploader::with_transport(config(&path).with_max_retries(1), transport.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::RetriesExhausted { offset: 0, attempts: 2, .. }
        ));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn offset_outside_the_file_is_rejected() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 1_000).await;
        let transport = FakeTransport::new(|_, _| Ok(reply(200, 5_000, "")));

        let err = Uploader::with_transport(config(&path), transport)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::OffsetOutOfRange { reported: 5_000, file_size: 1_000 }
        ));
    }

    #[tokio::test]
    async fn resync_cap_stops_a_looping_gateway() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 1_000).await;
        let transport = FakeTransport::new(|_, _| Ok(reply(7, 0, "")));

        let err = Uploader::with_transport(config(&path).with_max_resyncs(3), transport.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooManyResyncs { limit: 3, offset: 0 }));
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn stalled_acknowledgements_count_against_the_cap() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 1_000).await;
        let transport = FakeTransport::new(|_, _| Ok(reply(200, 0, "")));

        let err = Uploader::with_transport(config(&path).with_max_resyncs(2), transport.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooManyResyncs { limit: 2, offset: 0 }));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn end_of_file_without_an_id_counts_against_the_cap() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 1_000).await;
        let transport = FakeTransport::new(|_, _| Ok(reply(200, 1_000, "")));

        let err = Uploader::with_transport(config(&path).with_max_resyncs(1), transport.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::TooManyResyncs { limit: 1, offset: 1_000 }
        ));
        let starts: Vec<i64> = transport.requests().iter().map(start_of).collect();
        assert_eq!(starts, vec![0, 1_000, 1_000]);
        assert!(transport.requests()[1].body.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_file_sends_one_empty_window() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 0).await;
        let transport = FakeTransport::new(|req, _| Ok(accept(req)));

        let report = Uploader::with_transport(config(&path), transport.clone())
            .run()
            .await
            .unwrap();
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header_str("FileSize"), Some("0"));
        assert_eq!(requests[0].body.as_deref(), Some(&b""[..]));
        assert_eq!(report.file_md5, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn auth_header_is_sent_even_when_empty() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 10).await;
        let transport = FakeTransport::new(|req, _| Ok(accept(req)));

        Uploader::with_transport(config(&path).with_auth_token(""), transport.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(transport.requests()[0].header_str("AuthToken"), Some(""));
    }

    #[tokio::test]
    async fn missing_source_fails_before_any_request() {
        let dir = tempdir().unwrap();
        let transport = FakeTransport::new(|req, _| Ok(accept(req)));

        let err = Uploader::with_transport(config(&dir.path().join("absent")), transport.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn deadline_stops_the_retry_loop() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 100).await;
        let transport =
            FakeTransport::new(|_, _| Err(TransportError::Connection("refused".into())));

        let config = config(&path)
            .with_timeout(Duration::from_millis(100))
            .with_backoff(Duration::from_secs(30))
            .with_max_retries(10);
        let err = Uploader::with_transport(config, transport.clone())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::DeadlineExceeded { offset: 0, attempts: 1 }
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn progress_follows_the_gateway_offset() {
        let dir = tempdir().unwrap();
        let (path, _) = source(dir.path(), 10_000).await;
        let transport = FakeTransport::new(|req, index| {
            Ok(match index {
                1 => reply(7, 2_000, ""),
                _ => accept(req),
            })
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        Uploader::with_transport(config(&path).with_chunk_size(4_000), transport)
            .on_progress(Box::new(move |done: u64, total: u64| {
                sink.lock().unwrap().push((done, total))
            }))
            .run()
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (4_000, 10_000),
                (2_000, 10_000),
                (6_000, 10_000),
                (10_000, 10_000),
            ]
        );
    }
}
