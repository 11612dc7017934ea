// src/fake.rs

//! In-memory [`Transport`] for unit tests.

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::sync::{Arc, Mutex};

use crate::transport::{BodyStream, Request, Response, Transport, TransportError};

const PIECE: usize = 64 * 1024;

type Handler = dyn Fn(&Request, usize) -> Result<Response, TransportError> + Send + Sync;

/// Records every request and answers with a handler that also receives the
/// zero-based call index.
#[derive(Clone)]
pub(crate) struct FakeTransport {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Request, usize) -> Result<Response, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A well-behaved file server honoring `Range` requests.
    pub fn serving(data: Vec<u8>) -> Self {
        let data = Arc::new(data);
        Self::new(move |req, _| Ok(serve(&data, req, true)))
    }

    /// A file server advertising `Accept-Ranges: none` and ignoring `Range`.
    pub fn serving_without_ranges(data: Vec<u8>) -> Self {
        let data = Arc::new(data);
        Self::new(move |req, _| Ok(serve(&data, req, false)))
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// `Range` headers of every GET, in order.
    pub fn ranges(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter(|r| r.method == Method::GET)
            .filter_map(|r| r.header_str("range").map(str::to_string))
            .collect()
    }

    pub fn reply(status: StatusCode, headers: &[(&str, &str)], body: &[u8]) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Response {
            status,
            headers: map,
            body: body_of(Bytes::copy_from_slice(body)),
        }
    }
}

impl Transport for FakeTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        (self.handler)(&request, index)
    }
}

/// Splits a body into pieces the way a socket would deliver it.
pub(crate) fn body_of(bytes: Bytes) -> BodyStream {
    let mut pieces = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + PIECE).min(bytes.len());
        pieces.push(Ok(bytes.slice(offset..end)));
        offset = end;
    }
    stream::iter(pieces).boxed()
}

/// A body that delivers `bytes` and then drops the connection.
pub(crate) fn broken_body(bytes: Bytes) -> BodyStream {
    body_of(bytes)
        .chain(stream::iter(vec![Err(TransportError::Connection(
            "connection reset".into(),
        ))]))
        .boxed()
}

pub(crate) fn parse_range(header: &str) -> Option<(u64, u64)> {
    let (start, end) = header.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Answers HEAD and GET for `data` like a static file server.
pub(crate) fn serve(data: &[u8], req: &Request, ranges: bool) -> Response {
    let total = data.len().to_string();
    let accept = if ranges { "bytes" } else { "none" };
    if req.method == Method::HEAD {
        return FakeTransport::reply(
            StatusCode::OK,
            &[("content-length", &total), ("accept-ranges", accept)],
            b"",
        );
    }
    match req.header_str("range").and_then(parse_range) {
        Some((start, end)) if ranges && (start as usize) < data.len() => {
            let end = (end as usize).min(data.len() - 1);
            let content_range = format!("bytes {}-{}/{}", start, end, data.len());
            FakeTransport::reply(
                StatusCode::PARTIAL_CONTENT,
                &[("content-range", &content_range)],
                &data[start as usize..=end],
            )
        }
        _ => FakeTransport::reply(StatusCode::OK, &[("content-length", &total)], data),
    }
}

/// Deterministic non-trivial test payload.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
