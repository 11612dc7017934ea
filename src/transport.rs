// src/transport.rs

//! The HTTP seam every engine talks through.
//!
//! Orchestrators own a value implementing [`Transport`] instead of reaching
//! for a process-wide client, so tests can substitute an in-memory server.

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header carrying the gateway authorization token.
pub const AUTH_TOKEN: &str = "AuthToken";

const USER_AGENT: &str = concat!("gateway-transfer/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised below the protocol layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
}

/// Streaming response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A request as seen by the transport.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Adds a header, rejecting values that cannot be sent on the wire.
    ///
    /// Non-ASCII bytes are passed through as-is so UTF-8 file names survive.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, TransportError> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            TransportError::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        let header_value = HeaderValue::from_bytes(value.as_bytes()).map_err(|e| {
            TransportError::InvalidHeader {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Adds the `AuthToken` header unless the token is empty.
    pub fn auth(self, token: &str) -> Result<Self, TransportError> {
        if token.is_empty() {
            Ok(self)
        } else {
            self.header(AUTH_TOKEN, token)
        }
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A response whose body has not been read yet.
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Drains the body into memory.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Sends one request and hands back the response head with a lazy body.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send {
        (**self).send(request)
    }
}

/// [`Transport`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds a client with the crate's user agent and connect timeout.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an already configured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        debug!(method = %request.method, url = %request.url, "sending request");
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes_stream().map_err(TransportError::from).boxed();
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
