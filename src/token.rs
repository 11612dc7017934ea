// src/token.rs

//! Authorization token issuance.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::models::GatewayCode;
use crate::transport::{Request, Transport, TransportError};

/// Path of the token endpoint below the gateway address.
pub const TOKEN_PATH: &str = "/u/createToken";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("network error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed token exchange: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token request returned HTTP status {0}")]
    Status(u16),
    #[error("create token failed (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

/// Credentials exchanged for a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub account: String,
    pub api_key: String,
    /// Token lifetime as understood by the gateway.
    pub expire_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenReply {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: String,
}

/// Asks the gateway for a token and returns it.
pub async fn create_token<T: Transport>(
    transport: &T,
    gateway: &str,
    credentials: &TokenRequest,
) -> Result<String, TokenError> {
    let url = format!("{}{}", gateway.trim_end_matches('/'), TOKEN_PATH);
    let request = Request::new(Method::POST, url)
        .header(CONTENT_TYPE.as_str(), "application/json")?
        .body(serde_json::to_vec(credentials)?);

    let response = transport.send(request).await?;
    if response.status != StatusCode::OK {
        return Err(TokenError::Status(response.status.as_u16()));
    }
    let reply: TokenReply = serde_json::from_slice(&response.bytes().await?)?;
    if reply.code != GatewayCode::SUCCESS {
        return Err(TokenError::Rejected {
            code: reply.code,
            message: reply.message,
        });
    }

    info!(account = %credentials.account, "token issued");
    Ok(reply.data)
}
