//! Access token service client and cache.
//!
//! Content-metadata license requests carry a session token obtained from a
//! local auth service. The token is cached until the license server reports
//! it expired.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::{Client, ClientBuilder};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::DrmConfig;
use crate::error::{Error, Result};

/// Default access token service endpoint.
pub const DEFAULT_SESSION_TOKEN_URL: &str = "http://localhost:50050/authService/getSessionToken";

/// Token error code: the reply had a valid status but no token.
pub const TOKEN_PARSE_ERROR: i32 = -1;
/// Token error code: the reply status was missing or non-zero.
pub const TOKEN_INVALID_STATUS_CODE: i32 = -2;
/// Token error code: the token service timed out.
pub const TOKEN_TIMED_OUT: i32 = 28;
/// Token error code: the token service could not be reached.
pub const TOKEN_COULD_NOT_CONNECT: i32 = 7;

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of access tokens.
pub trait AccessTokenProvider: Send + Sync {
    /// Fetch a fresh token.
    ///
    /// Fails with [`Error::AccessTokenUnavailable`] carrying the token error code.
    fn fetch(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    status: Option<i64>,
    token: Option<String>,
}

/// Parse an auth service reply of the form `{"status":0,"token":"..."}`.
pub fn parse_token_reply(reply: &str) -> Result<String> {
    let parsed: TokenReply = serde_json::from_str(reply).map_err(|e| {
        error!("Missing or invalid status code in session token reply: {}", e);
        Error::AccessTokenUnavailable {
            code: TOKEN_INVALID_STATUS_CODE,
        }
    })?;
    if parsed.status != Some(0) {
        error!("Missing or invalid status code in session token reply");
        return Err(Error::AccessTokenUnavailable {
            code: TOKEN_INVALID_STATUS_CODE,
        });
    }
    match parsed.token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => {
            warn!("Could not get access token from session token reply");
            Err(Error::AccessTokenUnavailable {
                code: TOKEN_PARSE_ERROR,
            })
        }
    }
}

/// Token provider backed by the HTTP auth service.
#[derive(Debug, Clone)]
pub struct HttpAccessTokenProvider {
    client: Client,
    url: String,
}

impl HttpAccessTokenProvider {
    pub fn new(config: &DrmConfig) -> Result<Self> {
        Self::with_builder(config, Client::builder())
    }

    fn with_builder(config: &DrmConfig, builder: ClientBuilder) -> Result<Self> {
        let client = builder
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!config.ssl_verify_peer)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.session_token_url.clone(),
        })
    }
}

impl AccessTokenProvider for HttpAccessTokenProvider {
    fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().map_err(|e| {
            error!("Get session token call failed: {}", e);
            let code = if e.is_timeout() {
                TOKEN_TIMED_OUT
            } else if e.is_connect() {
                TOKEN_COULD_NOT_CONNECT
            } else {
                TOKEN_INVALID_STATUS_CODE
            };
            Error::AccessTokenUnavailable { code }
        })?;

        let status = response.status().as_u16();
        if status != 200 && status != 206 {
            error!("Get session token call failed with http error {}", status);
            return Err(Error::AccessTokenUnavailable {
                code: i32::from(status),
            });
        }

        let reply = response.text()?;
        let token = parse_token_reply(&reply)?;
        info!("Received session token from auth service");
        Ok(token)
    }
}

/// Cached access token shared by all acquisitions.
pub struct TokenCache {
    provider: Arc<dyn AccessTokenProvider>,
    token: Mutex<Option<String>>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            provider,
            token: Mutex::new(None),
        }
    }

    /// Cached token, fetching one if none is cached.
    ///
    /// The lock is held across the fetch so concurrent acquisitions share a
    /// single token request.
    pub fn get(&self) -> Result<String> {
        let mut token = self.token.lock();
        if let Some(cached) = token.as_ref() {
            return Ok(cached.clone());
        }
        let fetched = self.provider.fetch()?;
        *token = Some(fetched.clone());
        Ok(fetched)
    }

    /// Drop the cached token and fetch a new one.
    pub fn refresh(&self) -> Result<String> {
        self.clear();
        self.get()
    }

    pub fn clear(&self) {
        self.token.lock().take();
    }

    pub fn is_cached(&self) -> bool {
        self.token.lock().is_some()
    }
}
