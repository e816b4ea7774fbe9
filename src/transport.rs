//! License transports.
//!
//! A [`LicenseTransport`] delivers a [`LicenseRequest`] to a license server
//! and reports what came back. Two implementations are provided and picked
//! from configuration: [`HttpLicenseTransport`] sends the challenge as-is,
//! [`WrappedLicenseTransport`] speaks a secure-client style JSON protocol
//! that carries content metadata and the access token.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::{Condvar, Mutex};
use reqwest::blocking::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{DrmConfig, TransportKind};
use crate::error::{Error, Result};
use crate::helper::{LicenseMethod, LicenseRequest};

/// Secure-client status: the DRM request failed.
pub const SECMANAGER_DRM_FAILURE: i32 = 200;
/// Secure-client reason: the license service timed out.
pub const SECMANAGER_SERVICE_TIMEOUT: i32 = 3;
/// Secure-client reason: the access token expired.
pub const SECMANAGER_ACCTOKEN_EXPIRED: i32 = 8;
/// Secure-client reason: the account is not entitled to the content.
pub const SECMANAGER_ENTITLEMENT_FAILURE: i32 = 102;

/// HTTP status returned by license servers for authorization failures.
pub const HTTP_PRECONDITION_FAILED: i32 = 412;
/// Extended status that accompanies a 412 when the access token expired.
pub const EXTENDED_STATUS_TOKEN_EXPIRED: i32 = 401;

/// Transport-level failure (no HTTP response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The operation timed out.
    TimedOut,
    /// The server could not be reached.
    ConnectionRefused,
    /// The request was aborted through the [`AbortSignal`].
    Aborted,
    Other(String),
}

impl TransportFailure {
    /// Transient failures are retried by the acquisition protocol.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportFailure::TimedOut | TransportFailure::ConnectionRefused)
    }
}

/// Result of one license request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResponse {
    Completed {
        /// HTTP status, or the secure-client status for wrapped requests.
        status: i32,
        /// Secure-client reason / extended status, if the server sent one.
        extended_status: Option<i32>,
        body: Vec<u8>,
    },
    Failed(TransportFailure),
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TransportResponse::Completed {
                status: 200 | 206,
                extended_status: None,
                ..
            }
        )
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, TransportResponse::Completed { status: 500..=599, .. })
    }

    /// Whether the server signalled an expired access token.
    pub fn is_token_expired(&self) -> bool {
        matches!(
            self,
            TransportResponse::Completed {
                status: HTTP_PRECONDITION_FAILED,
                extended_status: Some(EXTENDED_STATUS_TOKEN_EXPIRED),
                ..
            } | TransportResponse::Completed {
                status: SECMANAGER_DRM_FAILURE,
                extended_status: Some(SECMANAGER_ACCTOKEN_EXPIRED),
                ..
            }
        )
    }
}

/// Shared abort flag for in-flight license requests.
///
/// Also provides an interruptible sleep so retry delays end as soon as an
/// abort is raised.
#[derive(Debug, Default)]
pub struct AbortSignal {
    aborted: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Raise or clear the abort flag; raising wakes every sleeper.
    pub fn set(&self, aborted: bool) {
        let _guard = self.lock.lock();
        self.aborted.store(aborted, Ordering::SeqCst);
        if aborted {
            self.cond.notify_all();
        }
    }

    pub fn abort(&self) {
        self.set(true);
    }

    pub fn reset(&self) {
        self.set(false);
    }

    /// Sleep for `duration` unless aborted first.
    ///
    /// Returns `false` if the sleep ended because of an abort.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.lock.lock();
        while !self.is_aborted() {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        !self.is_aborted()
    }
}

/// Delivers license requests to a license server.
pub trait LicenseTransport: Send + Sync {
    fn send(&self, request: &LicenseRequest, abort: &AbortSignal) -> TransportResponse;
}

fn client_builder(config: &DrmConfig) -> Result<ClientBuilder> {
    let mut builder = Client::builder()
        .timeout(Duration::from_millis(config.drm_network_timeout_ms))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .danger_accept_invalid_certs(!config.ssl_verify_peer);
    if let Some(proxy) = config.license_proxy.as_deref() {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder)
}

fn build_client(builder: ClientBuilder) -> Result<Client> {
    builder
        .build()
        .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))
}

fn classify_error(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::TimedOut
    } else if err.is_connect() {
        TransportFailure::ConnectionRefused
    } else {
        TransportFailure::Other(err.to_string())
    }
}

fn read_response(response: reqwest::blocking::Response) -> TransportResponse {
    let status = i32::from(response.status().as_u16());
    match response.bytes() {
        Ok(body) => TransportResponse::Completed {
            status,
            extended_status: None,
            body: body.to_vec(),
        },
        Err(e) => TransportResponse::Failed(classify_error(&e)),
    }
}

/// Plain HTTP license transport: the payload is the request body and the
/// response body is the license.
#[derive(Debug, Clone)]
pub struct HttpLicenseTransport {
    client: Client,
}

impl HttpLicenseTransport {
    pub fn new(config: &DrmConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(client_builder(config)?)?,
        })
    }
}

impl LicenseTransport for HttpLicenseTransport {
    fn send(&self, request: &LicenseRequest, abort: &AbortSignal) -> TransportResponse {
        if abort.is_aborted() {
            return TransportResponse::Failed(TransportFailure::Aborted);
        }
        if request.access_token.is_some() {
            debug!("Plain HTTP transport ignores the access token");
        }

        let mut builder = match request.method {
            LicenseMethod::Post => self.client.post(&request.url).body(request.payload.clone()),
            LicenseMethod::Get => self.client.get(&request.url),
        };
        for (name, values) in &request.headers {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let result = builder.send();
        if abort.is_aborted() {
            return TransportResponse::Failed(TransportFailure::Aborted);
        }
        match result {
            Ok(response) => read_response(response),
            Err(e) => {
                warn!("License request to {} failed: {}", request.url, e);
                TransportResponse::Failed(classify_error(&e))
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WrappedLicenseBody<'a> {
    key_system: String,
    media_usage: &'a str,
    license_challenge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_metadata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WrappedErrorBody {
    status_code: i32,
    reason_code: i32,
}

/// Secure-client style transport.
///
/// Challenge and content metadata travel base64-encoded in a JSON body
/// together with the access token. Failures come back as a JSON
/// `{"statusCode": .., "reasonCode": ..}` body which is reported as the
/// status / extended status pair.
#[derive(Debug, Clone)]
pub struct WrappedLicenseTransport {
    client: Client,
}

impl WrappedLicenseTransport {
    pub fn new(config: &DrmConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(client_builder(config)?)?,
        })
    }
}

impl LicenseTransport for WrappedLicenseTransport {
    fn send(&self, request: &LicenseRequest, abort: &AbortSignal) -> TransportResponse {
        if abort.is_aborted() {
            return TransportResponse::Failed(TransportFailure::Aborted);
        }
        let engine = base64::engine::general_purpose::STANDARD;
        let body = WrappedLicenseBody {
            key_system: request.key_system.to_uuid().to_string(),
            media_usage: "stream",
            license_challenge: engine.encode(&request.payload),
            content_metadata: request.content_metadata.as_ref().map(|m| engine.encode(m)),
            access_token: request.access_token.as_deref(),
        };

        let mut builder = self.client.post(&request.url).json(&body);
        for (name, values) in &request.headers {
            if name.eq_ignore_ascii_case("content-type") {
                continue;
            }
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let result = builder.send();
        if abort.is_aborted() {
            return TransportResponse::Failed(TransportFailure::Aborted);
        }
        let response = match result {
            Ok(response) => read_response(response),
            Err(e) => {
                warn!("Secure license request to {} failed: {}", request.url, e);
                return TransportResponse::Failed(classify_error(&e));
            }
        };

        match response {
            TransportResponse::Completed { status, body, .. } if !(200..300).contains(&status) => {
                match serde_json::from_slice::<WrappedErrorBody>(&body) {
                    Ok(error) => TransportResponse::Completed {
                        status: error.status_code,
                        extended_status: Some(error.reason_code),
                        body: Vec::new(),
                    },
                    Err(_) => TransportResponse::Completed {
                        status,
                        extended_status: None,
                        body,
                    },
                }
            }
            other => other,
        }
    }
}

/// Create the transport selected by `config.transport`.
pub fn create_transport(config: &DrmConfig) -> Result<Arc<dyn LicenseTransport>> {
    Ok(match config.transport {
        TransportKind::Http => Arc::new(HttpLicenseTransport::new(config)?),
        TransportKind::Wrapped => Arc::new(WrappedLicenseTransport::new(config)?),
    })
}
