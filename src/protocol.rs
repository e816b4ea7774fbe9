//! License acquisition protocol.
//!
//! Drives one CDM session through challenge generation, the license exchange
//! and key installation. The protocol holds no per-session state; the caller
//! serializes acquisitions per slot.
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::cdm::{is_hdcp_error, Challenge, CdmSession, OutputProtection};
use crate::config::DrmConfig;
use crate::error::{Error, Result};
use crate::helper::{DrmHelper, LicenseMethod, LicenseRequest};
use crate::session::{MediaType, SessionState, SlotIndex};
use crate::token::TokenCache;
use crate::transport::{
    AbortSignal, LicenseTransport, TransportFailure, TransportResponse, HTTP_PRECONDITION_FAILED,
    SECMANAGER_DRM_FAILURE, SECMANAGER_ENTITLEMENT_FAILURE, SECMANAGER_SERVICE_TIMEOUT,
};

/// Status reported for a license request that could not connect.
pub const STATUS_COULD_NOT_CONNECT: i32 = 7;
/// Status reported for any other transport failure.
pub const STATUS_TRANSPORT_ERROR: i32 = 0;

#[derive(Debug, Deserialize)]
struct LicenseEnvelope {
    license: String,
}

/// Extract the license from a `{"license": "<base64>"}` envelope.
///
/// Bodies that are not such an envelope are returned unchanged.
pub fn unwrap_license_envelope(body: Vec<u8>) -> Vec<u8> {
    let envelope: LicenseEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Failed to parse JSON license response: {}", e);
            return body;
        }
    };
    match base64::engine::general_purpose::STANDARD.decode(envelope.license) {
        Ok(license) => license,
        Err(e) => {
            warn!("Unable to retrieve license from JSON response: {}", e);
            body
        }
    }
}

/// Wrap a challenge as `{"licenseChallenge": "<base64>"}`.
pub fn wrap_license_challenge(challenge: &[u8]) -> Vec<u8> {
    serde_json::json!({
        "licenseChallenge": base64::engine::general_purpose::STANDARD.encode(challenge),
    })
    .to_string()
    .into_bytes()
}

/// Map an unsuccessful license exchange to a failure.
pub fn classify_failure(response: &TransportResponse) -> Error {
    match response {
        TransportResponse::Failed(TransportFailure::TimedOut) => Error::LicenceTimeout,
        TransportResponse::Failed(TransportFailure::Aborted) => Error::SelfAbort,
        TransportResponse::Failed(TransportFailure::ConnectionRefused) => {
            Error::LicenceRequestFailed {
                status: STATUS_COULD_NOT_CONNECT,
                extended_status: None,
            }
        }
        TransportResponse::Failed(TransportFailure::Other(_)) => Error::LicenceRequestFailed {
            status: STATUS_TRANSPORT_ERROR,
            extended_status: None,
        },
        TransportResponse::Completed {
            status: SECMANAGER_DRM_FAILURE,
            extended_status: Some(SECMANAGER_ENTITLEMENT_FAILURE),
            ..
        } => Error::AuthorizationFailed {
            status: SECMANAGER_DRM_FAILURE,
            extended_status: Some(SECMANAGER_ENTITLEMENT_FAILURE),
        },
        TransportResponse::Completed {
            status: SECMANAGER_DRM_FAILURE,
            extended_status: Some(SECMANAGER_SERVICE_TIMEOUT),
            ..
        } => Error::LicenceTimeout,
        TransportResponse::Completed {
            status: HTTP_PRECONDITION_FAILED,
            extended_status,
            ..
        } => Error::AuthorizationFailed {
            status: HTTP_PRECONDITION_FAILED,
            extended_status: *extended_status,
        },
        TransportResponse::Completed {
            status,
            extended_status,
            ..
        } => Error::LicenceRequestFailed {
            status: *status,
            extended_status: *extended_status,
        },
    }
}

/// Executes license acquisitions against the configured transport.
pub struct LicenseProtocol {
    config: DrmConfig,
    transport: Arc<dyn LicenseTransport>,
    tokens: TokenCache,
    output_protection: Arc<dyn OutputProtection>,
    abort: Arc<AbortSignal>,
}

impl LicenseProtocol {
    pub fn new(
        config: DrmConfig,
        transport: Arc<dyn LicenseTransport>,
        tokens: TokenCache,
        output_protection: Arc<dyn OutputProtection>,
        abort: Arc<AbortSignal>,
    ) -> Self {
        Self {
            config,
            transport,
            tokens,
            output_protection,
            abort,
        }
    }

    pub fn config(&self) -> &DrmConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    pub fn abort_signal(&self) -> &Arc<AbortSignal> {
        &self.abort
    }

    /// Acquire (or renew) the license for `session`.
    ///
    /// Returns [`SessionState::Ready`], or [`SessionState::Pending`] for
    /// externally licensed systems whose keys arrive out-of-band.
    pub fn acquire_license(
        &self,
        helper: &dyn DrmHelper,
        session: &dyn CdmSession,
        slot: SlotIndex,
        media_type: MediaType,
        is_renewal: bool,
    ) -> Result<SessionState> {
        if helper.is_external_license() && !is_renewal {
            debug!("External license for {} at slot {}", helper.friendly_name(), slot);
            return Ok(SessionState::Pending);
        }

        let started = Instant::now();
        info!("Request to generate license challenge for {} at slot {}", media_type, slot);
        let challenge = session.generate_challenge(helper.license_generate_timeout());
        let state = session.state();
        if state != SessionState::Pending {
            error!("Error in getting license challenge: key state {}", state);
            return Err(Error::ChallengeFailed);
        }
        let challenge = challenge.unwrap_or_default();
        let challenge_elapsed = started.elapsed();

        let network_started = Instant::now();
        let license = self.exchange_challenge(helper, &challenge)?;
        let network_elapsed = network_started.elapsed();

        let install_started = Instant::now();
        let state = self.process_license_response(helper, session, &license)?;
        if !is_renewal {
            info!(
                "License acquired for {} at slot {} (challenge {:?}, network {:?}, install {:?})",
                media_type,
                slot,
                challenge_elapsed,
                network_elapsed,
                install_started.elapsed()
            );
        }
        Ok(state)
    }

    /// Trade a CDM challenge for a license.
    ///
    /// Resolves the access token for metadata requests, shapes the request,
    /// sends it with retries and a single token refresh, and unwraps the
    /// response. The license is returned without being installed.
    pub fn exchange_challenge(&self, helper: &dyn DrmHelper, challenge: &Challenge) -> Result<Vec<u8>> {
        let metadata = helper.drm_metadata().filter(|m| !m.is_empty());
        let app_token = self.config.app_access_token();
        let access_token = if metadata.is_some() && !self.config.anonymous_license_request {
            Some(self.resolve_access_token(app_token)?)
        } else {
            None
        };

        if self.abort.is_aborted() {
            error!("License request was aborted");
            return Err(Error::SelfAbort);
        }

        let mut request = self.build_request(helper, challenge, metadata, access_token)?;
        info!("Request license from the DRM server {}", request.url);

        let mut response = self.get_license(&request);
        if metadata.is_some() && app_token.is_none() && response.is_token_expired() {
            info!("License request failed with an expired access token, refreshing");
            match self.tokens.refresh() {
                Ok(token) => {
                    request.access_token = Some(token);
                    response = self.get_license(&request);
                }
                Err(e) => warn!("Failed to refresh access token: {}", e),
            }
        }

        self.handle_license_response(helper, response, metadata.is_some())
    }

    fn resolve_access_token(&self, app_token: Option<&str>) -> Result<String> {
        if let Some(token) = app_token {
            info!("Using access token from the application");
            return Ok(token.to_string());
        }
        match self.tokens.get() {
            Ok(token) => {
                info!("Access token is available");
                Ok(token)
            }
            Err(_) if self.abort.is_aborted() => Err(Error::SelfAbort),
            Err(e) => {
                warn!("Failed to get access token, anonymous request not enabled");
                Err(e)
            }
        }
    }

    fn build_request(
        &self,
        helper: &dyn DrmHelper,
        challenge: &Challenge,
        metadata: Option<&str>,
        access_token: Option<String>,
    ) -> Result<LicenseRequest> {
        let system = helper.system_id();
        let mut request = LicenseRequest::new(system);
        if let Some(url) = self.config.license_server_url(system) {
            request.url = url.to_string();
        }
        request.anonymous = self.config.anonymous_license_request;
        helper.generate_license_request(challenge, &mut request);

        if request.method == LicenseMethod::Post && request.payload.is_empty() {
            error!("License challenge was not generated by the CDM");
            return Err(Error::ChallengeFailed);
        }

        for (name, values) in &self.config.custom_license_headers {
            request.headers.insert(name.clone(), values.clone());
        }
        if let Some(metadata) = metadata {
            if self.config.custom_license_headers.is_empty() {
                request.headers.clear();
            }
            if let Some(accept) = self.config.accept_header.as_ref() {
                request.headers.insert("Accept".to_string(), vec![accept.clone()]);
            }
            if let Some(content_type) = self.config.content_type_header.as_ref() {
                request
                    .headers
                    .insert("Content-Type".to_string(), vec![content_type.clone()]);
            }
            request.content_metadata = Some(metadata.to_string());
            request.access_token = access_token;
        } else if self.config.base64_license_wrapping && request.method == LicenseMethod::Post {
            request.payload = wrap_license_challenge(&request.payload);
        }
        if let Some(user_agent) = self.config.user_agent.as_ref() {
            request
                .headers
                .insert("User-Agent".to_string(), vec![user_agent.clone()]);
        }
        Ok(request)
    }

    /// Send `request`, retrying transient failures and 5xx responses.
    pub fn get_license(&self, request: &LicenseRequest) -> TransportResponse {
        let attempts = self.config.max_license_request_attempts.max(1);
        let mut response = TransportResponse::Failed(TransportFailure::Aborted);
        for attempt in 1..=attempts {
            if self.abort.is_aborted() {
                return TransportResponse::Failed(TransportFailure::Aborted);
            }
            response = self.transport.send(request, &self.abort);
            if self.abort.is_aborted() {
                error!("Aborting license acquisition");
                return TransportResponse::Failed(TransportFailure::Aborted);
            }
            if response.is_success() {
                info!("License request succeeded on attempt {}", attempt);
                return response;
            }

            let retry = match &response {
                TransportResponse::Failed(failure) => failure.is_transient(),
                other => other.is_server_error(),
            };
            error!(
                "License request failed on attempt {}/{}: {:?}",
                attempt,
                attempts,
                summarize(&response)
            );
            if !retry || attempt == attempts {
                break;
            }
            let wait = self.config.license_retry_wait();
            warn!("Sleeping {:?} before next license request attempt", wait);
            if !self.abort.sleep(wait) {
                return TransportResponse::Failed(TransportFailure::Aborted);
            }
        }
        response
    }

    fn handle_license_response(
        &self,
        helper: &dyn DrmHelper,
        response: TransportResponse,
        has_metadata: bool,
    ) -> Result<Vec<u8>> {
        let body = match response {
            TransportResponse::Completed { ref body, .. }
                if response.is_success() && !body.is_empty() =>
            {
                body.clone()
            }
            other => {
                error!("Invalid license response was provided by the server");
                return Err(classify_failure(&other));
            }
        };

        let license = if has_metadata || self.config.base64_license_wrapping {
            unwrap_license_envelope(body)
        } else {
            body
        };
        info!("License acquisition completed");
        Ok(helper.transform_license_response(license))
    }

    fn process_license_response(
        &self,
        helper: &dyn DrmHelper,
        session: &dyn CdmSession,
        license: &[u8],
    ) -> Result<SessionState> {
        if license.is_empty() {
            return Err(Error::InvalidKey);
        }
        let cdm_error = session.install_key(license, helper.key_process_timeout());
        match session.state() {
            SessionState::Ready => {
                if !self.output_protection.is_output_compliant(helper) {
                    error!("Output is not HDCP compliant");
                    return Err(Error::HdcpComplianceError);
                }
                Ok(SessionState::Ready)
            }
            SessionState::Pending => {
                error!("Failed to get DRM keys");
                Err(Error::InvalidKey)
            }
            _ if is_hdcp_error(cdm_error) => Err(Error::HdcpComplianceError),
            _ => Err(Error::KeyUpdateFailed { cdm_error }),
        }
    }
}

fn summarize(response: &TransportResponse) -> String {
    match response {
        TransportResponse::Completed {
            status,
            extended_status,
            ..
        } => format!("status {} extended {:?}", status, extended_status),
        TransportResponse::Failed(failure) => format!("{:?}", failure),
    }
}
