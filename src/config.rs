//! DRM engine configuration.
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid configuration.
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::helper::SystemId;
use crate::token::DEFAULT_SESSION_TOKEN_URL;

/// Which [`LicenseTransport`](crate::transport::LicenseTransport) to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Wrapped,
}

/// Configuration for the session manager, the acquisition protocol and the
/// prefetcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrmConfig {
    /// Number of session slots.
    pub max_sessions: usize,
    /// Attempt ceiling for one license request.
    pub max_license_request_attempts: u32,
    /// Delay between license request attempts.
    pub license_retry_wait_ms: u64,
    pub drm_network_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub ssl_verify_peer: bool,
    /// Token failures are not fatal when set.
    pub anonymous_license_request: bool,
    /// Wrap the challenge as `{"licenseChallenge": b64}` and unwrap
    /// `{"license": b64}` responses.
    pub base64_license_wrapping: bool,
    pub transport: TransportKind,
    /// License server URL per DRM system (`widevine`, `playready`, ...).
    pub license_server_urls: HashMap<String, String>,
    pub license_proxy: Option<String>,
    /// Headers added to every license request.
    pub custom_license_headers: HashMap<String, Vec<String>>,
    pub accept_header: Option<String>,
    pub content_type_header: Option<String>,
    pub user_agent: Option<String>,
    pub session_token_url: String,
    /// Application-supplied access token.
    pub access_token: Option<String>,
    /// Custom data handed to the CDM with the init data.
    pub license_custom_data: Option<String>,
    /// VSS license deferral window in seconds.
    pub common_key_duration_s: u64,
    pub send_error_on_failure: bool,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2,
            max_license_request_attempts: 2,
            license_retry_wait_ms: 500,
            drm_network_timeout_ms: 5000,
            connect_timeout_ms: 3000,
            ssl_verify_peer: true,
            anonymous_license_request: false,
            base64_license_wrapping: false,
            transport: TransportKind::Http,
            license_server_urls: HashMap::new(),
            license_proxy: None,
            custom_license_headers: HashMap::new(),
            accept_header: None,
            content_type_header: None,
            user_agent: None,
            session_token_url: DEFAULT_SESSION_TOKEN_URL.to_string(),
            access_token: None,
            license_custom_data: None,
            common_key_duration_s: 0,
            send_error_on_failure: true,
        }
    }
}

impl DrmConfig {
    /// Load a configuration from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Parse a configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1".to_string()));
        }
        if self.max_license_request_attempts == 0 {
            return Err(Error::Config(
                "max_license_request_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured license server URL for a DRM system.
    pub fn license_server_url(&self, system: SystemId) -> Option<&str> {
        self.license_server_urls
            .get(&system.config_name())
            .map(String::as_str)
            .filter(|url| !url.is_empty())
    }

    pub fn license_retry_wait(&self) -> Duration {
        Duration::from_millis(self.license_retry_wait_ms)
    }

    /// Application-supplied access token, if any.
    pub fn app_access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }
}
