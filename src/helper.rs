//! DRM system helpers.
//!
//! A [`DrmHelper`] describes one content-protection record: which DRM system
//! it targets, the key identities it advertises, the init data to hand to the
//! CDM and how a license request is shaped for that system.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::cdm::Challenge;
use crate::error::Error;
use crate::session::KeyIdentity;

/// Default time allowed for the CDM to generate a license challenge.
pub const DEFAULT_LICENSE_GENERATE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default time allowed for the CDM to process a license response.
pub const DEFAULT_KEY_PROCESS_TIMEOUT: Duration = Duration::from_millis(5000);

/// Known DRM system IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemId {
    Widevine,
    PlayReady,
    ClearKey,
    Verimatrix,
    Other(Uuid),
}

impl SystemId {
    pub fn to_uuid(self) -> Uuid {
        match self {
            SystemId::Widevine => Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed),
            SystemId::PlayReady => Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95),
            SystemId::ClearKey => Uuid::from_u128(0x1077efecc0b24d02ace33c1e52e2fb4b),
            SystemId::Verimatrix => Uuid::from_u128(0x9a27dd82fde247258cbc4234aa06ec09),
            SystemId::Other(uuid) => uuid,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        [
            SystemId::Widevine,
            SystemId::PlayReady,
            SystemId::ClearKey,
            SystemId::Verimatrix,
        ]
        .into_iter()
        .find(|known| known.to_uuid() == uuid)
        .unwrap_or(SystemId::Other(uuid))
    }

    /// Name used for per-system configuration keys (license server URLs).
    pub fn config_name(self) -> String {
        match self {
            SystemId::Widevine => "widevine".to_string(),
            SystemId::PlayReady => "playready".to_string(),
            SystemId::ClearKey => "clearkey".to_string(),
            SystemId::Verimatrix => "verimatrix".to_string(),
            SystemId::Other(uuid) => uuid.to_string(),
        }
    }

    pub fn friendly_name(self) -> &'static str {
        match self {
            SystemId::Widevine => "Widevine",
            SystemId::PlayReady => "PlayReady",
            SystemId::ClearKey => "ClearKey",
            SystemId::Verimatrix => "Verimatrix",
            SystemId::Other(_) => "Unknown",
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.friendly_name(), self.to_uuid())
    }
}

impl FromStr for SystemId {
    type Err = Error;

    /// Parse a configuration name (`widevine`, `playready`, ...) or a system UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "widevine" => Ok(SystemId::Widevine),
            "playready" => Ok(SystemId::PlayReady),
            "clearkey" => Ok(SystemId::ClearKey),
            "verimatrix" => Ok(SystemId::Verimatrix),
            other => Uuid::parse_str(other)
                .map(SystemId::from_uuid)
                .map_err(|_| Error::Other(format!("Unknown DRM system '{}'", s))),
        }
    }
}

/// HTTP method of a license request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LicenseMethod {
    Get,
    #[default]
    Post,
}

/// A license request ready for a [`LicenseTransport`](crate::transport::LicenseTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequest {
    pub method: LicenseMethod,
    pub url: String,
    /// Header name to values.
    pub headers: BTreeMap<String, Vec<String>>,
    pub payload: Vec<u8>,
    /// Access token attached to content-metadata requests.
    pub access_token: Option<String>,
    /// Content metadata (secure-client requests only).
    pub content_metadata: Option<String>,
    pub key_system: SystemId,
    /// Whether the request is allowed to go out without an access token.
    pub anonymous: bool,
}

impl LicenseRequest {
    pub fn new(key_system: SystemId) -> Self {
        Self {
            method: LicenseMethod::Post,
            url: String::new(),
            headers: BTreeMap::new(),
            payload: Vec::new(),
            access_token: None,
            content_metadata: None,
            key_system,
            anonymous: false,
        }
    }

    /// Whether the request goes through the content-metadata (secure-client) path.
    pub fn has_content_metadata(&self) -> bool {
        self.content_metadata.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Describes a content-protection record for one DRM system.
pub trait DrmHelper: Send + Sync {
    fn system_id(&self) -> SystemId;

    fn friendly_name(&self) -> &str {
        self.system_id().friendly_name()
    }

    /// Key delivery happens out-of-band; no license request is made.
    fn is_external_license(&self) -> bool {
        false
    }

    /// Init data to bind to a new CDM session.
    fn create_init_data(&self) -> Vec<u8>;

    /// Key identities advertised by the record, primary key first.
    fn key_ids(&self) -> Vec<KeyIdentity>;

    /// Content metadata requiring an access token, if any.
    fn drm_metadata(&self) -> Option<&str> {
        None
    }

    fn license_generate_timeout(&self) -> Duration {
        DEFAULT_LICENSE_GENERATE_TIMEOUT
    }

    fn key_process_timeout(&self) -> Duration {
        DEFAULT_KEY_PROCESS_TIMEOUT
    }

    /// Fill in `request` from a CDM challenge.
    ///
    /// A configured URL already present in `request` takes precedence over the
    /// CDM's destination URL.
    fn generate_license_request(&self, challenge: &Challenge, request: &mut LicenseRequest) {
        request.method = LicenseMethod::Post;
        if request.url.is_empty() {
            request.url = challenge.destination_url.clone();
        }
        request.headers.insert(
            "Content-Type".to_string(),
            vec!["application/octet-stream".to_string()],
        );
        request.payload = challenge.data.clone();
    }

    /// Post-process a license response before it is installed.
    fn transform_license_response(&self, response: Vec<u8>) -> Vec<u8> {
        response
    }

    /// Whether two helpers describe the same protection record.
    fn compare(&self, other: &dyn DrmHelper) -> bool {
        self.system_id() == other.system_id() && self.key_ids() == other.key_ids()
    }
}

/// A [`DrmHelper`] built from already-parsed protection data.
#[derive(Debug, Clone)]
pub struct GenericDrmHelper {
    system_id: SystemId,
    init_data: Vec<u8>,
    key_ids: Vec<KeyIdentity>,
    metadata: Option<String>,
    external_license: bool,
    license_generate_timeout: Duration,
    key_process_timeout: Duration,
}

impl GenericDrmHelper {
    pub fn new(system_id: SystemId, init_data: Vec<u8>, key_ids: Vec<KeyIdentity>) -> Self {
        Self {
            system_id,
            init_data,
            key_ids,
            metadata: None,
            external_license: false,
            license_generate_timeout: DEFAULT_LICENSE_GENERATE_TIMEOUT,
            key_process_timeout: DEFAULT_KEY_PROCESS_TIMEOUT,
        }
    }

    /// Attach content metadata (makes the request token-protected).
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_external_license(mut self, external: bool) -> Self {
        self.external_license = external;
        self
    }

    pub fn with_timeouts(mut self, generate: Duration, process: Duration) -> Self {
        self.license_generate_timeout = generate;
        self.key_process_timeout = process;
        self
    }
}

impl DrmHelper for GenericDrmHelper {
    fn system_id(&self) -> SystemId {
        self.system_id
    }

    fn is_external_license(&self) -> bool {
        self.external_license
    }

    fn create_init_data(&self) -> Vec<u8> {
        self.init_data.clone()
    }

    fn key_ids(&self) -> Vec<KeyIdentity> {
        self.key_ids.clone()
    }

    fn drm_metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    fn license_generate_timeout(&self) -> Duration {
        self.license_generate_timeout
    }

    fn key_process_timeout(&self) -> Duration {
        self.key_process_timeout
    }
}
