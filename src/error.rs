//! Error types for rsdrmsession.
//!
//! Every DRM failure the session engine can produce is a variant of [`Error`].
//! [`Error::kind`] reduces a value to a fieldless [`FailureKind`] for policy
//! decisions (failure escalation, retry hints).

use thiserror::Error;

use crate::session::SlotIndex;

/// Secure-client status reported when the license result never reached the
/// device because of a network failure.
pub const SECCLIENT_RESULT_HTTP_FAILURE_TIMEOUT: i32 = -7;

/// Main error type for rsdrmsession operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Every session slot is serving a primary session.
    #[error("No session slot available (all {max} slots are primary)")]
    NoCapacity { max: usize },

    /// The session manager was deactivated and refuses new sessions.
    #[error("DRM session manager is inactive")]
    SessionManagerInactive,

    /// The DRM helper could not provide a key identity.
    #[error("Failed to get key id from DRM helper")]
    FailedToGetKeyId,

    /// The key identity was already tried and failed.
    #[error("Key id {key_id} already failed at slot {slot}")]
    KeyPreviouslyFailed { key_id: String, slot: SlotIndex },

    /// The CDM could not create a session object.
    #[error("DRM session initialization failed: {0}")]
    DrmInitFailed(String),

    /// The CDM rejected the protection init data.
    #[error("DRM init data bind failed")]
    DataBindFailed,

    /// The CDM created a session without a session id.
    #[error("DRM session id is empty")]
    SessionIdEmpty,

    /// No usable license challenge came out of the CDM.
    #[error("License challenge generation failed")]
    ChallengeFailed,

    /// The access token service did not deliver a token.
    #[error("Failed to get access token (code {code})")]
    AccessTokenUnavailable { code: i32 },

    /// The license server refused the request for entitlement reasons.
    #[error("License authorization failed (status {status}, extended status {extended_status:?})")]
    AuthorizationFailed {
        status: i32,
        extended_status: Option<i32>,
    },

    /// The license request timed out.
    #[error("License request timed out")]
    LicenceTimeout,

    /// The license request failed for any other reason.
    #[error("License request failed (status {status})")]
    LicenceRequestFailed {
        status: i32,
        extended_status: Option<i32>,
    },

    /// The CDM refused the installed license.
    #[error("DRM key update failed (cdm error {cdm_error})")]
    KeyUpdateFailed { cdm_error: i32 },

    /// The license was installed but no usable key came out of it.
    #[error("Invalid DRM key")]
    InvalidKey,

    /// Output protection requirements are not met.
    #[error("HDCP compliance error")]
    HdcpComplianceError,

    /// The license request was aborted on purpose (teardown, stop).
    #[error("License request aborted")]
    SelfAbort,

    /// Configuration could not be loaded or is inconsistent.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML configuration decode error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON decode error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias for rsdrmsession operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Fieldless classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// See [`Error::NoCapacity`].
    NoCapacity,
    /// See [`Error::SessionManagerInactive`].
    SessionManagerInactive,
    /// See [`Error::FailedToGetKeyId`].
    FailedToGetKeyId,
    /// A previous acquisition for the same key identity failed.
    KeyPreviouslyFailed,
    /// The CDM session could not be created.
    DrmInitFailed,
    /// The CDM session did not initialize with the init data.
    DataBindFailed,
    /// The CDM created a session without a session id.
    SessionIdEmpty,
    /// The CDM did not produce a license challenge.
    ChallengeFailed,
    /// No access token could be obtained.
    AccessTokenUnavailable,
    /// The license server refused the account or device.
    AuthorizationFailed,
    /// The license server did not answer in time.
    LicenceTimeout,
    /// The license request failed with a server or transport error.
    LicenceRequestFailed,
    /// The CDM rejected the license.
    KeyUpdateFailed,
    /// The session ended in an unusable key state.
    InvalidKey,
    /// Output protection requirements were not met.
    HdcpComplianceError,
    /// The request was aborted by the engine itself.
    SelfAbort,
    /// Infrastructure errors (config, I/O, parsing).
    Internal,
}

impl FailureKind {
    /// Whether a player may retry the tune after this failure.
    ///
    /// Authorization, licence request/timeout and HDCP failures will not go
    /// away by retrying, so they are not retry-enabled. A licence request that
    /// failed with the secure-client network timeout status is the exception.
    #[must_use]
    pub fn is_retry_enabled(self, response_code: Option<i32>) -> bool {
        if self == FailureKind::LicenceRequestFailed
            && response_code == Some(SECCLIENT_RESULT_HTTP_FAILURE_TIMEOUT)
        {
            return true;
        }
        !matches!(
            self,
            FailureKind::AuthorizationFailed
                | FailureKind::LicenceRequestFailed
                | FailureKind::LicenceTimeout
                | FailureKind::HdcpComplianceError
        )
    }
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::NoCapacity { .. } => FailureKind::NoCapacity,
            Error::SessionManagerInactive => FailureKind::SessionManagerInactive,
            Error::FailedToGetKeyId => FailureKind::FailedToGetKeyId,
            Error::KeyPreviouslyFailed { .. } => FailureKind::KeyPreviouslyFailed,
            Error::DrmInitFailed(_) => FailureKind::DrmInitFailed,
            Error::DataBindFailed => FailureKind::DataBindFailed,
            Error::SessionIdEmpty => FailureKind::SessionIdEmpty,
            Error::ChallengeFailed => FailureKind::ChallengeFailed,
            Error::AccessTokenUnavailable { .. } => FailureKind::AccessTokenUnavailable,
            Error::AuthorizationFailed { .. } => FailureKind::AuthorizationFailed,
            Error::LicenceTimeout => FailureKind::LicenceTimeout,
            Error::LicenceRequestFailed { .. } => FailureKind::LicenceRequestFailed,
            Error::KeyUpdateFailed { .. } => FailureKind::KeyUpdateFailed,
            Error::InvalidKey => FailureKind::InvalidKey,
            Error::HdcpComplianceError => FailureKind::HdcpComplianceError,
            Error::SelfAbort => FailureKind::SelfAbort,
            _ => FailureKind::Internal,
        }
    }

    /// The transport or token status attached to this error, if any.
    #[must_use]
    pub fn response_code(&self) -> Option<i32> {
        match self {
            Error::AccessTokenUnavailable { code } => Some(*code),
            Error::AuthorizationFailed { status, .. }
            | Error::LicenceRequestFailed { status, .. } => Some(*status),
            Error::KeyUpdateFailed { cdm_error } => Some(*cdm_error),
            _ => None,
        }
    }

    /// Whether this error is a deliberate abort rather than a real failure.
    #[must_use]
    pub fn is_self_abort(&self) -> bool {
        matches!(self, Error::SelfAbort)
    }
}
