//! Content decryption module capabilities consumed by the session engine.
//!
//! The engine never performs cryptographic work itself. A [`CdmFactory`]
//! creates [`CdmSession`]s for a DRM system; each session generates license
//! challenges and installs license responses.
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::helper::{DrmHelper, SystemId};
use crate::session::SessionState;

/// CDM error reported when output protection is not engaged.
pub const HDCP_OUTPUT_PROTECTION_FAILURE: i32 = 4327;
/// CDM error reported when the connected output fails the HDCP compliance check.
pub const HDCP_COMPLIANCE_CHECK_FAILURE: i32 = 4328;

/// A license challenge produced by the CDM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    /// Opaque challenge bytes to send to the license server.
    pub data: Vec<u8>,
    /// License server URL suggested by the CDM, empty if none.
    pub destination_url: String,
}

/// One live session in the CDM.
///
/// Implementations use interior mutability; the session manager serializes
/// calls per slot.
pub trait CdmSession: Send + Sync {
    /// DRM system the session was created for.
    fn key_system(&self) -> SystemId;

    /// Bind protection init data (and optional custom data) to the session.
    ///
    /// On success the session stays in [`SessionState::Init`].
    fn initialize(&self, init_data: &[u8], custom_data: Option<&str>);

    /// Generate a license challenge, waiting at most `timeout`.
    ///
    /// A successful call moves the session to [`SessionState::Pending`].
    fn generate_challenge(&self, timeout: Duration) -> Option<Challenge>;

    /// Install a license response, waiting at most `timeout`.
    ///
    /// Returns the CDM error code (0 on success). The resulting state is
    /// available from [`CdmSession::state`].
    fn install_key(&self, license: &[u8], timeout: Duration) -> i32;

    /// Current license state.
    fn state(&self) -> SessionState;

    /// Block until the session reaches `state` or `timeout` elapses.
    fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool;
}

/// Creates CDM sessions.
pub trait CdmFactory: Send + Sync {
    /// Create a session for the DRM system described by `helper`.
    fn create_session(&self, helper: &dyn DrmHelper) -> Result<Arc<dyn CdmSession>>;
}

/// Output protection (HDCP) query.
pub trait OutputProtection: Send + Sync {
    /// Whether the current output satisfies the content's protection needs.
    fn is_output_compliant(&self, helper: &dyn DrmHelper) -> bool;
}

/// Output protection that always reports a compliant output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOutputProtection;

impl OutputProtection for NoOutputProtection {
    fn is_output_compliant(&self, _helper: &dyn DrmHelper) -> bool {
        true
    }
}

/// Whether a CDM error code signals an HDCP failure.
pub fn is_hdcp_error(cdm_error: i32) -> bool {
    cdm_error == HDCP_OUTPUT_PROTECTION_FAILURE || cdm_error == HDCP_COMPLIANCE_CHECK_FAILURE
}
