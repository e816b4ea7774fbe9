//! DRM events delivered to the player.
use tracing::{error, info, warn};

use crate::error::{Error, FailureKind};
use crate::session::{MediaType, SlotIndex};

/// A DRM failure surfaced to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmFailureEvent {
    pub kind: FailureKind,
    pub media_type: MediaType,
    /// Transport, token or CDM status attached to the failure.
    pub response_code: Option<i32>,
    /// Whether the player may retry the tune.
    pub is_retry_enabled: bool,
    pub description: String,
}

impl DrmFailureEvent {
    pub fn from_error(err: &Error, media_type: MediaType) -> Self {
        let kind = err.kind();
        let response_code = err.response_code();
        Self {
            kind,
            media_type,
            response_code,
            is_retry_enabled: kind.is_retry_enabled(response_code),
            description: err.to_string(),
        }
    }
}

/// Receives DRM notifications.
pub trait DrmEventListener: Send + Sync {
    /// A license for `media_type` was acquired (or reused) in `slot`.
    fn on_session_ready(&self, _media_type: MediaType, _slot: SlotIndex) {}

    /// A failure the player must handle.
    fn on_drm_failure(&self, event: &DrmFailureEvent);

    /// A failure that was recorded but not escalated.
    fn on_failure_suppressed(&self, _event: &DrmFailureEvent) {}

    /// A license renewal failed; playback continues on the old license.
    fn on_renewal_failed(&self, _slot: SlotIndex, _err: &Error) {}
}

/// Listener that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl DrmEventListener for TracingListener {
    fn on_session_ready(&self, media_type: MediaType, slot: SlotIndex) {
        info!("DRM session ready for {} at slot {}", media_type, slot);
    }

    fn on_drm_failure(&self, event: &DrmFailureEvent) {
        error!(
            "DRM failure for {}: {} (retry enabled: {})",
            event.media_type, event.description, event.is_retry_enabled
        );
    }

    fn on_failure_suppressed(&self, event: &DrmFailureEvent) {
        warn!(
            "Suppressed DRM failure for {}: {}",
            event.media_type, event.description
        );
    }

    fn on_renewal_failed(&self, slot: SlotIndex, err: &Error) {
        warn!("License renewal failed at slot {}: {}", slot, err);
    }
}
